//! Pairing input obtained out-of-band from a tag scan.
//!
//! The identifier is opaque to the engine apart from one use: it names the
//! beacon's custom identify service, so it doubles as the scan filter.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::gatt::uuid_from_short;

/// A 128-bit UUID, or a 16/32-bit short form. `None` only if the pattern
/// fails to compile, in which case every identifier is rejected.
static PAIRING_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"^(?:[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}|[0-9A-Fa-f]{4}|[0-9A-Fa-f]{8})$",
    )
    .ok()
});

/// Errors raised while validating pairing input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PairingError {
    /// The identifier was blank.
    #[error("Pairing identifier cannot be empty")]
    Empty,

    /// The identifier is neither a 128-bit UUID nor a 16/32-bit short form.
    #[error("Invalid pairing identifier: '{0}'. Expected a UUID or a 4/8 digit hex short form.")]
    InvalidFormat(String),
}

/// Result alias for pairing validation.
pub type PairingResult<T> = std::result::Result<T, PairingError>;

/// Validated, upper-cased pairing identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PairingIdentifier(String);

impl PairingIdentifier {
    /// Validate and normalise a pairing identifier.
    ///
    /// # Errors
    ///
    /// Returns [`PairingError`] if the identifier is blank or malformed.
    pub fn new(raw: &str) -> PairingResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PairingError::Empty);
        }
        if !is_valid_pairing_identifier(trimmed) {
            return Err(PairingError::InvalidFormat(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_uppercase()))
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The identify service UUID this identifier names.
    #[must_use]
    pub fn service_uuid(&self) -> Uuid {
        if self.0.len() == 36 {
            // Format was checked in `new`.
            Uuid::parse_str(&self.0).unwrap_or_default()
        } else {
            u32::from_str_radix(&self.0, 16).map_or_else(|_| Uuid::nil(), uuid_from_short)
        }
    }

    /// Whether a discovered service is this beacon's identify service.
    #[must_use]
    pub fn matches_service(&self, service: &Uuid) -> bool {
        self.service_uuid() == *service
    }
}

impl fmt::Display for PairingIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PairingIdentifier {
    type Error = PairingError;

    fn try_from(value: String) -> PairingResult<Self> {
        Self::new(&value)
    }
}

impl From<PairingIdentifier> for String {
    fn from(value: PairingIdentifier) -> Self {
        value.0
    }
}

/// Check whether a string is an acceptable pairing identifier.
#[must_use]
pub fn is_valid_pairing_identifier(value: &str) -> bool {
    PAIRING_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(value))
}

/// A request to pair with (or reconnect to) one beacon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingRequest {
    /// Identifier read from the tag.
    pub identifier: PairingIdentifier,
    /// `true` when the tag marks a reconnect rather than a fresh pairing.
    pub reconnect: bool,
}

impl PairingRequest {
    /// A fresh pairing.
    #[must_use]
    pub const fn fresh(identifier: PairingIdentifier) -> Self {
        Self {
            identifier,
            reconnect: false,
        }
    }

    /// A reconnect to a beacon paired earlier.
    #[must_use]
    pub const fn reconnect(identifier: PairingIdentifier) -> Self {
        Self {
            identifier,
            reconnect: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_compiles() {
        assert!(PAIRING_PATTERN.is_some());
        assert!(is_valid_pairing_identifier("B0201F39-97BC-A2F5-4621-C9AB58C9BFCA"));
        assert!(is_valid_pairing_identifier("180a"));
        assert!(!is_valid_pairing_identifier("180A-"));
    }

    #[test]
    fn test_accepts_full_uuid_and_normalises_case() {
        let id = PairingIdentifier::new("b0201f39-97bc-a2f5-4621-c9ab58c9bfca").unwrap();
        assert_eq!(id.as_str(), "B0201F39-97BC-A2F5-4621-C9AB58C9BFCA");
        assert_eq!(
            id.service_uuid(),
            Uuid::parse_str("B0201F39-97BC-A2F5-4621-C9AB58C9BFCA").unwrap()
        );
    }

    #[test]
    fn test_accepts_short_forms() {
        let id = PairingIdentifier::new("180a").unwrap();
        assert_eq!(id.service_uuid(), uuid_from_short(0x180A));
        assert!(PairingIdentifier::new("0000FEAA").is_ok());
    }

    #[test]
    fn test_rejects_malformed_identifiers() {
        assert_eq!(PairingIdentifier::new("   "), Err(PairingError::Empty));
        assert!(matches!(
            PairingIdentifier::new("XB0201F39-97BC-A2F5-4621-C9AB58C9BFCA"),
            Err(PairingError::InvalidFormat(_))
        ));
        assert!(!is_valid_pairing_identifier("12345"));
    }

    #[test]
    fn test_matches_service() {
        let id = PairingIdentifier::new("B0201F39-97BC-A2F5-4621-C9AB58C9BFCA").unwrap();
        assert!(id.matches_service(&id.service_uuid()));
        assert!(!id.matches_service(&uuid_from_short(0x180F)));
    }

    #[test]
    fn test_serde_validates() {
        let ok: PairingIdentifier = serde_json::from_str("\"180f\"").unwrap();
        assert_eq!(ok.as_str(), "180F");
        assert!(serde_json::from_str::<PairingIdentifier>("\"nope\"").is_err());
    }
}
