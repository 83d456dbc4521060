//! User-facing alerts and their de-duplication.
//!
//! An alert is keyed by `(beacon, condition)`. Raising a condition that is
//! already outstanding is a no-op until it clears. Raising a condition clears
//! its complement first, so `BackInRange` retires `OutOfRange` and vice versa.
//!
//! Each beacon has one alert target per condition family (range, worn,
//! connection); a new alert in the same family replaces the previous one in
//! place.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::types::BeaconId;

/// Condition that can be alerted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    /// Confirmed beyond the maximum distance.
    OutOfRange,
    /// Back within the maximum distance.
    BackInRange,
    /// Bracelet taken off.
    BraceletRemoved,
    /// Bracelet put back on.
    BraceletOn,
    /// First connection attempt failed.
    ConnectFailed,
}

/// Group of conditions that share one alert target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionFamily {
    /// Range conditions.
    Range,
    /// Worn conditions.
    Worn,
    /// Connection conditions.
    Connection,
}

impl ConditionFamily {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Range => "range",
            Self::Worn => "worn",
            Self::Connection => "connection",
        }
    }
}

/// Sound attached to an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AlertSound {
    /// Needs attention now.
    Urgent,
    /// Status update.
    Informational,
}

impl ConditionKind {
    /// The condition this one retires when raised.
    #[must_use]
    pub const fn complement(self) -> Option<Self> {
        match self {
            Self::OutOfRange => Some(Self::BackInRange),
            Self::BackInRange => Some(Self::OutOfRange),
            Self::BraceletRemoved => Some(Self::BraceletOn),
            Self::BraceletOn => Some(Self::BraceletRemoved),
            Self::ConnectFailed => None,
        }
    }

    /// Family sharing an alert target.
    #[must_use]
    pub const fn family(self) -> ConditionFamily {
        match self {
            Self::OutOfRange | Self::BackInRange => ConditionFamily::Range,
            Self::BraceletRemoved | Self::BraceletOn => ConditionFamily::Worn,
            Self::ConnectFailed => ConditionFamily::Connection,
        }
    }

    /// Sound marker for this condition.
    #[must_use]
    pub const fn sound(self) -> AlertSound {
        match self {
            Self::OutOfRange | Self::BraceletRemoved => AlertSound::Urgent,
            Self::BackInRange | Self::BraceletOn | Self::ConnectFailed => {
                AlertSound::Informational
            }
        }
    }

    fn title(self, name: &str) -> String {
        match self {
            Self::OutOfRange => format!("{name} is out of range"),
            Self::BackInRange => format!("{name} is back in range"),
            Self::BraceletRemoved => format!("{name} removed their bracelet"),
            Self::BraceletOn => format!("{name} put their bracelet back on"),
            Self::ConnectFailed => format!("Failed to connect to {name}"),
        }
    }
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OutOfRange => "out_of_range",
            Self::BackInRange => "back_in_range",
            Self::BraceletRemoved => "bracelet_removed",
            Self::BraceletOn => "bracelet_on",
            Self::ConnectFailed => "connect_failed",
        };
        f.write_str(name)
    }
}

/// Alert target for one beacon and condition family.
#[must_use]
pub fn alert_target(beacon: BeaconId, family: ConditionFamily) -> String {
    format!("beacon-{}-{}", beacon.0, family.as_str())
}

/// A user-facing alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "target": "beacon-0-range",
    "beacon": 0,
    "kind": "out_of_range",
    "title": "Nick is out of range",
    "sound": "urgent",
    "raised_at_utc": "2025-01-15T03:30:00Z"
}))]
pub struct Alert {
    /// Replace-in-place key.
    pub target: String,
    /// Beacon the alert is about.
    pub beacon: BeaconId,
    /// Condition raised.
    pub kind: ConditionKind,
    /// Title shown to the user.
    pub title: String,
    /// Sound marker.
    pub sound: Option<AlertSound>,
    /// When the alert was raised.
    pub raised_at_utc: DateTime<Utc>,
}

/// Where alerts are shown.
pub trait AlertSink: Send + Sync {
    /// Show an alert, replacing any alert with the same target.
    fn present(&self, alert: &Alert);

    /// Remove the alert with this target, if shown.
    fn withdraw(&self, target: &str);
}

/// Idempotent record of outstanding `(beacon, condition)` pairs.
#[derive(Debug, Default)]
pub struct NotificationDedup {
    outstanding: HashSet<(BeaconId, ConditionKind)>,
}

impl NotificationDedup {
    /// Create an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a condition. Returns `true` only if it was not already outstanding.
    pub fn notify(&mut self, beacon: BeaconId, kind: ConditionKind) -> bool {
        self.outstanding.insert((beacon, kind))
    }

    /// Clear a condition. Returns `true` if it was outstanding.
    pub fn clear(&mut self, beacon: BeaconId, kind: ConditionKind) -> bool {
        self.outstanding.remove(&(beacon, kind))
    }

    /// Whether a condition is outstanding.
    #[must_use]
    pub fn is_outstanding(&self, beacon: BeaconId, kind: ConditionKind) -> bool {
        self.outstanding.contains(&(beacon, kind))
    }

    /// Drop every record for a beacon, returning what was outstanding.
    pub fn forget(&mut self, beacon: BeaconId) -> Vec<ConditionKind> {
        let mut removed = Vec::new();
        self.outstanding.retain(|(id, kind)| {
            if *id == beacon {
                removed.push(*kind);
                false
            } else {
                true
            }
        });
        removed
    }

    /// Number of outstanding records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    /// Whether nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }
}

/// Decides when an alert reaches the sink.
pub struct AlertDispatcher {
    dedup: NotificationDedup,
    sink: Arc<dyn AlertSink>,
}

impl AlertDispatcher {
    /// Create a dispatcher writing to `sink`.
    pub fn new(sink: Arc<dyn AlertSink>) -> Self {
        Self {
            dedup: NotificationDedup::new(),
            sink,
        }
    }

    /// Raise a condition for a beacon.
    ///
    /// Clears the complementary condition first. Returns `true` if an alert
    /// was presented, `false` if the condition was already outstanding.
    pub fn raise(&mut self, beacon: BeaconId, name: &str, kind: ConditionKind) -> bool {
        if let Some(complement) = kind.complement() {
            self.dedup.clear(beacon, complement);
        }
        if !self.dedup.notify(beacon, kind) {
            debug!(%beacon, condition = %kind, "Alert already outstanding");
            return false;
        }

        let alert = Alert {
            target: alert_target(beacon, kind.family()),
            beacon,
            kind,
            title: kind.title(name),
            sound: Some(kind.sound()),
            raised_at_utc: Utc::now(),
        };
        self.sink.present(&alert);
        true
    }

    /// Clear a condition and withdraw its alert.
    ///
    /// Returns `true` if the condition was outstanding.
    pub fn clear(&mut self, beacon: BeaconId, kind: ConditionKind) -> bool {
        if !self.dedup.clear(beacon, kind) {
            return false;
        }
        self.sink.withdraw(&alert_target(beacon, kind.family()));
        true
    }

    /// Withdraw every alert of a beacon that is being removed.
    pub fn forget_beacon(&mut self, beacon: BeaconId) {
        let mut families: Vec<ConditionFamily> = self
            .dedup
            .forget(beacon)
            .into_iter()
            .map(ConditionKind::family)
            .collect();
        families.dedup();
        for family in families {
            self.sink.withdraw(&alert_target(beacon, family));
        }
    }

    /// Whether a condition is outstanding.
    #[must_use]
    pub fn is_outstanding(&self, beacon: BeaconId, kind: ConditionKind) -> bool {
        self.dedup.is_outstanding(beacon, kind)
    }
}

/// Sink that keeps the currently shown alerts in memory and logs them.
///
/// The server exposes its contents; tests inspect it directly.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    active: Mutex<BTreeMap<String, Alert>>,
    presented: Mutex<u64>,
}

impl MemoryAlertSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Alerts currently shown, ordered by target.
    #[must_use]
    pub fn active(&self) -> Vec<Alert> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Total number of alerts presented so far.
    #[must_use]
    pub fn presented_count(&self) -> u64 {
        *self.presented.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AlertSink for MemoryAlertSink {
    fn present(&self, alert: &Alert) {
        match alert.sound {
            Some(AlertSound::Urgent) => {
                warn!(target_id = %alert.target, beacon = %alert.beacon, condition = %alert.kind, "{}", alert.title);
            }
            _ => {
                info!(target_id = %alert.target, beacon = %alert.beacon, condition = %alert.kind, "{}", alert.title);
            }
        }
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(alert.target.clone(), alert.clone());
        *self.presented.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn withdraw(&self, target: &str) {
        let removed = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(target);
        if removed.is_some() {
            debug!(target_id = %target, "Alert withdrawn");
        }
    }
}
