//! Capacitive-sense worn state.
//!
//! The bracelet pushes a one-byte event code on its identify characteristic
//! whenever skin contact changes. Every code is trusted as-is.

use thiserror::Error;

use crate::config::SensorCodes;
use crate::types::WornState;

/// Transition signalled by a capacitive-sense event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WornEvent {
    /// The bracelet was put on.
    PutOn,
    /// The bracelet was removed.
    Removed,
}

/// A notification payload that could not be applied.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WornPayloadError {
    /// The notification carried no bytes.
    #[error("capacitive sense notification was empty")]
    Empty,

    /// The first byte is not a known sensor code.
    #[error("unknown capacitive sense code 0x{0:02X}")]
    UnknownCode(u8),
}

/// Per-beacon worn state machine.
#[derive(Debug, Clone)]
pub struct WornStateMachine {
    state: WornState,
    codes: SensorCodes,
}

impl WornStateMachine {
    /// Start in `Off`, matching a freshly connected bracelet.
    #[must_use]
    pub fn new(codes: SensorCodes) -> Self {
        Self {
            state: WornState::Off,
            codes,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> WornState {
        self.state
    }

    /// Apply a raw notification payload.
    ///
    /// Returns the transition, if any. A code that matches the current state
    /// is accepted without an event.
    ///
    /// # Errors
    ///
    /// Returns [`WornPayloadError`] for empty payloads or unknown codes; the
    /// state is left untouched.
    pub fn apply(&mut self, payload: &[u8]) -> Result<Option<WornEvent>, WornPayloadError> {
        let code = *payload.first().ok_or(WornPayloadError::Empty)?;
        let next = if code == self.codes.worn_on {
            WornState::On
        } else if code == self.codes.worn_off {
            WornState::Off
        } else {
            return Err(WornPayloadError::UnknownCode(code));
        };

        if next == self.state {
            return Ok(None);
        }
        self.state = next;
        Ok(Some(match next {
            WornState::On => WornEvent::PutOn,
            WornState::Off => WornEvent::Removed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> WornStateMachine {
        WornStateMachine::new(SensorCodes::default())
    }

    #[test]
    fn test_put_on_then_removed() {
        let codes = SensorCodes::default();
        let mut worn = machine();
        assert_eq!(worn.apply(&[codes.worn_on]), Ok(Some(WornEvent::PutOn)));
        assert_eq!(worn.state(), WornState::On);
        assert_eq!(worn.apply(&[codes.worn_off]), Ok(Some(WornEvent::Removed)));
        assert_eq!(worn.state(), WornState::Off);
    }

    #[test]
    fn test_repeated_code_is_not_a_transition() {
        let codes = SensorCodes::default();
        let mut worn = machine();
        worn.apply(&[codes.worn_on]).unwrap();
        assert_eq!(worn.apply(&[codes.worn_on, 0xFF]), Ok(None));
    }

    #[test]
    fn test_malformed_payloads_leave_state_alone() {
        let codes = SensorCodes::default();
        let mut worn = machine();
        worn.apply(&[codes.worn_on]).unwrap();
        assert_eq!(worn.apply(&[]), Err(WornPayloadError::Empty));
        assert_eq!(worn.apply(&[0xEE]), Err(WornPayloadError::UnknownCode(0xEE)));
        assert_eq!(worn.state(), WornState::On);
    }
}
