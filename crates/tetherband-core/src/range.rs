//! In-range / out-of-range hysteresis.
//!
//! Entering `OutOfRange` needs `debounce_threshold` consecutive readings
//! beyond the limit. Leaving it needs one reading within the limit.

use crate::types::RangeState;

/// Transition signalled by one range observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeEvent {
    /// Debounce threshold reached while beyond the limit.
    ///
    /// `entered` is `true` only for the `InRange -> OutOfRange` transition;
    /// that is the only time the hardware indicator is written.
    OutOfRangeConfirmed {
        /// Whether this confirmation changed the state.
        entered: bool,
    },
    /// First reading back within the limit after being out of range.
    Recovered,
}

/// Per-beacon range state machine.
#[derive(Debug, Clone)]
pub struct RangeStateMachine {
    state: RangeState,
    consecutive_out_of_range: u32,
    debounce_threshold: u32,
}

impl RangeStateMachine {
    /// Start in range with the given debounce threshold (minimum 1).
    #[must_use]
    pub fn new(debounce_threshold: u32) -> Self {
        Self {
            state: RangeState::InRange,
            consecutive_out_of_range: 0,
            debounce_threshold: debounce_threshold.max(1),
        }
    }

    /// Current classification.
    #[must_use]
    pub const fn state(&self) -> RangeState {
        self.state
    }

    /// Consecutive readings beyond the limit since the last reset.
    #[must_use]
    pub const fn consecutive_out_of_range(&self) -> u32 {
        self.consecutive_out_of_range
    }

    /// Feed one distance measurement.
    pub fn observe(&mut self, distance_mm: f64, max_distance_mm: f64) -> Option<RangeEvent> {
        if distance_mm <= max_distance_mm {
            self.consecutive_out_of_range = 0;
            if self.state == RangeState::OutOfRange {
                self.state = RangeState::InRange;
                return Some(RangeEvent::Recovered);
            }
            return None;
        }

        self.consecutive_out_of_range += 1;
        if self.consecutive_out_of_range < self.debounce_threshold {
            return None;
        }

        self.consecutive_out_of_range = 0;
        let entered = self.state == RangeState::InRange;
        self.state = RangeState::OutOfRange;
        Some(RangeEvent::OutOfRangeConfirmed { entered })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: f64 = 3_000.0;

    #[test]
    fn test_single_bad_reading_does_not_flip() {
        let mut machine = RangeStateMachine::new(2);
        assert_eq!(machine.observe(5_000.0, MAX), None);
        assert_eq!(machine.state(), RangeState::InRange);
        assert_eq!(machine.consecutive_out_of_range(), 1);
    }

    #[test]
    fn test_second_bad_reading_confirms_once() {
        let mut machine = RangeStateMachine::new(2);
        machine.observe(5_000.0, MAX);
        assert_eq!(
            machine.observe(5_000.0, MAX),
            Some(RangeEvent::OutOfRangeConfirmed { entered: true })
        );
        assert_eq!(machine.state(), RangeState::OutOfRange);
        assert_eq!(machine.consecutive_out_of_range(), 0);
    }

    #[test]
    fn test_single_good_reading_recovers() {
        let mut machine = RangeStateMachine::new(2);
        machine.observe(5_000.0, MAX);
        machine.observe(5_000.0, MAX);
        assert_eq!(machine.observe(100.0, MAX), Some(RangeEvent::Recovered));
        assert_eq!(machine.state(), RangeState::InRange);
        assert_eq!(machine.observe(100.0, MAX), None);
    }

    #[test]
    fn test_good_reading_resets_debounce() {
        let mut machine = RangeStateMachine::new(2);
        machine.observe(5_000.0, MAX);
        assert_eq!(machine.observe(2_999.0, MAX), None);
        assert_eq!(machine.observe(5_000.0, MAX), None);
        assert_eq!(machine.state(), RangeState::InRange);
    }

    #[test]
    fn test_boundary_distance_is_in_range() {
        let mut machine = RangeStateMachine::new(1);
        assert_eq!(machine.observe(MAX, MAX), None);
        assert_eq!(machine.state(), RangeState::InRange);
    }

    #[test]
    fn test_reconfirmation_while_out_does_not_reenter() {
        let mut machine = RangeStateMachine::new(2);
        machine.observe(5_000.0, MAX);
        machine.observe(5_000.0, MAX);
        assert_eq!(machine.observe(5_000.0, MAX), None);
        assert_eq!(
            machine.observe(5_000.0, MAX),
            Some(RangeEvent::OutOfRangeConfirmed { entered: false })
        );
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let mut machine = RangeStateMachine::new(0);
        assert_eq!(
            machine.observe(5_000.0, MAX),
            Some(RangeEvent::OutOfRangeConfirmed { entered: true })
        );
    }
}
