//! RSSI burst filtering and distance estimation.
//!
//! A burst of raw RSSI samples collapses to its statistical mode, which
//! survives multipath spikes better than the mean. The mode then feeds the
//! log-distance path-loss model:
//!
//! ```text
//! distance_mm = 10 ^ ((tx_power - rssi) / path_loss_exponent)
//! ```

use std::collections::HashMap;

/// Pure distance estimator parameterised by the deployment's path-loss
/// exponent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProximityFilter {
    path_loss_exponent: f64,
}

impl ProximityFilter {
    /// Create a filter. The exponent is deployment configuration
    /// (reference deployments used 20.0 to 21.5).
    #[must_use]
    pub const fn new(path_loss_exponent: f64) -> Self {
        Self { path_loss_exponent }
    }

    /// The configured path-loss exponent.
    #[must_use]
    pub const fn path_loss_exponent(&self) -> f64 {
        self.path_loss_exponent
    }

    /// Estimate the distance in millimetres from a burst of samples.
    ///
    /// Returns `None` for an empty burst; callers must collect at least one
    /// sample before asking for a distance.
    #[must_use]
    pub fn estimate_distance(&self, samples: &[i16], tx_power: i8) -> Option<f64> {
        representative_rssi(samples)
            .map(|rssi| distance_from_rssi(rssi, tx_power, self.path_loss_exponent))
    }
}

/// Most frequent RSSI value in `samples`.
///
/// Ties go to the strongest reading (numerically greatest, i.e. closest).
#[must_use]
pub fn representative_rssi(samples: &[i16]) -> Option<i16> {
    let mut counts: HashMap<i16, usize> = HashMap::with_capacity(samples.len());
    for &sample in samples {
        *counts.entry(sample).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by(|(rssi_a, count_a), (rssi_b, count_b)| {
            count_a.cmp(count_b).then(rssi_a.cmp(rssi_b))
        })
        .map(|(rssi, _)| rssi)
}

/// Log-distance path-loss model, in millimetres.
///
/// The result is always non-negative and finite; overflow saturates at
/// `f64::MAX`.
#[must_use]
pub fn distance_from_rssi(rssi: i16, tx_power: i8, path_loss_exponent: f64) -> f64 {
    let loss = f64::from(tx_power) - f64::from(rssi);
    let distance = 10f64.powf(loss / path_loss_exponent);
    if distance.is_finite() {
        distance
    } else if distance.is_nan() {
        0.0
    } else {
        f64::MAX
    }
}

/// Human-readable distance on a natural scale (mm, cm, m, km), with at most
/// two fraction digits.
#[must_use]
pub fn format_distance(distance_mm: f64) -> String {
    let (value, unit) = if distance_mm < 10.0 {
        (distance_mm, "mm")
    } else if distance_mm < 1_000.0 {
        (distance_mm / 10.0, "cm")
    } else if distance_mm < 1_000_000.0 {
        (distance_mm / 1_000.0, "m")
    } else {
        (distance_mm / 1_000_000.0, "km")
    };
    let rounded = format!("{value:.2}");
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed} {unit}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_mode_picks_most_frequent() {
        assert_eq!(representative_rssi(&[-60, -60, -61]), Some(-60));
        assert_eq!(representative_rssi(&[-70, -55, -70, -70, -55]), Some(-70));
    }

    #[test]
    fn test_mode_tie_prefers_stronger_signal() {
        assert_eq!(representative_rssi(&[-60, -60, -61, -61]), Some(-60));
        assert_eq!(representative_rssi(&[-61, -61, -60, -60]), Some(-60));
    }

    #[test]
    fn test_mode_ignores_single_outlier_spike() {
        let mut samples = vec![-50; 19];
        samples.push(-95);
        assert_eq!(representative_rssi(&samples), Some(-50));
    }

    #[test]
    fn test_empty_burst_has_no_estimate() {
        assert_eq!(representative_rssi(&[]), None);
        assert_eq!(ProximityFilter::new(20.0).estimate_distance(&[], -12), None);
    }

    #[test]
    fn test_reference_distance() {
        let filter = ProximityFilter::new(20.0);
        let distance = filter.estimate_distance(&[-50; 20], -12).unwrap();
        assert!((distance - 79.432_823).abs() < 1e-3, "got {distance}");
    }

    #[test]
    fn test_distance_equal_power_is_one_millimetre() {
        assert!((distance_from_rssi(-12, -12, 21.5) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_distance_saturates_instead_of_overflowing() {
        let distance = distance_from_rssi(i16::MIN, i8::MAX, 0.01);
        assert!(distance.is_finite());
        assert_eq!(distance, f64::MAX);
    }

    #[test]
    fn test_format_distance_natural_scale() {
        assert_eq!(format_distance(5.0), "5 mm");
        assert_eq!(format_distance(79.432_823), "7.94 cm");
        assert_eq!(format_distance(3_000.0), "3 m");
        assert_eq!(format_distance(15_250.0), "15.25 m");
        assert_eq!(format_distance(2_500_000.0), "2.5 km");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Property: every non-empty burst yields a non-negative, finite distance.
        #[test]
        fn prop_distance_is_finite_and_non_negative(
            samples in prop::collection::vec(-127i16..=20, 1..64),
            tx_power in any::<i8>(),
            exponent in 1.0f64..100.0,
        ) {
            let distance = ProximityFilter::new(exponent)
                .estimate_distance(&samples, tx_power)
                .unwrap();
            prop_assert!(distance.is_finite());
            prop_assert!(distance >= 0.0);
        }

        /// Property: a stronger RSSI never increases the distance.
        #[test]
        fn prop_distance_monotonic_in_rssi(
            rssi in any::<i16>(),
            delta in 0i16..200,
            tx_power in any::<i8>(),
            exponent in 0.5f64..100.0,
        ) {
            let stronger = rssi.saturating_add(delta);
            let far = distance_from_rssi(rssi, tx_power, exponent);
            let near = distance_from_rssi(stronger, tx_power, exponent);
            prop_assert!(near <= far);
        }

        /// Property: the mode is always one of the samples.
        #[test]
        fn prop_mode_is_a_sample(samples in prop::collection::vec(any::<i16>(), 1..64)) {
            let mode = representative_rssi(&samples).unwrap();
            prop_assert!(samples.contains(&mode));
        }
    }
}
