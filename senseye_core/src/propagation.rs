//! Log-distance path-loss model.
//!
//! `RSSI_expected(d) = -(10 * n * log10(d) + A)` with the path-loss exponent
//! `n` and reference loss `A` at one meter. Indoor inference uses n = 2.5;
//! calibration deliberately uses the free-space n = 2.0 so that any
//! obstruction shows up as excess attenuation.

/// Typical indoor path-loss exponent.
pub const INDOOR_EXPONENT: f64 = 2.5;

/// Free-space path-loss exponent (calibration / wall detection).
pub const FREE_SPACE_EXPONENT: f64 = 2.0;

/// Reference loss A at one meter, dB.
pub const REFERENCE_LOSS_DB: f64 = 45.0;

/// Distance floor; RSSI stronger than the 1 m reference never maps below it.
pub const MIN_DISTANCE_M: f64 = 0.1;

/// A log-distance propagation model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathLossModel {
    pub exponent: f64,
    pub reference_loss_db: f64,
}

impl PathLossModel {
    /// Indoor model used by live inference.
    pub fn indoor() -> Self {
        Self {
            exponent: INDOOR_EXPONENT,
            reference_loss_db: REFERENCE_LOSS_DB,
        }
    }

    /// Free-space model used during calibration, sharing A with indoor.
    pub fn free_space() -> Self {
        Self {
            exponent: FREE_SPACE_EXPONENT,
            reference_loss_db: REFERENCE_LOSS_DB,
        }
    }

    /// Expected RSSI in dBm at distance `d` meters.
    pub fn expected_rssi(&self, distance_m: f64) -> f64 {
        let d = distance_m.max(MIN_DISTANCE_M);
        -(10.0 * self.exponent * d.log10() + self.reference_loss_db)
    }

    /// Distance in meters implied by an RSSI, floored at [`MIN_DISTANCE_M`].
    pub fn distance_from_rssi(&self, rssi_dbm: f64) -> f64 {
        let exp = (-rssi_dbm - self.reference_loss_db) / (10.0 * self.exponent);
        10f64.powf(exp).max(MIN_DISTANCE_M)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn expected_rssi_at_one_meter_is_reference() {
        let model = PathLossModel::indoor();
        assert_relative_eq!(model.expected_rssi(1.0), -45.0);
    }

    #[test]
    fn stronger_rssi_means_shorter_distance() {
        let model = PathLossModel::indoor();
        assert!(model.distance_from_rssi(-40.0) < model.distance_from_rssi(-70.0));
    }

    #[test]
    fn distance_is_floored() {
        let model = PathLossModel::indoor();
        // Implausibly strong signal still maps to the floor, not below.
        assert_eq!(model.distance_from_rssi(0.0), MIN_DISTANCE_M);
    }

    proptest! {
        #[test]
        fn rssi_distance_round_trip(d in 0.1f64..100.0) {
            let model = PathLossModel::indoor();
            let rssi = model.expected_rssi(d);
            let back = model.distance_from_rssi(rssi);
            prop_assert!((back - d).abs() / d < 1e-9);
        }

        #[test]
        fn free_space_round_trip(d in 0.1f64..100.0) {
            let model = PathLossModel::free_space();
            let back = model.distance_from_rssi(model.expected_rssi(d));
            prop_assert!((back - d).abs() / d < 1e-9);
        }
    }
}
