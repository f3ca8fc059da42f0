//! RSSI to distance estimation.
//!
//! An empirical log-distance path-loss curve: the sample is compared against
//! the RSSI measured at a reference distance, and the ratio is mapped through
//! one of two branches. Results are relative units where `1.0` is roughly
//! the reference distance; they are only meaningful compared against the
//! thresholds in [`crate::config::ProximityConfig`].

/// Returned when a sample carries no usable signal.
pub const NO_READING: f64 = -1.0;

/// RSSI the controller reports when it has no measurement.
pub const NO_SIGNAL: i8 = 0;

/// Default RSSI at the reference distance, in dBm.
pub const DEFAULT_REFERENCE_RSSI: f64 = -58.0;

/// Calibrated distance model.
///
/// `ratio = rssi / reference_rssi`; below 1 the estimate is `ratio^10`,
/// otherwise `a * ratio^b + c`. The default constants are the widely used
/// fit `a = 0.89976`, `b = 7.7095`, `c = 0.111`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceModel {
    /// RSSI measured at the reference distance.
    pub reference_rssi: f64,
    /// Far-field multiplier.
    pub a: f64,
    /// Far-field exponent.
    pub b: f64,
    /// Far-field offset.
    pub c: f64,
}

impl Default for DistanceModel {
    fn default() -> Self {
        Self {
            reference_rssi: DEFAULT_REFERENCE_RSSI,
            a: 0.899_76,
            b: 7.709_5,
            c: 0.111,
        }
    }
}

impl DistanceModel {
    /// Estimate the distance for one sample.
    ///
    /// Returns [`NO_READING`] when `rssi` is zero.
    #[must_use]
    pub fn estimate(&self, rssi: i8) -> f64 {
        if rssi == NO_SIGNAL {
            return NO_READING;
        }

        let ratio = f64::from(rssi) / self.reference_rssi;
        if ratio < 1.0 {
            ratio.powi(10)
        } else {
            self.a * ratio.powf(self.b) + self.c
        }
    }
}

/// Estimate distance with the default calibration and the given reference RSSI.
#[must_use]
pub fn estimate_distance(rssi: i8, reference_rssi: f64) -> f64 {
    DistanceModel {
        reference_rssi,
        ..DistanceModel::default()
    }
    .estimate(rssi)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    #[test]
    fn test_zero_rssi_is_no_reading() {
        for reference in [-58.0, -40.0, -90.5, 1.0] {
            assert_eq!(estimate_distance(0, reference), NO_READING);
        }
    }

    #[test]
    fn test_reference_rssi_hits_upper_branch() {
        let d = estimate_distance(-58, DEFAULT_REFERENCE_RSSI);
        let model = DistanceModel::default();
        assert!((d - (model.a + model.c)).abs() < EPSILON);
        assert!((d - 1.010_76).abs() < EPSILON);
    }

    #[test]
    fn test_near_field_branch() {
        let d = estimate_distance(-40, DEFAULT_REFERENCE_RSSI);
        let ratio = 40.0_f64 / 58.0;
        assert!(ratio < 1.0);
        assert!((d - ratio.powi(10)).abs() < EPSILON);
        assert!(d > 0.02 && d < 0.03);
    }

    #[test]
    fn test_upper_branch_is_monotonic() {
        let model = DistanceModel::default();
        let mut previous = model.estimate(-58);
        for rssi in (-127..=-59).rev() {
            let d = model.estimate(rssi);
            assert!(d >= previous, "estimate({rssi}) = {d} < {previous}");
            previous = d;
        }
    }

    #[test]
    fn test_departure_band_exceeds_default_threshold() {
        let model = DistanceModel::default();
        for rssi in -75..=-71 {
            assert!(model.estimate(rssi) >= 2.0, "rssi {rssi}");
        }
    }

    #[test]
    fn test_custom_calibration() {
        let model = DistanceModel {
            reference_rssi: -60.0,
            a: 1.0,
            b: 2.0,
            c: 0.0,
        };
        assert!((model.estimate(-120) - 4.0).abs() < EPSILON);
    }
}
