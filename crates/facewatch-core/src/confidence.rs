//! Distance-to-confidence rescaling and the per-identity acceptance bar.
//!
//! `score` is a linear rescaling of the raw classifier distance into
//! [0, 100]. It is not a calibrated probability.

use serde::Deserialize;

/// Distance at which confidence reaches 0.
pub const DEFAULT_MAX_DISTANCE: f64 = 100.0;
/// Acceptance threshold for an identity with no enrollment samples.
pub const DEFAULT_BASE_THRESHOLD: f32 = 65.0;
/// Threshold increase per enrollment sample.
pub const DEFAULT_PER_SAMPLE_INCREMENT: f32 = 2.0;
/// Upper bound on the acceptance threshold.
pub const DEFAULT_THRESHOLD_CAP: f32 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    pub max_distance: f64,
    pub base_threshold: f32,
    pub per_sample_increment: f32,
    pub threshold_cap: f32,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            max_distance: DEFAULT_MAX_DISTANCE,
            base_threshold: DEFAULT_BASE_THRESHOLD,
            per_sample_increment: DEFAULT_PER_SAMPLE_INCREMENT,
            threshold_cap: DEFAULT_THRESHOLD_CAP,
        }
    }
}

impl ConfidenceConfig {
    /// `clamp(0, 100, (1 - distance / max_distance) * 100)`.
    pub fn score(&self, raw_distance: f64) -> f32 {
        if raw_distance.is_nan() || self.max_distance <= 0.0 {
            return 0.0;
        }
        ((1.0 - raw_distance / self.max_distance) * 100.0).clamp(0.0, 100.0) as f32
    }

    /// `min(cap, base + increment * sample_count)`.
    pub fn threshold(&self, sample_count: usize) -> f32 {
        let raised = self.base_threshold + self.per_sample_increment * sample_count as f32;
        raised.min(self.threshold_cap)
    }

    /// A confidence is accepted only when it is strictly above the threshold.
    pub fn accepts(&self, confidence: f32, sample_count: usize) -> bool {
        confidence > self.threshold(sample_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_linear_in_range() {
        let c = ConfidenceConfig::default();
        for d in [0.0, 12.5, 20.0, 50.0, 99.0, 100.0] {
            let expected = ((1.0 - d / 100.0) * 100.0) as f32;
            assert!((c.score(d) - expected).abs() < 1e-4, "d={d}");
        }
        assert!((c.score(20.0) - 80.0).abs() < 1e-6);
    }

    #[test]
    fn test_score_clamps_out_of_range() {
        let c = ConfidenceConfig::default();
        assert_eq!(c.score(150.0), 0.0);
        assert_eq!(c.score(-10.0), 100.0);
        assert_eq!(c.score(f64::NAN), 0.0);
    }

    #[test]
    fn test_threshold_values() {
        let c = ConfidenceConfig::default();
        assert_eq!(c.threshold(0), 65.0);
        assert_eq!(c.threshold(6), 77.0);
        assert_eq!(c.threshold(7), 79.0);
        assert_eq!(c.threshold(8), 80.0);
        assert_eq!(c.threshold(1000), 80.0);
    }

    #[test]
    fn test_threshold_monotonic() {
        let c = ConfidenceConfig::default();
        let mut prev = c.threshold(0);
        for n in 1..50 {
            let t = c.threshold(n);
            assert!(t >= prev, "threshold({n}) = {t} < {prev}");
            prev = t;
        }
    }

    #[test]
    fn test_accept_is_strict() {
        let c = ConfidenceConfig::default();
        assert!(!c.accepts(65.0, 0));
        assert!(c.accepts(65.5, 0));
        assert!(c.accepts(80.0, 6));
        assert!(!c.accepts(80.0, 8));
    }

    #[test]
    fn test_overridden_constants() {
        let c = ConfidenceConfig {
            max_distance: 200.0,
            base_threshold: 50.0,
            per_sample_increment: 5.0,
            threshold_cap: 70.0,
        };
        assert!((c.score(100.0) - 50.0).abs() < 1e-6);
        assert_eq!(c.threshold(2), 60.0);
        assert_eq!(c.threshold(10), 70.0);
    }
}
