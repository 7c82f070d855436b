use crate::config::significance_thresholds::{MAJOR_MIN, MODERATE_MIN};
use crate::types::Significance;

/// Signed percentage change from `baseline` to `current`.
/// A zero baseline reads as +100% when anything is above it, else 0.
pub fn change_percent(baseline: f64, current: f64) -> f64 {
    if baseline == 0.0 {
        return if current > 0.0 { 100.0 } else { 0.0 };
    }
    (current - baseline) / baseline * 100.0
}

/// Classify an absolute change, highest tier first. Cutoffs are inclusive.
/// Returns `None` below the minor `threshold`.
pub fn classify(abs_change: f64, threshold: f64) -> Option<Significance> {
    if abs_change >= MAJOR_MIN {
        Some(Significance::Major)
    } else if abs_change >= MODERATE_MIN {
        Some(Significance::Moderate)
    } else if abs_change >= threshold {
        Some(Significance::Minor)
    } else {
        None
    }
}
