//! Exponential decay for chunk quality and search scores.
//!
//! Pure functions, no I/O. The decay factor is
//! `exp(-age_days * ln(2) / half_life_days)`, so a chunk exactly one
//! half-life old scores half its original weight.

use crate::storage::Config;

/// Default half-life in days.
pub const DEFAULT_HALF_LIFE: f64 = 14.0;

/// Returns the exponential decay factor in `[0, 1]`.
///
/// Returns 1.0 when the age is non-positive or `half_life_days <= 0`.
#[must_use]
pub fn decay_factor(ts_end: f64, half_life_days: f64, now: f64) -> f64 {
    if half_life_days <= 0.0 {
        return 1.0;
    }
    let age_days = (now - ts_end) / 86_400.0;
    if age_days <= 0.0 {
        return 1.0;
    }
    (-age_days * std::f64::consts::LN_2 / half_life_days).exp()
}

/// Returns `quality * decay_factor(...)`.
#[must_use]
pub fn decayed_quality(quality: f64, ts_end: f64, half_life_days: f64, now: f64) -> f64 {
    quality * decay_factor(ts_end, half_life_days, now)
}

/// Extracts `(half_life_days, enabled)` from the config's `decay` section.
///
/// Returns `(0.0, false)` when decay is disabled or the half-life is
/// non-positive, so callers can treat `half_life_days == 0.0` as "off".
#[must_use]
pub fn effective_decay(config: &Config) -> (f64, bool) {
    let half_life = config.decay.half_life_days;
    if !config.decay.enabled || half_life <= 0.0 {
        return (0.0, false);
    }
    (half_life, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: f64 = 86_400.0;

    #[test]
    fn test_fresh_content_has_unit_factor() {
        let now = 1_000_000.0;
        assert!((decay_factor(now, 14.0, now) - 1.0).abs() < 1e-12);
        // Future timestamps clamp to 1.0 rather than boosting
        assert!((decay_factor(now + DAY, 14.0, now) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_half_life_point_is_exactly_half() {
        let now = 1_000_000_000.0;
        let factor = decay_factor(now - 14.0 * DAY, 14.0, now);
        assert!((factor - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_monotone_non_increasing_in_age() {
        let now = 1_000_000_000.0;
        let mut previous = 1.0;
        for days in 0..60 {
            let factor = decay_factor(now - f64::from(days) * DAY, 14.0, now);
            assert!(factor <= previous + 1e-12);
            previous = factor;
        }
    }

    #[test]
    fn test_zero_half_life_disables_decay() {
        assert!((decay_factor(0.0, 0.0, 1e9) - 1.0).abs() < 1e-12);
        assert!((decay_factor(0.0, -5.0, 1e9) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_decayed_quality_scales() {
        let now = 1_000_000_000.0;
        let q = decayed_quality(0.8, now - 14.0 * DAY, 14.0, now);
        assert!((q - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_effective_decay_from_config() {
        let mut config = Config::default();
        assert_eq!(effective_decay(&config), (14.0, true));
        config.decay.enabled = false;
        assert_eq!(effective_decay(&config), (0.0, false));
        config.decay.enabled = true;
        config.decay.half_life_days = 0.0;
        assert_eq!(effective_decay(&config), (0.0, false));
    }
}
