use serde::Deserialize;

use super::RateAdjuster;

/// Error-based rate adaptation.
///
/// Multiplicative increase, multiplicative decrease.
///
/// Increases the rate when:
/// 1. the error fraction is below `increase_max_error_fraction`, and
/// 2. the utilisation of the current limit is high.
///
/// Decreases the rate by a factor whenever the error fraction exceeds
/// `decrease_min_error_fraction`, however little of the limit is being used.
///
/// `decrease_min_error_fraction` should be at least `increase_max_error_fraction`, otherwise the
/// rate can flip between increasing and decreasing on the same error fraction.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ErrorFractionThreshold {
    /// Factor applied to the limit when increasing. Greater than 1.
    pub increase_ratio: f64,
    /// Only increase while the error fraction is below this.
    pub increase_max_error_fraction: f64,
    /// Factor applied to the limit when decreasing. Between 0 and 1.
    pub decrease_ratio: f64,
    /// Decrease whenever the error fraction is above this.
    pub decrease_min_error_fraction: f64,
    /// Never increase above this rate.
    pub max_rate: f64,
    /// Never decrease below this rate.
    pub min_rate: f64,
}

impl ErrorFractionThreshold {
    const DEFAULT_INCREASE_RATIO: f64 = 1.1;
    const DEFAULT_INCREASE_MAX_ERROR_FRACTION: f64 = 0.05;
    const DEFAULT_DECREASE_RATIO: f64 = 0.5;
    const DEFAULT_DECREASE_MIN_ERROR_FRACTION: f64 = 0.1;
    const DEFAULT_MAX_RATE: f64 = 1000.;
    const DEFAULT_MIN_RATE: f64 = 0.5;

    /// A threshold below which the limit won't be increased. 0.8 = 80%.
    const INCREASE_MIN_UTILISATION: f64 = 0.8;

    pub(crate) fn warn_if_oscillating(&self) {
        if self.decrease_min_error_fraction < self.increase_max_error_fraction {
            tracing::warn!(
                increase_max_error_fraction = self.increase_max_error_fraction,
                decrease_min_error_fraction = self.decrease_min_error_fraction,
                "error fraction thresholds overlap, the rate may oscillate"
            );
        }
    }
}

impl Default for ErrorFractionThreshold {
    fn default() -> Self {
        Self {
            increase_ratio: Self::DEFAULT_INCREASE_RATIO,
            increase_max_error_fraction: Self::DEFAULT_INCREASE_MAX_ERROR_FRACTION,
            decrease_ratio: Self::DEFAULT_DECREASE_RATIO,
            decrease_min_error_fraction: Self::DEFAULT_DECREASE_MIN_ERROR_FRACTION,
            max_rate: Self::DEFAULT_MAX_RATE,
            min_rate: Self::DEFAULT_MIN_RATE,
        }
    }
}

impl RateAdjuster for ErrorFractionThreshold {
    fn adjust(&self, current_limit: f64, current_rate: f64, error_fraction: f64) -> f64 {
        if error_fraction > self.decrease_min_error_fraction {
            // Keep backing off even when the rate is far below the limit.
            return self.min_rate.max(self.decrease_ratio * current_limit);
        }

        let utilisation_high = current_rate >= current_limit * Self::INCREASE_MIN_UTILISATION;
        if error_fraction < self.increase_max_error_fraction && utilisation_high {
            return self.max_rate.min(self.increase_ratio * current_limit);
        }

        current_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adjuster() -> ErrorFractionThreshold {
        ErrorFractionThreshold {
            increase_ratio: 1.1,
            increase_max_error_fraction: 0.05,
            decrease_ratio: 0.5,
            decrease_min_error_fraction: 0.1,
            max_rate: 10.,
            min_rate: 0.5,
        }
    }

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 0.01,
            "actual = {actual}, expected = {expected}"
        );
    }

    #[test]
    fn should_increase_hold_or_decrease_depending_on_error_fraction() {
        let f = adjuster();

        assert_approx(f.adjust(1., 0.9, 0.), 1.1);
        assert_approx(f.adjust(1., 0.9, 0.06), 1.);
        assert_approx(f.adjust(1., 0.9, 0.11), 0.5);
    }

    #[test]
    fn should_not_increase_when_using_lt_util_threshold() {
        let f = adjuster();

        assert_approx(f.adjust(1., 0.80, 0.01), 1.1);
        assert_approx(f.adjust(1., 0.79, 0.01), 1.);
    }

    #[test]
    fn should_increase_below_min_rate() {
        let f = adjuster();

        assert_approx(f.adjust(0.25, 0.24, 0.), 0.275);
        assert_approx(f.adjust(0.275, 0.27, 0.), 0.3025);
    }

    #[test]
    fn should_decrease_even_when_underused() {
        let f = adjuster();

        assert_approx(f.adjust(8., 0.1, 0.5), 4.);
    }

    #[test]
    fn should_respect_bounds() {
        let f = adjuster();

        assert_approx(f.adjust(9.5, 9.5, 0.), 10.);
        assert_approx(f.adjust(0.6, 0.6, 1.), 0.5);
    }

    #[test]
    fn closures_are_adjusters() {
        let double = |limit: f64, _rate: f64, _errors: f64| limit * 2.;

        assert_approx(double.adjust(3., 0., 0.), 6.);
    }
}
