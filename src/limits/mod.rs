//! Algorithms for adapting a target rate to observed errors.

mod threshold;

pub use threshold::ErrorFractionThreshold;

/// A feedback controller which adapts a rate limit based on what the limiter observes.
///
/// Called once per rate change period. The only memory an adjuster has is the limit it is
/// handed, which is the result of its previous decision applied to the current base rate.
pub trait RateAdjuster: Send + Sync {
    /// Compute a new limit.
    ///
    /// - `current_limit`: requests per second currently allowed.
    /// - `current_rate`: requests per second recently completed.
    /// - `error_fraction`: fraction of recently completed requests which failed, in `[0, 1]`.
    fn adjust(&self, current_limit: f64, current_rate: f64, error_fraction: f64) -> f64;
}

impl<F> RateAdjuster for F
where
    F: Fn(f64, f64, f64) -> f64 + Send + Sync,
{
    fn adjust(&self, current_limit: f64, current_rate: f64, error_fraction: f64) -> f64 {
        self(current_limit, current_rate, error_fraction)
    }
}
