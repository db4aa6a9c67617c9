//! Deserialisable workload configuration.
//!
//! ```json
//! {
//!   "workers_count": 8,
//!   "rate": {
//!     "rate_change_period_seconds": 5,
//!     "sinusoid": { "baseline": 20, "amplitude": 10, "period": 600, "phase": 0 },
//!     "adaptive_rate_adjuster": { "max_rate": 100 }
//!   }
//! }
//! ```

use std::{sync::Arc, time::Duration};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    limiter::RateLimiter,
    limits::ErrorFractionThreshold,
    load::LoadManager,
    metrics::MetricsSink,
    rate::{RateFunction, RateFunctionError},
    source::{JobSource, PagedFetch, PagerSource},
};

/// Invalid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// None of the rate shapes were configured.
    #[error("no rate shape configured: expected one of constant, sinusoid, spike or steps")]
    NoRateShape,

    /// The rate shape's parameters are invalid.
    #[error("invalid rate shape: {0}")]
    InvalidShape(#[from] RateFunctionError),

    /// The rate change period isn't a positive number of seconds.
    #[error("rate change period must be positive and finite, got {0} seconds")]
    InvalidPeriod(f64),

    /// A workload needs at least one worker.
    #[error("workers count must be positive")]
    NoWorkers,

    /// Pages need at least one item.
    #[error("page size must be positive")]
    NoPageSize,
}

/// How a workload's rate changes over time.
///
/// If more than one shape is given, the first of `constant`, `sinusoid`, `spike` and `steps`
/// wins.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RateConfig {
    /// How often the limit is re-evaluated.
    pub rate_change_period_seconds: f64,

    /// A fixed rate.
    pub constant: Option<ConstantRate>,
    /// A rate oscillating around a baseline.
    pub sinusoid: Option<SinusoidRate>,
    /// A repeating spike above a baseline.
    pub spike: Option<SpikeRate>,
    /// A cycle of fixed rates.
    pub steps: Option<StepsRate>,

    /// Adapt the rate to errors. Fields left out take their defaults.
    pub adaptive_rate_adjuster: Option<ErrorFractionThreshold>,
}

/// See [RateFunction::constant].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConstantRate {
    /// Requests per second. Must be non-negative.
    pub baseline: f64,
}

/// See [RateFunction::sinusoid].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SinusoidRate {
    /// The mean rate.
    pub baseline: f64,
    /// How far the rate swings either side of the baseline.
    pub amplitude: f64,
    /// Seconds per cycle.
    pub period: f64,
    /// In radians. Defaults to 0.
    #[serde(default)]
    pub phase: f64,
}

/// See [RateFunction::spike].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SpikeRate {
    /// The rate between spikes.
    pub baseline: f64,
    /// How long to stay at the baseline.
    pub low_period_seconds: f64,
    /// How far above the baseline the spike goes.
    pub height: f64,
    /// How long to hold at the top of the spike.
    pub high_period_seconds: f64,
    /// How long each ramp up or down takes.
    pub ramp_seconds: f64,
}

/// See [RateFunction::steps].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StepsRate {
    /// The rates to cycle through.
    pub values: Vec<f64>,
    /// How long each rate holds.
    pub step_seconds: f64,
}

/// A workload: how many workers, and how fast.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoadConfig {
    /// How many workers run jobs concurrently.
    pub workers_count: usize,
    /// How fast jobs start.
    pub rate: RateConfig,
}

/// A workload which pages through a remote collection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PagerConfig {
    /// Workers and rate.
    pub load: LoadConfig,
    /// How many items to request per job.
    pub page_size: usize,
}

impl RateConfig {
    /// The configured rate shape.
    pub fn rate_function(&self) -> Result<RateFunction, ConfigError> {
        if let Some(constant) = &self.constant {
            return Ok(RateFunction::try_constant(constant.baseline)?);
        }
        if let Some(sinusoid) = &self.sinusoid {
            return Ok(RateFunction::sinusoid(
                sinusoid.baseline,
                sinusoid.amplitude,
                sinusoid.period,
                sinusoid.phase,
            )?);
        }
        if let Some(spike) = &self.spike {
            return Ok(RateFunction::spike(
                spike.baseline,
                spike.low_period_seconds,
                spike.height,
                spike.high_period_seconds,
                spike.ramp_seconds,
            )?);
        }
        if let Some(steps) = &self.steps {
            return Ok(RateFunction::steps(
                steps.values.clone(),
                steps.step_seconds,
            )?);
        }
        Err(ConfigError::NoRateShape)
    }

    /// Create and start a rate limiter. Must be called from within a Tokio runtime.
    pub fn rate_limiter(
        &self,
        name: &str,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Arc<RateLimiter>, ConfigError> {
        let period = self.rate_change_period()?;
        let rate_function = self.rate_function()?;

        let mut builder = RateLimiter::builder(name, rate_function)
            .with_rate_change_period(period)
            .with_metrics(metrics);
        if let Some(adjuster) = &self.adaptive_rate_adjuster {
            adjuster.warn_if_oscillating();
            builder = builder.with_adjuster(adjuster.clone());
        }

        Ok(builder.start())
    }

    fn rate_change_period(&self) -> Result<Duration, ConfigError> {
        let seconds = self.rate_change_period_seconds;
        match Duration::try_from_secs_f64(seconds) {
            Ok(period) if !period.is_zero() => Ok(period),
            _ => Err(ConfigError::InvalidPeriod(seconds)),
        }
    }
}

impl LoadConfig {
    /// Start a workload running `source`. Must be called from within a Tokio runtime.
    pub fn load_manager(
        &self,
        name: &str,
        source: Arc<dyn JobSource>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<LoadManager, ConfigError> {
        if self.workers_count == 0 {
            return Err(ConfigError::NoWorkers);
        }
        let limiter = self.rate.rate_limiter(name, metrics)?;

        Ok(LoadManager::start(name, source, self.workers_count, limiter))
    }
}

impl PagerConfig {
    /// Start a workload paging through `fetch` from the beginning. Must be called from within a
    /// Tokio runtime.
    pub fn load_manager<F>(
        &self,
        name: &str,
        fetch: F,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<LoadManager, ConfigError>
    where
        F: PagedFetch + 'static,
    {
        if self.page_size == 0 {
            return Err(ConfigError::NoPageSize);
        }
        let source = PagerSource::new(name, fetch, 0, self.page_size).with_metrics(Arc::clone(&metrics));

        self.load.load_manager(name, Arc::new(source), metrics)
    }
}
