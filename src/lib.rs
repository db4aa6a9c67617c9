//! Adaptive, rate-controlled load generation.
//!
//! A workload is a pool of workers repeatedly running jobs from a [JobSource], as fast as a
//! [RateLimiter] allows. The limiter's rate follows a [RateFunction] of elapsed time, optionally
//! scaled back when jobs start failing.

#![deny(missing_docs)]

#[cfg(doctest)]
use doc_comment::doctest;
#[cfg(doctest)]
doctest!("../README.md");

pub mod config;
mod limiter;
pub mod limits;
mod load;
pub mod metrics;
pub mod rate;
pub mod source;
mod window;

pub use config::{ConfigError, LoadConfig, PagerConfig, RateConfig};
pub use limiter::{LimiterError, LimiterState, RateLimiter, RateLimiterBuilder};
pub use limits::{ErrorFractionThreshold, RateAdjuster};
pub use load::LoadManager;
pub use metrics::{MetricsFacade, MetricsSink, NoopMetrics};
pub use rate::{RateFunction, RateFunctionError, Segment};
pub use source::{
    BoxError, FnSource, JobError, JobOutcome, JobSource, Page, PageMeta, PagedFetch, PagerSource,
    ProjectFetcher, RoundRobinSource,
};

/// Asserts that time elapsed since `$start` is within `$tolerance` of `$dur`.
#[macro_export]
#[cfg(test)]
macro_rules! assert_elapsed {
    ($start:expr, $dur:expr, $tolerance:expr) => {{
        let elapsed = $start.elapsed();
        let lower: std::time::Duration = $dur;

        assert!(
            elapsed >= lower && elapsed <= lower + $tolerance,
            "actual = {:?}, expected = {:?}",
            elapsed,
            lower
        );
    }};
}
