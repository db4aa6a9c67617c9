use std::{
    fmt::{self, Debug},
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    limits::RateAdjuster,
    metrics::{MetricsSink, NoopMetrics},
    rate::RateFunction,
    window::RateCounter,
};

use bucket::TokenBucket;

mod bucket;

/// Limits the rate at which jobs start.
///
/// Jobs are metered through a token bucket. Acquire a token with [wait()](Self::wait) before
/// running a job, then report its result with [finish()](Self::finish).
///
/// A background task re-evaluates the limit once per rate change period: the [RateFunction]
/// provides a base rate for the elapsed time, which an optional [RateAdjuster] scales according
/// to the error fraction and throughput seen over the measurement window.
pub struct RateLimiter {
    name: String,
    wait_event: String,

    bucket: TokenBucket,
    rate_function: RateFunction,
    adjuster: Option<Box<dyn RateAdjuster>>,
    rate_change_period: Duration,
    started_at: Instant,

    control: Mutex<Control>,
    counters: Mutex<Counters>,

    metrics: Arc<dyn MetricsSink>,

    stop: CancellationToken,
    /// Cancelled once the background task has exited.
    terminated: CancellationToken,
}

/// Builds and starts a [RateLimiter].
pub struct RateLimiterBuilder {
    name: String,
    rate_function: RateFunction,
    adjuster: Option<Box<dyn RateAdjuster>>,
    rate_change_period: Duration,
    measurement_window: Duration,
    report_period: Duration,
    metrics: Arc<dyn MetricsSink>,
}

/// A snapshot of the state of a [RateLimiter].
///
/// Not guaranteed to be consistent under high concurrency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterState {
    limit: f64,
    base_limit: f64,
    adjustment: f64,
    in_flight: usize,
    successes: u64,
    errors: u64,
    started_in_window: u64,
    finished_in_window: u64,
    errors_in_window: u64,
}

/// Returned when waiting on a stopped [RateLimiter].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LimiterError {
    /// The limiter was stopped before a token became available.
    #[error("rate limiter stopped")]
    Stopped,
}

#[derive(Debug)]
struct Control {
    base_limit: f64,
    /// Multiplier from the adjuster, carried between periods.
    adjustment: f64,
}

#[derive(Debug)]
struct Counters {
    started: RateCounter,
    finished: RateCounter,
    errors: RateCounter,

    successes: u64,
    failures: u64,
    in_flight: usize,
}

impl RateLimiter {
    const DEFAULT_RATE_CHANGE_PERIOD: Duration = Duration::from_secs(5);
    const DEFAULT_MEASUREMENT_WINDOW: Duration = Duration::from_secs(60);
    const DEFAULT_REPORT_PERIOD: Duration = Duration::from_secs(20);

    /// Configure a limiter following `rate_function`.
    pub fn builder(name: impl Into<String>, rate_function: RateFunction) -> RateLimiterBuilder {
        RateLimiterBuilder {
            name: name.into(),
            rate_function,
            adjuster: None,
            rate_change_period: Self::DEFAULT_RATE_CHANGE_PERIOD,
            measurement_window: Self::DEFAULT_MEASUREMENT_WINDOW,
            report_period: Self::DEFAULT_REPORT_PERIOD,
            metrics: NoopMetrics::shared(),
        }
    }

    /// Wait until a job is allowed to start.
    ///
    /// Fails only if the limiter has been [stopped](Self::stop), including while waiting.
    pub async fn wait(&self) -> Result<(), LimiterError> {
        let start = Instant::now();

        tokio::select! {
            biased;
            _ = self.stop.cancelled() => return Err(LimiterError::Stopped),
            _ = self.bucket.acquire() => {}
        }

        self.metrics.record_duration(&self.wait_event, start.elapsed());

        let mut counters = self.counters();
        counters.started.incr();
        counters.in_flight += 1;

        Ok(())
    }

    /// Record the result of a job started after a [wait()](Self::wait).
    pub fn finish<T, E>(&self, label: &str, result: &Result<T, E>) {
        self.metrics.record_event(label, result.is_err());

        let mut counters = self.counters();
        counters.in_flight = counters.in_flight.saturating_sub(1);
        counters.finished.incr();
        if result.is_err() {
            counters.errors.incr();
            counters.failures += 1;
        } else {
            counters.successes += 1;
        }
    }

    /// Stop re-evaluating the limit, and release everyone waiting.
    ///
    /// Idempotent.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            tracing::info!(limiter = %self.name, "stopping rate limiter");
        }
        self.stop.cancel();
    }

    /// Whether [stop()](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once the background task which re-evaluates the limit has exited.
    pub async fn terminated(&self) {
        self.terminated.cancelled().await;
    }

    /// The rate currently allowed, in requests per second.
    pub fn limit(&self) -> f64 {
        self.bucket.rate()
    }

    /// The name used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current state of the limiter.
    pub fn state(&self) -> LimiterState {
        let (base_limit, adjustment) = {
            let control = self.control();
            (control.base_limit, control.adjustment)
        };
        let mut counters = self.counters();
        LimiterState {
            limit: self.limit(),
            base_limit,
            adjustment,
            in_flight: counters.in_flight,
            successes: counters.successes,
            errors: counters.failures,
            started_in_window: counters.started.count(),
            finished_in_window: counters.finished.count(),
            errors_in_window: counters.errors.count(),
        }
    }

    /// Throughput (completions per second) and error fraction over the measurement window.
    fn observe(&self) -> (f64, f64) {
        let mut counters = self.counters();
        let finished = counters.finished.count();
        let errors = counters.errors.count();

        // Zero finished jobs means zero errors, not NaN.
        let error_fraction = if finished == 0 {
            0.
        } else {
            (errors as f64 / finished as f64).min(1.)
        };

        let observed_for = self
            .started_at
            .elapsed()
            .min(counters.finished.window())
            .as_secs_f64();
        let throughput = if observed_for > 0. {
            finished as f64 / observed_for
        } else {
            0.
        };

        tracing::debug!(
            limiter = %self.name,
            errors,
            finished,
            error_fraction,
            throughput,
            "observed"
        );

        (throughput, error_fraction)
    }

    fn set_limit_for_period(&self, period_index: u32) {
        let seconds = f64::from(period_index) * self.rate_change_period.as_secs_f64();
        let base_limit = self.rate_function.at(seconds);

        let adjustment = match &self.adjuster {
            None => 1.,
            Some(adjuster) => {
                let (throughput, error_fraction) = self.observe();
                let previous = self.control().adjustment;

                let current_limit = base_limit * previous;
                let new_limit = adjuster.adjust(current_limit, throughput, error_fraction);

                if base_limit > 0. && new_limit.is_finite() {
                    new_limit / base_limit
                } else {
                    previous
                }
            }
        };

        {
            let mut control = self.control();
            control.base_limit = base_limit;
            control.adjustment = adjustment;
        }

        let limit = base_limit * adjustment;
        tracing::info!(
            limiter = %self.name,
            limit,
            period_index,
            seconds,
            "updating rate limit"
        );
        self.bucket.set_rate(limit);

        self.metrics.record_named_gauge("rateLimit", &self.name, limit);
        self.metrics.record_named_gauge("baseLimit", &self.name, base_limit);
        self.metrics
            .record_named_gauge("adaptiveAdjustment", &self.name, adjustment);
    }

    fn report(&self) {
        let (_, error_fraction) = self.observe();
        let counters = self.counters();

        self.metrics
            .record_named_gauge("errorFraction", &self.name, error_fraction);
        self.metrics
            .record_named_gauge("jobsInProgress", &self.name, counters.in_flight as f64);
        self.metrics
            .record_named_gauge("errorCount", &self.name, counters.failures as f64);
        self.metrics
            .record_named_gauge("successCount", &self.name, counters.successes as f64);
    }

    async fn run(
        limiter: Weak<Self>,
        stop: CancellationToken,
        terminated: CancellationToken,
        rate_change_period: Duration,
        report_period: Duration,
    ) {
        let _terminated = terminated.drop_guard();

        let now = Instant::now();
        let mut rate_ticks = interval_at(now + rate_change_period, rate_change_period);
        rate_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut report_ticks = interval_at(now + report_period, report_period);
        report_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut period_index: u32 = 0;
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = rate_ticks.tick() => {
                    let Some(limiter) = limiter.upgrade() else { break };
                    period_index = period_index.saturating_add(1);
                    limiter.set_limit_for_period(period_index);
                }
                _ = report_ticks.tick() => {
                    let Some(limiter) = limiter.upgrade() else { break };
                    limiter.report();
                }
            }
        }
    }

    fn control(&self) -> std::sync::MutexGuard<'_, Control> {
        self.control.lock().expect("limiter control lock poisoned")
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().expect("limiter counters lock poisoned")
    }
}

impl RateLimiterBuilder {
    /// How often the limit is re-evaluated.
    pub fn with_rate_change_period(mut self, period: Duration) -> Self {
        assert!(!period.is_zero(), "rate change period must be non-zero");
        self.rate_change_period = period;
        self
    }

    /// Scale the base rate according to observed errors.
    pub fn with_adjuster(mut self, adjuster: impl RateAdjuster + 'static) -> Self {
        self.adjuster = Some(Box::new(adjuster));
        self
    }

    /// The trailing window over which error fraction and throughput are measured.
    pub fn with_measurement_window(mut self, window: Duration) -> Self {
        assert!(!window.is_zero(), "measurement window must be non-zero");
        self.measurement_window = window;
        self
    }

    /// How often summary gauges are reported.
    pub fn with_report_period(mut self, period: Duration) -> Self {
        assert!(!period.is_zero(), "report period must be non-zero");
        self.report_period = period;
        self
    }

    /// Where events, wait times and limit gauges are reported.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Create the limiter and spawn its background task.
    ///
    /// The initial limit is the rate function evaluated at zero seconds, and the bucket starts
    /// with a full second of burst at that rate. Must be called from within a Tokio runtime.
    pub fn start(self) -> Arc<RateLimiter> {
        let window = self.measurement_window;
        let started_at = Instant::now();
        let limiter = Arc::new(RateLimiter {
            wait_event: format!("{}-wait", self.name),
            name: self.name,

            // Start full at the initial rate.
            bucket: TokenBucket::new(self.rate_function.at(0.)),
            rate_function: self.rate_function,
            adjuster: self.adjuster,
            rate_change_period: self.rate_change_period,
            started_at,

            control: Mutex::new(Control {
                base_limit: 0.,
                adjustment: 1.,
            }),
            counters: Mutex::new(Counters {
                // A shared origin keeps errors a subset of finished jobs.
                started: RateCounter::new(window, started_at),
                finished: RateCounter::new(window, started_at),
                errors: RateCounter::new(window, started_at),
                successes: 0,
                failures: 0,
                in_flight: 0,
            }),

            metrics: self.metrics,

            stop: CancellationToken::new(),
            terminated: CancellationToken::new(),
        });

        tracing::info!(limiter = %limiter.name, "starting rate limiter");
        limiter.set_limit_for_period(0);

        tokio::spawn(RateLimiter::run(
            Arc::downgrade(&limiter),
            limiter.stop.clone(),
            limiter.terminated.clone(),
            self.rate_change_period,
            self.report_period,
        ));

        limiter
    }
}

impl LimiterState {
    /// The rate currently allowed, in requests per second.
    pub fn limit(&self) -> f64 {
        self.limit
    }
    /// The rate from the rate function, before adjustment.
    pub fn base_limit(&self) -> f64 {
        self.base_limit
    }
    /// The multiplier applied to the base limit.
    pub fn adjustment(&self) -> f64 {
        self.adjustment
    }
    /// The number of jobs in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
    /// Jobs which succeeded, ever.
    pub fn successes(&self) -> u64 {
        self.successes
    }
    /// Jobs which failed, ever.
    pub fn errors(&self) -> u64 {
        self.errors
    }
    /// Jobs started within the measurement window.
    pub fn started_in_window(&self) -> u64 {
        self.started_in_window
    }
    /// Jobs finished within the measurement window.
    pub fn finished_in_window(&self) -> u64 {
        self.finished_in_window
    }
    /// Jobs failed within the measurement window.
    pub fn errors_in_window(&self) -> u64 {
        self.errors_in_window
    }
}

impl Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("rate_function", &self.rate_function)
            .field("adaptive", &self.adjuster.is_some())
            .field("rate_change_period", &self.rate_change_period)
            .field("stopped", &self.is_stopped())
            .field("(state)", &self.state())
            .finish()
    }
}
