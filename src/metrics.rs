//! Where load generation events are reported.
//!
//! Every component takes an `Arc<dyn MetricsSink>` rather than writing to global registries.
//! Recording is fire-and-forget: a sink can't influence control flow.

use std::{fmt::Debug, sync::Arc, time::Duration};

/// Receives counters, gauges and durations emitted during load generation.
pub trait MetricsSink: Debug + Send + Sync {
    /// Count one event of `event_type`.
    fn record_event(&self, event_type: &str, is_error: bool);

    /// Set a gauge keyed by `event_type`.
    fn record_gauge(&self, event_type: &str, value: f64);

    /// Set a gauge keyed by `event_type` and `name`, e.g. a workload name.
    fn record_named_gauge(&self, event_type: &str, name: &str, value: f64);

    /// Observe how long something of `event_type` took.
    fn record_duration(&self, event_type: &str, duration: Duration);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl NoopMetrics {
    /// A shareable no-op sink.
    pub fn shared() -> Arc<dyn MetricsSink> {
        Arc::new(Self)
    }
}

impl MetricsSink for NoopMetrics {
    fn record_event(&self, _event_type: &str, _is_error: bool) {}
    fn record_gauge(&self, _event_type: &str, _value: f64) {}
    fn record_named_gauge(&self, _event_type: &str, _name: &str, _value: f64) {}
    fn record_duration(&self, _event_type: &str, _duration: Duration) {}
}

/// Forwards to whichever recorder is installed for the `metrics` crate facade.
///
/// | Metric | Labels |
/// |---|---|
/// | `loadgen_event_counter` | `type`, `iserror` |
/// | `loadgen_event_gauge` | `type` |
/// | `loadgen_named_event_gauge` | `type`, `name` |
/// | `loadgen_event_histogram` (milliseconds) | `type` |
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsFacade;

impl MetricsSink for MetricsFacade {
    fn record_event(&self, event_type: &str, is_error: bool) {
        let is_error = if is_error { "true" } else { "false" };
        ::metrics::counter!(
            "loadgen_event_counter",
            "type" => event_type.to_owned(),
            "iserror" => is_error
        )
        .increment(1);
    }

    fn record_gauge(&self, event_type: &str, value: f64) {
        ::metrics::gauge!("loadgen_event_gauge", "type" => event_type.to_owned()).set(value);
    }

    fn record_named_gauge(&self, event_type: &str, name: &str, value: f64) {
        ::metrics::gauge!(
            "loadgen_named_event_gauge",
            "type" => event_type.to_owned(),
            "name" => name.to_owned()
        )
        .set(value);
    }

    fn record_duration(&self, event_type: &str, duration: Duration) {
        ::metrics::histogram!("loadgen_event_histogram", "type" => event_type.to_owned())
            .record(duration.as_secs_f64() * 1000.);
    }
}
