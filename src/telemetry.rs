//! Counters, compiled out unless the `metrics` feature is enabled.

/// `tracing` target for every event emitted by this crate.
pub(crate) const TARGET: &str = "webhook_delivery";

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}
