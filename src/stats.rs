use std::time::Duration;

/// Metrics sink capability: counters, gauges, timings. Swappable at
/// construction; the core never names a backend.
pub trait Stats: Send + Sync {
    fn count(&self, name: &str, value: i64);
    fn gauge(&self, name: &str, value: f64);
    fn timing(&self, name: &str, elapsed: Duration);
}

/// Discards everything; the default sink.
#[derive(Debug, Default)]
pub struct NopStats;

impl Stats for NopStats {
    fn count(&self, _name: &str, _value: i64) {}
    fn gauge(&self, _name: &str, _value: f64) {}
    fn timing(&self, _name: &str, _elapsed: Duration) {}
}

/// Emits every observation as a debug log line. Useful in development.
#[derive(Debug, Default)]
pub struct LogStats;

impl Stats for LogStats {
    fn count(&self, name: &str, value: i64) {
        tracing::debug!(stat = name, value, "count");
    }

    fn gauge(&self, name: &str, value: f64) {
        tracing::debug!(stat = name, value, "gauge");
    }

    fn timing(&self, name: &str, elapsed: Duration) {
        tracing::debug!(stat = name, elapsed_ms = elapsed.as_millis() as u64, "timing");
    }
}
