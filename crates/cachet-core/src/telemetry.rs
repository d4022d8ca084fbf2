//! Telemetry sink.
//!
//! Strategies report named events and numeric metrics here. A sink is
//! fire-and-forget: it returns nothing, so it cannot change the outcome of the
//! operation that reports to it.

use std::sync::Arc;

/// Key/value properties attached to an event or metric.
pub type Properties<'a> = &'a [(&'a str, String)];

pub trait TelemetrySink: Send + Sync {
    fn track_event(&self, name: &str, properties: Properties<'_>);

    fn track_metric(&self, name: &str, value: f64, properties: Properties<'_>);
}

/// Default sink; drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn track_event(&self, _name: &str, _properties: Properties<'_>) {}

    fn track_metric(&self, _name: &str, _value: f64, _properties: Properties<'_>) {}
}

/// Sink that logs every call through `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn track_event(&self, name: &str, properties: Properties<'_>) {
        tracing::debug!(event = %name, properties = ?properties, "telemetry event");
    }

    fn track_metric(&self, name: &str, value: f64, properties: Properties<'_>) {
        tracing::debug!(metric = %name, value, properties = ?properties, "telemetry metric");
    }
}

/// Fans out to several sinks.
#[derive(Clone, Default)]
pub struct FanoutTelemetry {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl FanoutTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl TelemetrySink for FanoutTelemetry {
    fn track_event(&self, name: &str, properties: Properties<'_>) {
        for sink in &self.sinks {
            sink.track_event(name, properties);
        }
    }

    fn track_metric(&self, name: &str, value: f64, properties: Properties<'_>) {
        for sink in &self.sinks {
            sink.track_metric(name, value, properties);
        }
    }
}

pub fn noop() -> Arc<dyn TelemetrySink> {
    Arc::new(NoopTelemetry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counting {
        events: Mutex<Vec<String>>,
    }

    impl TelemetrySink for Counting {
        fn track_event(&self, name: &str, _properties: Properties<'_>) {
            self.events.lock().unwrap().push(name.to_string());
        }

        fn track_metric(&self, name: &str, _value: f64, _properties: Properties<'_>) {
            self.events.lock().unwrap().push(name.to_string());
        }
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        let fanout = FanoutTelemetry::new()
            .with(a.clone())
            .with(b.clone())
            .with(noop());

        fanout.track_event("CacheSet", &[("key", "user:1".to_string())]);
        fanout.track_metric("CacheLatency", 1.5, &[]);

        assert_eq!(fanout.len(), 3);
        assert_eq!(*a.events.lock().unwrap(), vec!["CacheSet", "CacheLatency"]);
        assert_eq!(*b.events.lock().unwrap(), vec!["CacheSet", "CacheLatency"]);
    }
}
