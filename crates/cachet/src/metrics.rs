//! Prometheus metrics for the caching layer.
//!
//! [`MetricsTelemetry`] is a [`TelemetrySink`] that turns cache events and
//! measurements into counters, gauges and histograms on the `metrics` facade.
//! Only low-cardinality properties become labels; keys never do.

use cachet_core::{Properties, TelemetrySink};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_EVENTS_TOTAL: &str = "cache_events_total";
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_LOOKUP_DURATION_SECONDS: &str = "cache_lookup_duration_seconds";
    pub const CACHE_HIT_RATE_PERCENT: &str = "cache_hit_rate_percent";

    pub const RATE_LIMIT_CHECKS_TOTAL: &str = "rate_limit_checks_total";

    pub const WRITE_BEHIND_QUEUE_DEPTH: &str = "write_behind_queue_depth";
}

/// Event names that may appear as label values.
const KNOWN_EVENTS: &[&str] = &[
    "CacheConnecting",
    "CacheConnected",
    "CacheReady",
    "CacheError",
    "CacheReconnecting",
    "CacheClosed",
    "CacheDisconnected",
    "CacheSet",
    "CacheInvalidate",
    "WriteThroughSet",
    "WriteThroughDelete",
    "WriteBehindSet",
    "WriteBehindFlush",
    "WriteBehindFlushFailed",
    "CacheWarmed",
    "RateLimitReset",
];

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }
            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

/// Telemetry sink backed by the `metrics` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsTelemetry;

impl TelemetrySink for MetricsTelemetry {
    fn track_event(&self, name: &str, properties: Properties<'_>) {
        let mut event = event_label(name).to_string();
        if name == "CacheWarmed" {
            if let Some(warm_type) = property(properties, "type") {
                event = format!("{event}:{warm_type}");
            }
        }
        counter!(names::CACHE_EVENTS_TOTAL, "event" => event).increment(1);
    }

    fn track_metric(&self, name: &str, value: f64, properties: Properties<'_>) {
        match name {
            "CacheHit" => counter!(names::CACHE_HITS_TOTAL).increment(1),
            "CacheMiss" => counter!(names::CACHE_MISSES_TOTAL).increment(1),
            "CacheLatency" => {
                let hit = property(properties, "hit").unwrap_or("unknown").to_string();
                histogram!(names::CACHE_LOOKUP_DURATION_SECONDS, "hit" => hit)
                    .record(value / 1000.0);
            }
            "CacheHitRate" => gauge!(names::CACHE_HIT_RATE_PERCENT).set(value),
            "RateLimitCheck" => {
                let allowed = if value > 0.0 { "true" } else { "false" };
                counter!(names::RATE_LIMIT_CHECKS_TOTAL, "allowed" => allowed).increment(1);
            }
            "WriteBehindQueueDepth" => gauge!(names::WRITE_BEHIND_QUEUE_DEPTH).set(value),
            other => tracing::trace!(metric = %other, value, "unmapped telemetry metric"),
        }
    }
}

fn event_label(name: &str) -> &'static str {
    KNOWN_EVENTS
        .iter()
        .find(|known| **known == name)
        .copied()
        .unwrap_or("other")
}

fn property<'a>(properties: Properties<'a>, name: &str) -> Option<&'a str> {
    properties
        .iter()
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_label() {
        assert_eq!(event_label("CacheSet"), "CacheSet");
        assert_eq!(event_label("WriteBehindFlushFailed"), "WriteBehindFlushFailed");
        assert_eq!(event_label("user:42"), "other");
    }

    #[test]
    fn test_property_lookup() {
        let props = [("hit", "true".to_string()), ("key", "user:1".to_string())];
        assert_eq!(property(&props, "hit"), Some("true"));
        assert_eq!(property(&props, "missing"), None);
    }

    #[test]
    fn sink_without_recorder_is_noop() {
        let sink = MetricsTelemetry;
        sink.track_event("CacheWarmed", &[("type", "user_profiles".to_string())]);
        sink.track_metric("CacheLatency", 2.5, &[("hit", "false".to_string())]);
        sink.track_metric("Unknown", 1.0, &[]);
    }
}
