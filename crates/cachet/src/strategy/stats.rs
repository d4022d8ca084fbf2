use std::collections::HashMap;
use std::sync::Arc;

use cachet_core::{Codec, KeyValueStore, TelemetrySink};
use serde::Serialize;

use super::CacheContext;

/// Typed view of the store's INFO output.
///
/// Fields that are missing or unparseable default to zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreInfo {
    pub connected_clients: u64,
    pub used_memory: u64,
    pub used_memory_human: Option<String>,
    pub used_memory_peak_human: Option<String>,
    pub total_connections_received: u64,
    pub total_commands_processed: u64,
    pub instantaneous_ops_per_sec: u64,
    pub keyspace_hits: u64,
    pub keyspace_misses: u64,
    pub evicted_keys: u64,
}

impl StoreInfo {
    /// Parse a `key:value` INFO block. Section headers and blank lines are skipped.
    pub fn parse(raw: &str) -> Self {
        let fields: HashMap<&str, &str> = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once(':'))
            .collect();

        let num = |name: &str| -> u64 {
            fields
                .get(name)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0)
        };
        let text = |name: &str| fields.get(name).map(|v| v.trim().to_string());

        Self {
            connected_clients: num("connected_clients"),
            used_memory: num("used_memory"),
            used_memory_human: text("used_memory_human"),
            used_memory_peak_human: text("used_memory_peak_human"),
            total_connections_received: num("total_connections_received"),
            total_commands_processed: num("total_commands_processed"),
            instantaneous_ops_per_sec: num("instantaneous_ops_per_sec"),
            keyspace_hits: num("keyspace_hits"),
            keyspace_misses: num("keyspace_misses"),
            evicted_keys: num("evicted_keys"),
        }
    }
}

/// Keyspace hit rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HitRate {
    /// Percentage in `0.0..=100.0`; 0 when there were no lookups.
    pub hit_rate: f64,
    pub hits: u64,
    pub misses: u64,
    pub total: u64,
}

impl HitRate {
    pub fn from_counts(hits: u64, misses: u64) -> Self {
        let total = hits.saturating_add(misses);
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64 * 100.0
        };
        Self {
            hit_rate,
            hits,
            misses,
            total,
        }
    }
}

/// Read-only statistics. Store failures yield `None`, never an error.
#[derive(Clone)]
pub struct CacheStats {
    ctx: CacheContext,
}

impl CacheStats {
    pub fn new(store: Arc<dyn KeyValueStore>, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self::from_context(CacheContext::new(store, Codec::default(), telemetry))
    }

    pub(crate) fn from_context(ctx: CacheContext) -> Self {
        Self { ctx }
    }

    pub async fn get_info(&self) -> Option<StoreInfo> {
        match self.ctx.store.info().await {
            Ok(raw) => Some(StoreInfo::parse(&raw)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read store info");
                None
            }
        }
    }

    pub async fn get_hit_rate(&self) -> Option<HitRate> {
        let info = self.get_info().await?;
        let rate = HitRate::from_counts(info.keyspace_hits, info.keyspace_misses);
        self.ctx
            .telemetry
            .track_metric("CacheHitRate", rate.hit_rate, &[]);
        Some(rate)
    }
}
