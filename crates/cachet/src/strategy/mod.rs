//! Read and write strategies layered over a [`KeyValueStore`].
//!
//! Every strategy treats store failures as "cache degraded": the caller gets
//! the authoritative answer (loader, writer) or a permissive one (rate
//! limiter), never the store error.

use std::sync::Arc;

use cachet_core::{Codec, KeyValueStore, TelemetrySink};

pub mod cache_aside;
pub mod rate_limit;
pub mod stats;
pub mod warmer;
pub mod write_behind;
pub mod write_through;

pub use cache_aside::CacheAside;
pub use rate_limit::{RateLimitDecision, RateLimitPolicy, RateLimiter};
pub use stats::{CacheStats, HitRate, StoreInfo};
pub use warmer::{CacheWarmer, WarmReport};
pub use write_behind::{
    BatchWriter, FlushOutcome, QueuedWrite, WriteBehind, WriteBehindSettings,
};
pub use write_through::WriteThrough;

/// Handles shared by every strategy of one layer.
#[derive(Clone)]
pub(crate) struct CacheContext {
    pub store: Arc<dyn KeyValueStore>,
    pub codec: Codec,
    pub telemetry: Arc<dyn TelemetrySink>,
}

impl CacheContext {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        codec: Codec,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            store,
            codec,
            telemetry,
        }
    }

    /// Report a degraded store operation as a `CacheError` event.
    pub fn report_error(&self, operation: &str, key: &str, error: &dyn std::fmt::Display) {
        self.telemetry.track_event(
            "CacheError",
            &[
                ("operation", operation.to_string()),
                ("key", key.to_string()),
                ("error", error.to_string()),
            ],
        );
    }
}
