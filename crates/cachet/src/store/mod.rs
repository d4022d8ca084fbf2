//! Store backends.
//!
//! Redis when enabled, otherwise an in-process [`MemoryStore`] so the layer
//! still works on a single node without infrastructure.

use std::sync::Arc;

use cachet_core::{CacheResult, KeyValueStore, MemoryStore, TelemetrySink};

use crate::config::AppConfig;

pub mod redis;
pub mod retry;

pub use self::redis::RedisStore;
pub use retry::RetryPolicy;

/// Create the store backend described by `config`.
pub async fn create_store(
    config: &AppConfig,
    telemetry: Arc<dyn TelemetrySink>,
) -> CacheResult<Arc<dyn KeyValueStore>> {
    if !config.redis.enabled {
        tracing::info!(
            max_entries = ?config.local.max_entries,
            "Redis disabled, using in-process store"
        );
        let store = match config.local.max_entries {
            Some(max) => MemoryStore::new().with_max_entries(max),
            None => MemoryStore::new(),
        };
        return Ok(Arc::new(store));
    }

    let store = RedisStore::connect(&config.redis, config.retry.to_policy(), telemetry).await?;
    tracing::info!(
        url = %config.redis.redacted_url(),
        key_prefix = %config.redis.key_prefix,
        pool_size = config.redis.pool_size,
        state = %store.state(),
        "Redis store initialized"
    );
    Ok(Arc::new(store))
}
