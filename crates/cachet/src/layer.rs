//! `CacheLayer`: one store handle, one codec and one telemetry sink shared by
//! every strategy built from it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cachet_core::{
    CacheError, CacheResult, Codec, KeyValueStore, TelemetrySink, Ttl, TtlClass, TtlTable,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::AppConfig;
use crate::store::create_store;
use crate::strategy::write_behind::Drain;
use crate::strategy::{
    BatchWriter, CacheAside, CacheContext, CacheStats, CacheWarmer, RateLimitPolicy, RateLimiter,
    WriteBehind, WriteBehindSettings, WriteThrough,
};

/// Builder for [`CacheLayer`].
pub struct CacheLayerBuilder {
    store: Arc<dyn KeyValueStore>,
    codec: Codec,
    telemetry: Arc<dyn TelemetrySink>,
    ttls: TtlTable,
    rate_limit: RateLimitPolicy,
    write_behind: WriteBehindSettings,
    warm_concurrency: usize,
}

impl CacheLayerBuilder {
    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn ttl_table(mut self, ttls: TtlTable) -> Self {
        self.ttls = ttls;
        self
    }

    pub fn rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = policy;
        self
    }

    pub fn write_behind(mut self, settings: WriteBehindSettings) -> Self {
        self.write_behind = settings;
        self
    }

    pub fn warm_concurrency(mut self, concurrency: usize) -> Self {
        self.warm_concurrency = concurrency;
        self
    }

    pub fn build(self) -> CacheResult<CacheLayer> {
        self.write_behind.validate()?;
        if self.warm_concurrency == 0 {
            return Err(CacheError::configuration("warmer.concurrency must be > 0"));
        }

        Ok(CacheLayer {
            ctx: CacheContext::new(self.store, self.codec, self.telemetry),
            ttls: self.ttls,
            rate_limit: self.rate_limit,
            write_behind: self.write_behind,
            warm_concurrency: self.warm_concurrency,
            queues: parking_lot::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }
}

/// Composition root of the caching layer.
///
/// Construct one per process (or per test), share it behind an `Arc`, and
/// call [`shutdown`](Self::shutdown) before exit so queued writes reach the
/// system of record.
pub struct CacheLayer {
    ctx: CacheContext,
    ttls: TtlTable,
    rate_limit: RateLimitPolicy,
    write_behind: WriteBehindSettings,
    warm_concurrency: usize,
    queues: parking_lot::Mutex<Vec<Arc<dyn Drain>>>,
    closed: AtomicBool,
}

impl CacheLayer {
    pub fn builder(store: Arc<dyn KeyValueStore>) -> CacheLayerBuilder {
        CacheLayerBuilder {
            store,
            codec: Codec::default(),
            telemetry: cachet_core::telemetry::noop(),
            ttls: TtlTable::default(),
            rate_limit: RateLimitPolicy::default(),
            write_behind: WriteBehindSettings::default(),
            warm_concurrency: 1,
        }
    }

    /// Build the store and every setting from configuration.
    pub async fn from_config(
        config: &AppConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> CacheResult<Self> {
        config.validate()?;
        let store = create_store(config, Arc::clone(&telemetry)).await?;

        Self::builder(store)
            .codec(config.codec.to_codec()?)
            .telemetry(telemetry)
            .ttl_table(config.ttl.to_table()?)
            .rate_limit(config.rate_limit.to_policy()?)
            .write_behind(config.write_behind.to_settings())
            .warm_concurrency(config.warmer.concurrency)
            .build()
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.ctx.store
    }

    pub fn codec(&self) -> Codec {
        self.ctx.codec
    }

    pub fn telemetry(&self) -> &Arc<dyn TelemetrySink> {
        &self.ctx.telemetry
    }

    pub fn ttl(&self, class: TtlClass) -> Ttl {
        self.ttls.get(class)
    }

    pub fn ttl_table(&self) -> &TtlTable {
        &self.ttls
    }

    pub fn cache_aside(&self) -> CacheAside {
        CacheAside::from_context(self.ctx.clone())
    }

    pub fn write_through(&self) -> WriteThrough {
        WriteThrough::from_context(self.ctx.clone())
    }

    /// Create a write-behind queue flushing into `writer`.
    ///
    /// The queue is drained by [`shutdown`](Self::shutdown). Each call spawns
    /// its own flush task, so create one long-lived queue per writer and clone
    /// it. Queues that were shut down directly are dropped from the layer.
    pub fn write_behind<T>(&self, writer: Arc<dyn BatchWriter<T>>) -> CacheResult<WriteBehind<T>>
    where
        T: Serialize + Send + Sync + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::configuration("cache layer is shut down"));
        }
        let queue = WriteBehind::from_context(self.ctx.clone(), self.write_behind, writer)?;
        let mut queues = self.queues.lock();
        queues.retain(|q| !q.is_stopped());
        queues.push(Arc::new(queue.clone()));
        drop(queues);
        Ok(queue)
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::from_context(self.ctx.clone(), self.rate_limit)
    }

    pub fn warmer(&self) -> CacheWarmer {
        CacheWarmer::from_context(self.ctx.clone(), self.ttls.clone(), self.warm_concurrency)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats::from_context(self.ctx.clone())
    }

    /// Read and decode `key` without a loader.
    ///
    /// Unlike the strategies, store and decode failures are returned.
    pub async fn peek<T: DeserializeOwned>(&self, key: impl AsRef<str>) -> CacheResult<Option<T>> {
        let Some(bytes) = self.ctx.store.get(key.as_ref()).await? else {
            return Ok(None);
        };
        Ok(Some(self.ctx.codec.decode(&bytes)?))
    }

    /// Entries waiting in all write-behind queues.
    pub fn pending_writes(&self) -> usize {
        self.queues.lock().iter().map(|q| q.pending()).sum()
    }

    /// Drain every write-behind queue, then close the store.
    ///
    /// Returns how many queued writes could not be persisted. Calling it again
    /// is a no-op that returns 0.
    pub async fn shutdown(&self) -> usize {
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        tracing::info!("shutting down cache layer");

        let queues: Vec<Arc<dyn Drain>> = std::mem::take(&mut *self.queues.lock());
        let mut unflushed = 0;
        for queue in queues {
            unflushed += queue.shutdown().await;
        }

        self.ctx.store.close().await;
        if unflushed > 0 {
            tracing::warn!(unflushed, "cache layer closed with unflushed writes");
        } else {
            tracing::info!("cache layer closed");
        }
        unflushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_core::{ConnectionState, MemoryStore};

    #[tokio::test]
    async fn builder_rejects_zero_concurrency() {
        let result = CacheLayer::builder(Arc::new(MemoryStore::new()))
            .warm_concurrency(0)
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn peek_surfaces_decode_errors() {
        let store = Arc::new(MemoryStore::new());
        store
            .set_ex("user:1", b"{not json", Ttl::from_secs(60).unwrap())
            .await
            .unwrap();
        let layer = CacheLayer::builder(store).build().unwrap();

        assert!(matches!(
            layer.peek::<serde_json::Value>("user:1").await,
            Err(CacheError::Codec(_))
        ));
        assert_eq!(layer.peek::<serde_json::Value>("user:2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn shutdown_closes_store_once() {
        let store = Arc::new(MemoryStore::new());
        let layer = CacheLayer::builder(store.clone()).build().unwrap();

        assert_eq!(layer.shutdown().await, 0);
        assert_eq!(store.state(), ConnectionState::Closed);
        assert_eq!(layer.shutdown().await, 0);
    }

    #[tokio::test]
    async fn from_config_defaults_to_local_store() {
        let layer = CacheLayer::from_config(&AppConfig::default(), cachet_core::telemetry::noop())
            .await
            .unwrap();
        assert_eq!(layer.store().provider_name(), "memory");
        assert_eq!(layer.ttl(TtlClass::Session).as_secs(), 1800);
    }

    #[tokio::test]
    async fn stopped_queues_are_not_kept() {
        struct Discard;

        #[async_trait::async_trait]
        impl BatchWriter<u32> for Discard {
            async fn write_batch(
                &self,
                _batch: &[crate::strategy::QueuedWrite<u32>],
            ) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let layer = CacheLayer::builder(Arc::new(MemoryStore::new())).build().unwrap();
        let first = layer.write_behind::<u32>(Arc::new(Discard)).unwrap();
        first.shutdown().await;
        let _second = layer.write_behind::<u32>(Arc::new(Discard)).unwrap();

        assert_eq!(layer.queues.lock().len(), 1);
        assert_eq!(layer.shutdown().await, 0);
    }
}
