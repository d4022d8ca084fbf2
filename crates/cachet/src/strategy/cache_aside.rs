use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use cachet_core::{Codec, KeyValueStore, TelemetrySink, Ttl};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::CacheContext;

/// Read-through caching with a caller-supplied loader.
///
/// The store is an optimization only: on any store or decode failure the
/// loader's answer is returned as if the cache were cold.
#[derive(Clone)]
pub struct CacheAside {
    ctx: CacheContext,
}

impl CacheAside {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        codec: Codec,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self::from_context(CacheContext::new(store, codec, telemetry))
    }

    pub(crate) fn from_context(ctx: CacheContext) -> Self {
        Self { ctx }
    }

    /// Return the cached value for `key`, or call `loader` and cache its result.
    ///
    /// The loader runs at most once per call. `Ok(None)` from the loader is
    /// returned as-is and nothing is cached. Loader errors propagate unchanged.
    pub async fn get<T, F, Fut, E>(
        &self,
        key: impl AsRef<str>,
        loader: F,
        ttl: Ttl,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let key = key.as_ref();
        let started = Instant::now();

        match self.ctx.store.get(key).await {
            Ok(Some(bytes)) => match self.ctx.codec.decode::<T>(&bytes) {
                Ok(value) => {
                    self.record_lookup(key, true, started);
                    tracing::debug!(key = %key, "cache hit");
                    return Ok(Some(value));
                }
                Err(e) => {
                    // Corrupted entry; reload and overwrite it.
                    tracing::warn!(key = %key, error = %e, "failed to decode cached value, reloading");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache read failed, falling back to loader");
                self.ctx.report_error("get", key, &e);
                return loader().await;
            }
        }

        self.record_lookup(key, false, started);
        tracing::debug!(key = %key, "cache miss");

        let loaded = loader().await?;
        if let Some(value) = &loaded {
            self.populate(key, value, ttl).await;
        }
        Ok(loaded)
    }

    /// Remove `key`. Best-effort: failures are logged.
    pub async fn invalidate(&self, key: impl AsRef<str>) {
        let key = key.as_ref();
        match self.ctx.store.del(key).await {
            Ok(removed) => {
                tracing::debug!(key = %key, removed, "cache invalidated");
                self.ctx
                    .telemetry
                    .track_event("CacheInvalidate", &[("key", key.to_string())]);
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache invalidation failed");
                self.ctx.report_error("invalidate", key, &e);
            }
        }
    }

    async fn populate<T: Serialize>(&self, key: &str, value: &T, ttl: Ttl) {
        let bytes = match self.ctx.codec.encode(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to encode loaded value, not caching");
                return;
            }
        };

        match self.ctx.store.set_ex(key, &bytes, ttl).await {
            Ok(()) => self.ctx.telemetry.track_event(
                "CacheSet",
                &[
                    ("key", key.to_string()),
                    ("ttl", ttl.as_secs().to_string()),
                    ("size", bytes.len().to_string()),
                ],
            ),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to cache loaded value");
                self.ctx.report_error("set", key, &e);
            }
        }
    }

    fn record_lookup(&self, key: &str, hit: bool, started: Instant) {
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let name = if hit { "CacheHit" } else { "CacheMiss" };
        let telemetry = &self.ctx.telemetry;
        telemetry.track_metric(name, 1.0, &[("key", key.to_string())]);
        telemetry.track_metric("CacheLatency", latency_ms, &[("hit", hit.to_string())]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_core::MemoryStore;
    use cachet_core::telemetry::noop;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
    }

    fn ttl() -> Ttl {
        Ttl::from_secs(60).unwrap()
    }

    #[tokio::test]
    async fn absent_values_are_not_cached() {
        let store = Arc::new(MemoryStore::new());
        let cache = CacheAside::new(store.clone(), Codec::default(), noop());

        let value: Option<Profile> = cache
            .get("user:missing", || async { Ok::<_, std::convert::Infallible>(None) }, ttl())
            .await
            .unwrap();

        assert_eq!(value, None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn corrupted_entry_is_reloaded_and_overwritten() {
        let store = Arc::new(MemoryStore::new());
        store.set_ex("user:1", b"GZIP:not base64!", ttl()).await.unwrap();
        let cache = CacheAside::new(store.clone(), Codec::default(), noop());
        let calls = AtomicUsize::new(0);
        let counter = &calls;

        let value = cache
            .get(
                "user:1",
                || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::convert::Infallible>(Some(Profile { name: "Ada".into() }))
                },
                ttl(),
            )
            .await
            .unwrap();

        assert_eq!(value.unwrap().name, "Ada");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stored = store.get("user:1").await.unwrap().unwrap();
        assert_eq!(stored, br#"{"name":"Ada"}"#);
    }

    #[tokio::test]
    async fn loader_errors_propagate() {
        let store = Arc::new(MemoryStore::new());
        let cache = CacheAside::new(store.clone(), Codec::default(), noop());

        let err = cache
            .get::<Profile, _, _, _>("user:1", || async { Err("db down") }, ttl())
            .await
            .unwrap_err();

        assert_eq!(err, "db down");
        assert!(store.is_empty());
    }
}
