use std::future::Future;
use std::sync::Arc;

use cachet_core::{Codec, KeyValueStore, TelemetrySink, Ttl};
use serde::Serialize;

use super::CacheContext;

/// Synchronous write to the system of record, then to the cache.
///
/// The cache is only touched after the writer succeeded, so it never holds a
/// value that failed to persist.
#[derive(Clone)]
pub struct WriteThrough {
    ctx: CacheContext,
}

impl WriteThrough {
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

    /// Persist `data` with `writer`, then cache it under `key`.
    ///
    /// Writer errors propagate unchanged and leave the cache untouched. A
    /// failed cache write is logged; the writer's result is still returned.
    pub async fn set<T, W, Fut, R, E>(
        &self,
        key: impl AsRef<str>,
        data: T,
        writer: W,
        ttl: Ttl,
    ) -> Result<R, E>
    where
        T: Serialize,
        W: FnOnce(T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let key = key.as_ref();
        // Encoded up front; `data` moves into the writer.
        let encoded = self.ctx.codec.encode(&data);

        let written = writer(data).await?;

        match encoded {
            Ok(bytes) => match self.ctx.store.set_ex(key, &bytes, ttl).await {
                Ok(()) => {
                    tracing::debug!(key = %key, "write-through cached");
                    self.ctx.telemetry.track_event(
                        "WriteThroughSet",
                        &[("key", key.to_string()), ("ttl", ttl.as_secs().to_string())],
                    );
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "write-through cache update failed");
                    self.ctx.report_error("set", key, &e);
                }
            },
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "write-through encode failed, cache not updated");
            }
        }

        Ok(written)
    }

    /// Delete through `deleter`, then drop the cache entry (best-effort).
    pub async fn delete<D, Fut, R, E>(&self, key: impl AsRef<str>, deleter: D) -> Result<R, E>
    where
        D: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let key = key.as_ref();
        let deleted = deleter().await?;

        match self.ctx.store.del(key).await {
            Ok(_) => {
                tracing::debug!(key = %key, "write-through deleted");
                self.ctx
                    .telemetry
                    .track_event("WriteThroughDelete", &[("key", key.to_string())]);
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "write-through cache delete failed");
                self.ctx.report_error("delete", key, &e);
            }
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_core::MemoryStore;
    use cachet_core::telemetry::noop;

    fn ttl() -> Ttl {
        Ttl::from_secs(60).unwrap()
    }

    #[tokio::test]
    async fn caches_after_successful_write() {
        let store = Arc::new(MemoryStore::new());
        let wt = WriteThrough::new(store.clone(), Codec::default(), noop());

        let id = wt
            .set("org:7", vec![1, 2, 3], |v| async move { Ok::<_, String>(v.len()) }, ttl())
            .await
            .unwrap();

        assert_eq!(id, 3);
        assert_eq!(store.get("org:7").await.unwrap().unwrap(), b"[1,2,3]");
    }

    #[tokio::test]
    async fn failed_delete_keeps_cache_entry() {
        let store = Arc::new(MemoryStore::new());
        store.set_ex("org:7", b"1", ttl()).await.unwrap();
        let wt = WriteThrough::new(store.clone(), Codec::default(), noop());

        let err = wt
            .delete("org:7", || async { Err::<(), _>("constraint violation") })
            .await
            .unwrap_err();

        assert_eq!(err, "constraint violation");
        assert!(store.get("org:7").await.unwrap().is_some());

        wt.delete("org:7", || async { Ok::<_, &str>(()) }).await.unwrap();
        assert!(store.get("org:7").await.unwrap().is_none());
    }
}
