use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use cachet_core::{
    CacheKey, Codec, Command, KeyValueStore, TelemetrySink, Ttl, TtlClass, TtlTable, keys,
};
use futures_util::StreamExt;
use futures_util::stream;
use serde::Serialize;

use super::CacheContext;

/// What one warm run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    /// Identifiers passed in.
    pub requested: usize,
    /// Loader calls that returned a value.
    pub loaded: usize,
    /// SET commands placed in the pipeline.
    pub staged: usize,
    /// SET commands the store acknowledged.
    pub stored: usize,
    /// Loader, encode or store failures.
    pub failed: usize,
}

/// Preloads entries with one pipelined round trip per run.
///
/// Warming only overwrites; it never reads or deletes existing entries.
#[derive(Clone)]
pub struct CacheWarmer {
    ctx: CacheContext,
    ttls: TtlTable,
    concurrency: usize,
}

impl CacheWarmer {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        codec: Codec,
        telemetry: Arc<dyn TelemetrySink>,
        ttls: TtlTable,
    ) -> Self {
        Self::from_context(CacheContext::new(store, codec, telemetry), ttls, 1)
    }

    pub(crate) fn from_context(ctx: CacheContext, ttls: TtlTable, concurrency: usize) -> Self {
        Self {
            ctx,
            ttls,
            concurrency: concurrency.max(1),
        }
    }

    /// Loader calls allowed in flight at once; 1 is sequential.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn warm_user_profiles<I, T, F, Fut, E>(&self, user_ids: I, loader: F) -> WarmReport
    where
        I: IntoIterator,
        I::Item: Display,
        T: Serialize,
        F: Fn(I::Item) -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: Display,
    {
        let ttl = self.ttls.get(TtlClass::UserProfile);
        self.warm("user_profiles", user_ids, |id| keys::user(id), ttl, loader)
            .await
    }

    pub async fn warm_ai_configs<I, T, F, Fut, E>(&self, providers: I, loader: F) -> WarmReport
    where
        I: IntoIterator,
        I::Item: Display,
        T: Serialize,
        F: Fn(I::Item) -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: Display,
    {
        let ttl = self.ttls.get(TtlClass::AiConfig);
        self.warm("ai_configs", providers, |p| keys::ai_config(p), ttl, loader)
            .await
    }

    /// Load every identifier and store the results in a single pipeline.
    ///
    /// Pipeline order follows identifier order even when loaders run
    /// concurrently. A failure for one identifier does not affect the rest.
    pub async fn warm<I, T, K, F, Fut, E>(
        &self,
        warm_type: &str,
        ids: I,
        key_for: K,
        ttl: Ttl,
        loader: F,
    ) -> WarmReport
    where
        I: IntoIterator,
        K: Fn(&I::Item) -> CacheKey,
        T: Serialize,
        F: Fn(I::Item) -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: Display,
    {
        let loads = ids.into_iter().map(|id| {
            let key = key_for(&id);
            let load = loader(id);
            async move { (key, load.await) }
        });
        let results: Vec<(CacheKey, Result<Option<T>, E>)> = stream::iter(loads)
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut report = WarmReport {
            requested: results.len(),
            ..Default::default()
        };

        let mut commands = Vec::with_capacity(results.len());
        for (key, result) in results {
            match result {
                Ok(Some(value)) => {
                    report.loaded += 1;
                    match self.ctx.codec.encode(&value) {
                        Ok(bytes) => commands.push(Command::set_ex(key.as_str(), bytes, ttl)),
                        Err(e) => {
                            report.failed += 1;
                            tracing::warn!(key = %key, error = %e, "failed to encode warm value");
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(key = %key, error = %e, "warm loader failed");
                }
            }
        }

        report.staged = commands.len();
        if !commands.is_empty() {
            let keys: Vec<String> = commands.iter().map(|c| c.key().to_string()).collect();
            match self.ctx.store.pipeline(commands).await {
                Ok(replies) => {
                    for (key, reply) in keys.iter().zip(replies) {
                        match reply {
                            Ok(_) => report.stored += 1,
                            Err(e) => {
                                report.failed += 1;
                                tracing::warn!(key = %key, error = %e, "warm SET failed");
                            }
                        }
                    }
                }
                Err(e) => {
                    report.failed += report.staged;
                    tracing::warn!(warm_type, count = report.staged, error = %e, "warm pipeline failed");
                }
            }
        }

        tracing::info!(
            warm_type,
            requested = report.requested,
            stored = report.stored,
            failed = report.failed,
            "cache warmed"
        );
        self.ctx.telemetry.track_event(
            "CacheWarmed",
            &[
                ("type", warm_type.to_string()),
                ("count", report.stored.to_string()),
            ],
        );
        report
    }
}
