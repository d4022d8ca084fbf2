pub mod config;
pub mod layer;
pub mod metrics;
pub mod observability;
pub mod store;
pub mod strategy;

pub use cachet_core::{
    CacheError, CacheKey, CacheResult, Codec, CodecError, Command, ConnectionState, KeyTtl,
    KeyValueStore, MemoryStore, NoopTelemetry, Reply, StoreError, StoreResult, TelemetrySink,
    Ttl, TtlClass, TtlTable, keys, telemetry,
};
pub use self::config::{AppConfig, RedisConfig};
pub use layer::{CacheLayer, CacheLayerBuilder};
pub use self::metrics::{MetricsTelemetry, init_metrics, render_metrics};
pub use observability::{apply_logging_level, init_tracing, init_tracing_with_level};
pub use store::{RedisStore, RetryPolicy, create_store};
pub use strategy::{
    BatchWriter, CacheAside, CacheStats, CacheWarmer, FlushOutcome, HitRate, QueuedWrite,
    RateLimitDecision, RateLimitPolicy, RateLimiter, StoreInfo, WarmReport, WriteBehind,
    WriteBehindSettings, WriteThrough,
};

/// Resolves on Ctrl+C, or SIGTERM on Unix.
///
/// Hosts await this and then call [`CacheLayer::shutdown`].
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
