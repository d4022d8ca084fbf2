//! Integration tests against a real Redis.
//!
//! Tests use testcontainers to spin up a Redis instance and are ignored by
//! default: run with `cargo test -- --ignored` on a machine with Docker.

mod common;

use std::convert::Infallible;
use std::sync::Arc;

use cachet::{
    AppConfig, CacheLayer, Command, ConnectionState, KeyTtl, KeyValueStore, RateLimitPolicy,
    RedisConfig, RedisStore, Reply, RetryPolicy, StoreError, keys,
};
use common::{RecordingTelemetry, ttl};
use serde_json::json;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, u16)> = OnceCell::const_new();

/// Get or create the shared Redis container
async fn redis_port() -> u16 {
    let (_, port) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");
            let port = container.get_host_port_ipv4(6379).await.expect("get port");
            (container, port)
        })
        .await;
    *port
}

async fn redis_config(prefix: &str) -> RedisConfig {
    RedisConfig {
        enabled: true,
        host: "127.0.0.1".to_string(),
        port: redis_port().await,
        key_prefix: prefix.to_string(),
        pool_size: 4,
        ..Default::default()
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn connects_and_emits_lifecycle_events() {
    let telemetry = Arc::new(RecordingTelemetry::default());
    let store = RedisStore::connect(
        &redis_config("lifecycle:").await,
        RetryPolicy::default(),
        telemetry.clone(),
    )
    .await
    .unwrap();

    assert_eq!(store.state(), ConnectionState::Ready);
    store.ping().await.unwrap();
    store.close().await;

    let events = telemetry.events();
    assert_eq!(
        events,
        vec!["CacheConnecting", "CacheConnected", "CacheReady", "CacheClosed"]
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn commands_are_prefixed_and_expire() {
    let config = redis_config("prefixed:").await;
    let store = RedisStore::connect(&config, RetryPolicy::default(), cachet::telemetry::noop())
        .await
        .unwrap();

    store.set_ex("user:1", b"{}", ttl(60)).await.unwrap();
    assert_eq!(store.get("user:1").await.unwrap().unwrap(), b"{}");
    assert!(matches!(store.ttl("user:1").await.unwrap(), KeyTtl::Expires(s) if s <= 60));

    // A second client without the prefix sees the namespaced key.
    let bare = RedisStore::connect(
        &RedisConfig {
            key_prefix: String::new(),
            ..config
        },
        RetryPolicy::default(),
        cachet::telemetry::noop(),
    )
    .await
    .unwrap();
    assert!(bare.get("prefixed:user:1").await.unwrap().is_some());

    assert_eq!(store.del("user:1").await.unwrap(), 1);
    assert_eq!(store.del("user:1").await.unwrap(), 0);
    assert_eq!(store.ttl("user:1").await.unwrap(), KeyTtl::Missing);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn pipeline_reports_each_command() {
    let store = RedisStore::connect(
        &redis_config("pipe:").await,
        RetryPolicy::default(),
        cachet::telemetry::noop(),
    )
    .await
    .unwrap();

    let replies = store
        .pipeline(vec![
            Command::set_ex("a", b"1".to_vec(), ttl(60)),
            Command::Get { key: "a".into() },
            Command::Incr { key: "a".into() },
            Command::Ttl { key: "a".into() },
        ])
        .await
        .unwrap();

    assert_eq!(replies.len(), 4);
    assert_eq!(replies[0].as_ref().unwrap(), &Reply::Ok);
    assert_eq!(replies[1].as_ref().unwrap(), &Reply::Bytes(b"1".to_vec()));
    assert_eq!(replies[2].as_ref().unwrap(), &Reply::Int(2));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn pipeline_error_reply_only_fails_its_own_slot() {
    let port = redis_port().await;
    let client = redis::Client::open(format!("redis://127.0.0.1:{port}/0")).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let _: i64 = redis::cmd("RPUSH")
        .arg("mixed:list")
        .arg("x")
        .query_async(&mut conn)
        .await
        .unwrap();

    let store = RedisStore::connect(
        &redis_config("mixed:").await,
        RetryPolicy::default(),
        cachet::telemetry::noop(),
    )
    .await
    .unwrap();

    let replies = store
        .pipeline(vec![
            Command::set_ex("a", b"1".to_vec(), ttl(60)),
            Command::Get { key: "list".into() },
            Command::set_ex("b", b"2".to_vec(), ttl(60)),
        ])
        .await
        .unwrap();

    assert_eq!(replies.len(), 3);
    assert_eq!(replies[0].as_ref().unwrap(), &Reply::Ok);
    assert!(matches!(replies[1], Err(StoreError::Command(_))));
    assert_eq!(replies[2].as_ref().unwrap(), &Reply::Ok);
    assert_eq!(store.get("b").await.unwrap().unwrap(), b"2");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn layer_over_redis() {
    let mut config = AppConfig::default();
    config.redis = redis_config("layer:").await;
    let layer = CacheLayer::from_config(&config, cachet::telemetry::noop())
        .await
        .unwrap();
    assert_eq!(layer.store().provider_name(), "redis");

    let value = layer
        .cache_aside()
        .get(keys::organization(9), || async { Ok::<_, Infallible>(Some(json!({"id": 9}))) }, ttl(60))
        .await
        .unwrap();
    assert_eq!(value, Some(json!({"id": 9})));

    let policy = RateLimitPolicy::new(2, 60).unwrap();
    let limiter = layer.rate_limiter();
    limiter.reset("u1", "/r").await;
    let decisions: Vec<bool> = {
        let mut out = Vec::new();
        for _ in 0..3 {
            out.push(limiter.is_allowed("u1", "/r", policy).await.allowed);
        }
        out
    };
    assert_eq!(decisions, vec![true, true, false]);

    let info = layer.stats().get_info().await.unwrap();
    assert!(info.connected_clients >= 1);
    assert!(info.used_memory > 0);

    assert_eq!(layer.shutdown().await, 0);
    assert_eq!(layer.store().state(), ConnectionState::Closed);
}
