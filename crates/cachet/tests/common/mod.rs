//! Shared test doubles for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use cachet::{
    BatchWriter, Command, ConnectionState, KeyTtl, KeyValueStore, QueuedWrite, Reply, StoreError,
    StoreResult, TelemetrySink, Ttl, telemetry::Properties,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

/// A store whose every command fails as if the server were unreachable.
#[derive(Debug, Default)]
pub struct DownStore {
    pub calls: AtomicUsize,
}

impl DownStore {
    fn fail<T>(&self) -> StoreResult<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::unavailable("connection refused"))
    }
}

#[async_trait]
impl KeyValueStore for DownStore {
    async fn get(&self, _key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.fail()
    }

    async fn set_ex(&self, _key: &str, _value: &[u8], _ttl: Ttl) -> StoreResult<()> {
        self.fail()
    }

    async fn del(&self, _key: &str) -> StoreResult<u64> {
        self.fail()
    }

    async fn incr(&self, _key: &str) -> StoreResult<i64> {
        self.fail()
    }

    async fn expire(&self, _key: &str, _ttl: Ttl) -> StoreResult<bool> {
        self.fail()
    }

    async fn ttl(&self, _key: &str) -> StoreResult<KeyTtl> {
        self.fail()
    }

    async fn info(&self) -> StoreResult<String> {
        self.fail()
    }

    async fn pipeline(&self, _commands: Vec<Command>) -> StoreResult<Vec<StoreResult<Reply>>> {
        self.fail()
    }

    async fn ping(&self) -> StoreResult<()> {
        self.fail()
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::Error
    }

    async fn close(&self) {}

    fn provider_name(&self) -> &'static str {
        "down"
    }
}

/// Records every event and metric name it receives.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    pub events: Mutex<Vec<String>>,
    pub metrics: Mutex<Vec<(String, f64)>>,
}

impl RecordingTelemetry {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn metric_names(&self) -> Vec<String> {
        self.metrics.lock().iter().map(|(n, _)| n.clone()).collect()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn track_event(&self, name: &str, _properties: Properties<'_>) {
        self.events.lock().push(name.to_string());
    }

    fn track_metric(&self, name: &str, value: f64, _properties: Properties<'_>) {
        self.metrics.lock().push((name.to_string(), value));
    }
}

/// Batch writer that fails its first `failures` calls and records every batch
/// it is handed, successful or not.
#[derive(Debug, Default)]
pub struct FlakyWriter {
    failures: AtomicUsize,
    pub attempts: Mutex<Vec<Vec<(String, Value)>>>,
    pub persisted: Mutex<Vec<(String, Value)>>,
}

impl FlakyWriter {
    pub fn failing(times: usize) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicUsize::new(times),
            ..Default::default()
        })
    }
}

#[async_trait]
impl BatchWriter<Value> for FlakyWriter {
    async fn write_batch(&self, batch: &[QueuedWrite<Value>]) -> anyhow::Result<()> {
        let entries: Vec<(String, Value)> = batch
            .iter()
            .map(|w| (w.key.clone(), w.data.clone()))
            .collect();
        self.attempts.lock().push(entries.clone());

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("system of record unavailable");
        }
        self.persisted.lock().extend(entries);
        Ok(())
    }
}

/// Batch writer that parks every call until the test releases it.
#[derive(Debug, Default)]
pub struct GatedWriter {
    pub started: Notify,
    pub release: Notify,
    pub persisted: Mutex<Vec<String>>,
}

#[async_trait]
impl BatchWriter<Value> for GatedWriter {
    async fn write_batch(&self, batch: &[QueuedWrite<Value>]) -> anyhow::Result<()> {
        self.started.notify_one();
        self.release.notified().await;
        self.persisted
            .lock()
            .extend(batch.iter().map(|w| w.key.clone()));
        Ok(())
    }
}

pub fn ttl(secs: u64) -> Ttl {
    Ttl::from_secs(secs).unwrap()
}
