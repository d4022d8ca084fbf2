//! Write-behind queue.
//!
//! `set` updates the cache synchronously and queues the value for the system
//! of record. A single background task drains the queue in batches, on a
//! timer or as soon as a full batch is waiting. Failed batches go back to the
//! front of the queue in their original order and are retried first.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cachet_core::{CacheError, CacheResult, Codec, KeyValueStore, TelemetrySink, Ttl};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use super::CacheContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBehindSettings {
    /// Max entries handed to the writer at once; a queue this long flushes immediately.
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Budget for the final drain in [`WriteBehind::shutdown`].
    pub shutdown_timeout: Duration,
}

impl Default for WriteBehindSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl WriteBehindSettings {
    pub fn validate(&self) -> CacheResult<()> {
        if self.batch_size == 0 {
            return Err(CacheError::configuration("write_behind.batch_size must be > 0"));
        }
        if self.flush_interval.is_zero() {
            return Err(CacheError::configuration(
                "write_behind.flush_interval_ms must be > 0",
            ));
        }
        Ok(())
    }
}

/// One pending write.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedWrite<T> {
    pub key: String,
    pub data: T,
    pub enqueued_at: OffsetDateTime,
}

/// Persists batches of queued writes to the system of record.
#[async_trait]
pub trait BatchWriter<T>: Send + Sync {
    async fn write_batch(&self, batch: &[QueuedWrite<T>]) -> anyhow::Result<()>;
}

/// Result of one flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was queued.
    Empty,
    /// The writer accepted this many entries.
    Flushed(usize),
    /// The writer failed; this many entries went back to the front of the queue.
    Requeued(usize),
}

struct Inner<T> {
    ctx: CacheContext,
    settings: WriteBehindSettings,
    writer: Arc<dyn BatchWriter<T>>,
    queue: parking_lot::Mutex<VecDeque<QueuedWrite<T>>>,
    /// One flush at a time; the queue lock is never held across the writer call.
    flush_gate: tokio::sync::Mutex<()>,
    wake: Notify,
}

struct Worker {
    shutdown_tx: watch::Sender<bool>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Cache-first writes with batched, asynchronous persistence.
///
/// Cloning shares the queue and the background task.
pub struct WriteBehind<T> {
    inner: Arc<Inner<T>>,
    worker: Arc<Worker>,
}

impl<T> Clone for WriteBehind<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            worker: Arc::clone(&self.worker),
        }
    }
}

impl<T> WriteBehind<T>
where
    T: Serialize + Send + Sync + 'static,
{
    /// Create the queue and spawn its flush task. Must be called inside a
    /// Tokio runtime.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        codec: Codec,
        telemetry: Arc<dyn TelemetrySink>,
        settings: WriteBehindSettings,
        writer: Arc<dyn BatchWriter<T>>,
    ) -> CacheResult<Self> {
        Self::from_context(CacheContext::new(store, codec, telemetry), settings, writer)
    }

    pub(crate) fn from_context(
        ctx: CacheContext,
        settings: WriteBehindSettings,
        writer: Arc<dyn BatchWriter<T>>,
    ) -> CacheResult<Self> {
        settings.validate()?;

        let inner = Arc::new(Inner {
            ctx,
            settings,
            writer,
            queue: parking_lot::Mutex::new(VecDeque::new()),
            flush_gate: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_worker(Arc::clone(&inner), shutdown_rx));

        Ok(Self {
            inner,
            worker: Arc::new(Worker {
                shutdown_tx,
                handle: parking_lot::Mutex::new(Some(handle)),
            }),
        })
    }

    /// Cache `data` under `key` now and queue it for the writer.
    ///
    /// Only an encode failure is returned. A failed cache write is logged and
    /// the entry is still queued.
    pub async fn set(&self, key: impl Into<String>, data: T, ttl: Ttl) -> CacheResult<()> {
        let key = key.into();
        let bytes = self.inner.ctx.codec.encode(&data)?;

        if let Err(e) = self.inner.ctx.store.set_ex(&key, &bytes, ttl).await {
            tracing::warn!(key = %key, error = %e, "write-behind cache update failed, queueing anyway");
            self.inner.ctx.report_error("set", &key, &e);
        }

        let depth = {
            let mut queue = self.inner.queue.lock();
            queue.push_back(QueuedWrite {
                key: key.clone(),
                data,
                enqueued_at: OffsetDateTime::now_utc(),
            });
            queue.len()
        };

        let telemetry = &self.inner.ctx.telemetry;
        telemetry.track_event(
            "WriteBehindSet",
            &[("key", key), ("queue_size", depth.to_string())],
        );
        telemetry.track_metric("WriteBehindQueueDepth", depth as f64, &[]);

        if depth >= self.inner.settings.batch_size {
            self.inner.wake.notify_one();
        }
        Ok(())
    }

    /// Run one flush now, regardless of the timer.
    pub async fn flush(&self) -> FlushOutcome {
        self.inner.flush().await
    }

    /// Entries waiting for the writer.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn settings(&self) -> WriteBehindSettings {
        self.inner.settings
    }

    /// Stop the background task and drain what is left, bounded by the
    /// shutdown timeout. Returns the number of entries that were not
    /// persisted, including a batch whose writer call was cut off by the
    /// timeout. Safe to call more than once.
    pub async fn shutdown(&self) -> usize {
        let _ = self.worker.shutdown_tx.send(true);
        let handle = self.worker.handle.lock().take();
        let timeout = self.inner.settings.shutdown_timeout;
        let deadline = Instant::now() + timeout;

        if let Some(mut handle) = handle {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "write-behind worker ended abnormally"),
                Err(_) => {
                    // Cancelling the worker puts its in-flight batch back on the queue.
                    handle.abort();
                    let _ = handle.await;
                    tracing::warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        "write-behind worker flush cancelled at shutdown"
                    );
                }
            }
        }

        let drain = async {
            loop {
                match self.inner.flush().await {
                    FlushOutcome::Flushed(_) => continue,
                    FlushOutcome::Empty | FlushOutcome::Requeued(_) => break,
                }
            }
        };

        if tokio::time::timeout_at(deadline, drain).await.is_err() {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "write-behind drain timed out");
        }

        let remaining = self.pending();
        if remaining > 0 {
            tracing::warn!(remaining, "write-behind entries not persisted at shutdown");
        } else {
            tracing::info!("write-behind queue drained");
        }
        remaining
    }
}

/// Entries taken off the queue for one writer call.
///
/// Unless committed they return to the front of the queue in their original
/// order, including when the flush future is dropped mid-call.
struct InFlight<'a, T> {
    queue: &'a parking_lot::Mutex<VecDeque<QueuedWrite<T>>>,
    batch: Vec<QueuedWrite<T>>,
}

impl<T> InFlight<'_, T> {
    fn commit(mut self) {
        self.batch.clear();
    }
}

impl<T> Drop for InFlight<'_, T> {
    fn drop(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let mut queue = self.queue.lock();
        for entry in self.batch.drain(..).rev() {
            queue.push_front(entry);
        }
    }
}

impl<T: Send + Sync> Inner<T> {
    async fn flush(&self) -> FlushOutcome {
        let _gate = self.flush_gate.lock().await;

        let in_flight = {
            let mut queue = self.queue.lock();
            let n = queue.len().min(self.settings.batch_size);
            InFlight {
                queue: &self.queue,
                batch: queue.drain(..n).collect(),
            }
        };
        if in_flight.batch.is_empty() {
            return FlushOutcome::Empty;
        }

        let count = in_flight.batch.len();
        match self.writer.write_batch(&in_flight.batch).await {
            Ok(()) => {
                in_flight.commit();
                tracing::debug!(count, "write-behind batch flushed");
                self.ctx
                    .telemetry
                    .track_event("WriteBehindFlush", &[("count", count.to_string())]);
                FlushOutcome::Flushed(count)
            }
            Err(e) => {
                drop(in_flight);
                let depth = self.queue.lock().len();
                tracing::warn!(count, queue_size = depth, error = %e, "write-behind flush failed, batch requeued");
                self.ctx.telemetry.track_event(
                    "WriteBehindFlushFailed",
                    &[("count", count.to_string()), ("error", e.to_string())],
                );
                FlushOutcome::Requeued(count)
            }
        }
    }

    /// Flush once, then keep going while full batches are waiting.
    async fn flush_ready(&self) {
        loop {
            let outcome = self.flush().await;
            let full = self.queue.lock().len() >= self.settings.batch_size;
            if !(matches!(outcome, FlushOutcome::Flushed(_)) && full) {
                break;
            }
        }
    }
}

async fn run_worker<T: Send + Sync>(inner: Arc<Inner<T>>, mut shutdown_rx: watch::Receiver<bool>) {
    let period = inner.settings.flush_interval;
    tracing::debug!(
        flush_interval_ms = period.as_millis() as u64,
        batch_size = inner.settings.batch_size,
        "write-behind worker started"
    );

    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => inner.flush_ready().await,
            _ = inner.wake.notified() => inner.flush_ready().await,
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::debug!("write-behind worker stopping");
                    break;
                }
            }
        }
    }
}

/// Type-erased handle used by the layer to drain every queue at shutdown.
#[async_trait]
pub(crate) trait Drain: Send + Sync {
    fn pending(&self) -> usize;

    /// Already shut down on its own; nothing left for the layer to drain.
    fn is_stopped(&self) -> bool;

    async fn shutdown(&self) -> usize;
}

#[async_trait]
impl<T> Drain for WriteBehind<T>
where
    T: Serialize + Send + Sync + 'static,
{
    fn pending(&self) -> usize {
        WriteBehind::pending(self)
    }

    fn is_stopped(&self) -> bool {
        self.worker.handle.lock().is_none()
    }

    async fn shutdown(&self) -> usize {
        WriteBehind::shutdown(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_core::MemoryStore;
    use cachet_core::telemetry::noop;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl BatchWriter<u32> for Recorder {
        async fn write_batch(&self, batch: &[QueuedWrite<u32>]) -> anyhow::Result<()> {
            self.batches
                .lock()
                .push(batch.iter().map(|w| w.key.clone()).collect());
            Ok(())
        }
    }

    fn ttl() -> Ttl {
        Ttl::from_secs(60).unwrap()
    }

    fn settings(batch_size: usize, flush_interval: Duration) -> WriteBehindSettings {
        WriteBehindSettings {
            batch_size,
            flush_interval,
            shutdown_timeout: Duration::from_secs(1),
        }
    }

    struct Stalled;

    #[async_trait]
    impl BatchWriter<u32> for Stalled {
        async fn write_batch(&self, _batch: &[QueuedWrite<u32>]) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn zero_batch_size_is_rejected() {
        let result = WriteBehind::<u32>::new(
            Arc::new(MemoryStore::new()),
            Codec::default(),
            noop(),
            settings(0, Duration::from_secs(5)),
            Arc::new(Recorder::default()),
        );
        assert!(matches!(result, Err(CacheError::Configuration(_))));
    }

    #[tokio::test]
    async fn set_caches_immediately_and_queues() {
        let store = Arc::new(MemoryStore::new());
        let wb = WriteBehind::new(
            store.clone(),
            Codec::default(),
            noop(),
            settings(10, Duration::from_secs(60)),
            Arc::new(Recorder::default()),
        )
        .unwrap();

        wb.set("analytics:daily:2024-01-01", 7u32, ttl()).await.unwrap();

        assert_eq!(
            store.get("analytics:daily:2024-01-01").await.unwrap().unwrap(),
            b"7"
        );
        assert_eq!(wb.pending(), 1);
        wb.shutdown().await;
    }

    #[tokio::test]
    async fn flush_takes_at_most_one_batch() {
        let recorder = Arc::new(Recorder::default());
        let wb = WriteBehind::new(
            Arc::new(MemoryStore::new()),
            Codec::default(),
            noop(),
            settings(2, Duration::from_secs(3600)),
            recorder.clone(),
        )
        .unwrap();

        // Stop the worker so only explicit flushes run.
        let _ = wb.worker.shutdown_tx.send(true);
        if let Some(handle) = wb.worker.handle.lock().take() {
            handle.await.unwrap();
        }

        for i in 0..3u32 {
            wb.set(format!("k{i}"), i, ttl()).await.unwrap();
        }

        assert_eq!(wb.flush().await, FlushOutcome::Flushed(2));
        assert_eq!(wb.flush().await, FlushOutcome::Flushed(1));
        assert_eq!(wb.flush().await, FlushOutcome::Empty);
        assert_eq!(
            *recorder.batches.lock(),
            vec![vec!["k0".to_string(), "k1".to_string()], vec!["k2".to_string()]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_partial_batches() {
        let recorder = Arc::new(Recorder::default());
        let wb = WriteBehind::new(
            Arc::new(MemoryStore::new()),
            Codec::default(),
            noop(),
            settings(100, Duration::from_secs(5)),
            recorder.clone(),
        )
        .unwrap();

        wb.set("k1", 1u32, ttl()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(wb.pending(), 0);
        assert_eq!(recorder.batches.lock().len(), 1);
        wb.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_remaining_entries() {
        let recorder = Arc::new(Recorder::default());
        let wb = WriteBehind::new(
            Arc::new(MemoryStore::new()),
            Codec::default(),
            noop(),
            settings(100, Duration::from_secs(3600)),
            recorder.clone(),
        )
        .unwrap();

        wb.set("k1", 1u32, ttl()).await.unwrap();
        wb.set("k2", 2u32, ttl()).await.unwrap();

        assert_eq!(wb.shutdown().await, 0);
        assert_eq!(
            *recorder.batches.lock(),
            vec![vec!["k1".to_string(), "k2".to_string()]]
        );
        assert_eq!(wb.shutdown().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_counts_batch_cut_off_in_worker() {
        let wb = WriteBehind::new(
            Arc::new(MemoryStore::new()),
            Codec::default(),
            noop(),
            WriteBehindSettings {
                batch_size: 2,
                flush_interval: Duration::from_secs(3600),
                shutdown_timeout: Duration::from_millis(100),
            },
            Arc::new(Stalled),
        )
        .unwrap();

        wb.set("k1", 1u32, ttl()).await.unwrap();
        wb.set("k2", 2u32, ttl()).await.unwrap();
        // Let the worker pick up the full batch and park in the writer.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(wb.pending(), 0);

        assert_eq!(wb.shutdown().await, 2);
        assert_eq!(wb.pending(), 2);
        let keys: Vec<String> = wb.inner.queue.lock().iter().map(|w| w.key.clone()).collect();
        assert_eq!(keys, vec!["k1".to_string(), "k2".to_string()]);
    }
}
