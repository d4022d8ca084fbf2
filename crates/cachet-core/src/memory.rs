//! In-process [`KeyValueStore`] for single-instance deployments and tests.
//!
//! Expiry is enforced by the store the same way Redis does it: entries carry
//! a deadline and are dropped lazily on access. `INFO` reports the same
//! counters a Redis server would, so the stats collector works unchanged.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::error::{StoreError, StoreResult};
use crate::keys::Ttl;
use crate::store::{Command, ConnectionState, KeyTtl, KeyValueStore, Reply};

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Counters {
    commands: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    evicted: AtomicU64,
    peak_memory: AtomicU64,
}

/// DashMap-backed store with Redis-like TTL and INFO semantics.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Entry>>,
    counters: Arc<Counters>,
    closed: Arc<AtomicBool>,
    max_entries: Option<usize>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
            closed: Arc::new(AtomicBool::new(false)),
            max_entries: None,
        }
    }

    /// Bound the number of keys. When full, the key closest to expiry is evicted.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries.max(1));
        self
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn begin(&self) -> StoreResult<Instant> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::unavailable("memory store is closed"));
        }
        self.counters.commands.fetch_add(1, Ordering::Relaxed);
        Ok(Instant::now())
    }

    fn purge_if_expired(&self, key: &str, now: Instant) {
        if self.entries.remove_if(key, |_, e| e.is_expired(now)).is_some() {
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn make_room_for(&self, key: &str, now: Instant) {
        let Some(max) = self.max_entries else {
            return;
        };
        if self.entries.contains_key(key) || self.entries.len() < max {
            return;
        }

        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        let purged = before.saturating_sub(self.entries.len());
        self.counters
            .expired
            .fetch_add(purged as u64, Ordering::Relaxed);

        while self.entries.len() >= max {
            let victim = self
                .entries
                .iter()
                .min_by_key(|e| e.expires_at.map_or(u128::MAX, |at| at.duration_since(now).as_nanos()))
                .map(|e| e.key().clone());
            match victim {
                Some(victim) => {
                    self.entries.remove(&victim);
                    self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = %victim, "memory store evicted key");
                }
                None => break,
            }
        }
    }

    fn do_get(&self, key: &str, now: Instant) -> Option<Vec<u8>> {
        self.purge_if_expired(key, now);
        let value = self.entries.get(key).map(|e| e.data.clone());
        if value.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    fn do_set_ex(&self, key: &str, value: &[u8], ttl: Ttl, now: Instant) {
        self.purge_if_expired(key, now);
        self.make_room_for(key, now);
        self.entries.insert(
            key.to_string(),
            Entry {
                data: value.to_vec(),
                expires_at: Some(now + ttl.as_duration()),
            },
        );
    }

    fn do_del(&self, key: &str, now: Instant) -> u64 {
        self.purge_if_expired(key, now);
        u64::from(self.entries.remove(key).is_some())
    }

    fn do_incr(&self, key: &str, now: Instant) -> StoreResult<i64> {
        self.purge_if_expired(key, now);
        self.make_room_for(key, now);
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            data: b"0".to_vec(),
            expires_at: None,
        });
        let current: i64 = std::str::from_utf8(&entry.data)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| StoreError::command("ERR value is not an integer or out of range"))?;
        let next = current
            .checked_add(1)
            .ok_or_else(|| StoreError::command("ERR increment or decrement would overflow"))?;
        entry.data = next.to_string().into_bytes();
        Ok(next)
    }

    fn do_expire(&self, key: &str, ttl: Ttl, now: Instant) -> bool {
        self.purge_if_expired(key, now);
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(now + ttl.as_duration());
                true
            }
            None => false,
        }
    }

    fn do_ttl(&self, key: &str, now: Instant) -> KeyTtl {
        self.purge_if_expired(key, now);
        match self.entries.get(key) {
            None => KeyTtl::Missing,
            Some(entry) => match entry.expires_at {
                None => KeyTtl::Persistent,
                // Round up like Redis so a fresh 60s key reports 60, not 59.
                Some(at) => {
                    let remaining = at.duration_since(now);
                    let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
                    KeyTtl::Expires(secs)
                }
            },
        }
    }

    fn used_memory(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| (e.key().len() + e.data.len()) as u64)
            .sum()
    }

    fn render_info(&self) -> String {
        let used = self.used_memory();
        let peak = self
            .counters
            .peak_memory
            .fetch_max(used, Ordering::Relaxed)
            .max(used);
        let c = &self.counters;

        let mut out = String::with_capacity(512);
        out.push_str("# Server\r\nredis_mode:memory\r\n\r\n");
        out.push_str("# Clients\r\nconnected_clients:1\r\n\r\n");
        out.push_str(&format!(
            "# Memory\r\nused_memory:{used}\r\nused_memory_human:{}\r\nused_memory_peak:{peak}\r\nused_memory_peak_human:{}\r\n\r\n",
            human_bytes(used),
            human_bytes(peak),
        ));
        out.push_str(&format!(
            "# Stats\r\ntotal_connections_received:1\r\ntotal_commands_processed:{}\r\ninstantaneous_ops_per_sec:0\r\nexpired_keys:{}\r\nevicted_keys:{}\r\nkeyspace_hits:{}\r\nkeyspace_misses:{}\r\n\r\n",
            c.commands.load(Ordering::Relaxed),
            c.expired.load(Ordering::Relaxed),
            c.evicted.load(Ordering::Relaxed),
            c.hits.load(Ordering::Relaxed),
            c.misses.load(Ordering::Relaxed),
        ));
        out.push_str(&format!("# Keyspace\r\ndb0:keys={}\r\n", self.entries.len()));
        out
    }

    fn execute(&self, command: Command, now: Instant) -> StoreResult<Reply> {
        self.counters.commands.fetch_add(1, Ordering::Relaxed);
        match command {
            Command::Get { key } => Ok(self
                .do_get(&key, now)
                .map(Reply::Bytes)
                .unwrap_or(Reply::Nil)),
            Command::SetEx { key, value, ttl } => {
                self.do_set_ex(&key, &value, ttl, now);
                Ok(Reply::Ok)
            }
            Command::Del { key } => Ok(Reply::Int(self.do_del(&key, now) as i64)),
            Command::Incr { key } => self.do_incr(&key, now).map(Reply::Int),
            Command::Expire { key, ttl } => {
                Ok(Reply::Int(i64::from(self.do_expire(&key, ttl, now))))
            }
            Command::Ttl { key } => Ok(Reply::Int(match self.do_ttl(&key, now) {
                KeyTtl::Missing => -2,
                KeyTtl::Persistent => -1,
                KeyTtl::Expires(secs) => secs as i64,
            })),
        }
    }
}

/// Format a byte count the way Redis does in `used_memory_human`.
fn human_bytes(bytes: u64) -> String {
    const UNITS: [(&str, f64); 3] = [
        ("G", 1024.0 * 1024.0 * 1024.0),
        ("M", 1024.0 * 1024.0),
        ("K", 1024.0),
    ];
    let value = bytes as f64;
    for (unit, scale) in UNITS {
        if value >= scale {
            return format!("{:.2}{unit}", value / scale);
        }
    }
    format!("{bytes}B")
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let now = self.begin()?;
        Ok(self.do_get(key, now))
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Ttl) -> StoreResult<()> {
        let now = self.begin()?;
        self.do_set_ex(key, value, ttl, now);
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<u64> {
        let now = self.begin()?;
        Ok(self.do_del(key, now))
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let now = self.begin()?;
        self.do_incr(key, now)
    }

    async fn expire(&self, key: &str, ttl: Ttl) -> StoreResult<bool> {
        let now = self.begin()?;
        Ok(self.do_expire(key, ttl, now))
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        let now = self.begin()?;
        Ok(self.do_ttl(key, now))
    }

    async fn info(&self) -> StoreResult<String> {
        self.begin()?;
        Ok(self.render_info())
    }

    async fn pipeline(&self, commands: Vec<Command>) -> StoreResult<Vec<StoreResult<Reply>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::unavailable("memory store is closed"));
        }
        let now = Instant::now();
        Ok(commands
            .into_iter()
            .map(|command| self.execute(command, now))
            .collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.begin().map(|_| ())
    }

    fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::Acquire) {
            ConnectionState::Closed
        } else {
            ConnectionState::Ready
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}
