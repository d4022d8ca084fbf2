//! Redis implementation of [`KeyValueStore`] over a deadpool-redis pool.
//!
//! Every command is bounded by the per-command timeout (pool checkout
//! included) and retried with exponential backoff when the failure is
//! transient. Commands that are not idempotent (`INCR`) are only retried when
//! they provably never reached the server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cachet_core::{
    CacheError, CacheResult, Command, ConnectionState, KeyTtl, KeyValueStore, Reply, StoreError,
    StoreResult, TelemetrySink, Ttl,
};
use deadpool_redis::{Pool, PoolConfig, Runtime};
use parking_lot::Mutex;
use redis::{FromRedisValue, RedisError, Value};

use super::retry::RetryPolicy;
use crate::config::RedisConfig;

enum Request<'a> {
    Cmd(&'a redis::Cmd),
    Pipe(&'a redis::Pipeline),
}

/// Where a failed attempt broke down.
struct AttemptError {
    error: StoreError,
    /// The command may have reached the server.
    sent: bool,
}

/// Pooled Redis client with reconnection, backoff and lifecycle telemetry.
pub struct RedisStore {
    pool: Pool,
    key_prefix: String,
    command_timeout: Duration,
    retry: RetryPolicy,
    state: Mutex<ConnectionState>,
    telemetry: Arc<dyn TelemetrySink>,
    redacted_url: String,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.redacted_url)
            .field("key_prefix", &self.key_prefix)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl RedisStore {
    /// Build the pool and probe the server once.
    ///
    /// An unreachable server is not an error here: the store starts in the
    /// `Error` state and every strategy degrades until it comes back.
    pub async fn connect(
        config: &RedisConfig,
        retry: RetryPolicy,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> CacheResult<Self> {
        let url = config.url()?;
        let redacted_url = config.redacted_url();

        let mut redis_config = deadpool_redis::Config::from_url(url);
        let mut pool_config = PoolConfig::new(config.pool_size);
        pool_config.timeouts.wait = Some(config.connect_timeout());
        pool_config.timeouts.create = Some(config.connect_timeout());
        pool_config.timeouts.recycle = Some(config.command_timeout());
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::configuration(format!("failed to create Redis pool: {e}")))?;

        let store = Self {
            pool,
            key_prefix: config.key_prefix.clone(),
            command_timeout: config.command_timeout(),
            retry,
            state: Mutex::new(ConnectionState::Disconnected),
            telemetry,
            redacted_url,
        };

        store.transition(ConnectionState::Connecting, None);
        tracing::info!(url = %store.redacted_url, "Connecting to Redis");

        match tokio::time::timeout(config.connect_timeout(), store.probe()).await {
            Ok(Ok(())) => {
                store
                    .telemetry
                    .track_event("CacheConnected", &[("url", store.redacted_url.clone())]);
                store.transition(ConnectionState::Ready, None);
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    url = %store.redacted_url,
                    error = %e,
                    "Redis unreachable at startup; cache operations will degrade until it recovers"
                );
                store.transition(ConnectionState::Error, Some(&e));
            }
            Err(_) => {
                let e = StoreError::Timeout(config.connect_timeout());
                tracing::warn!(
                    url = %store.redacted_url,
                    error = %e,
                    "Redis connect timed out; cache operations will degrade until it recovers"
                );
                store.transition(ConnectionState::Error, Some(&e));
            }
        }

        Ok(store)
    }

    async fn probe(&self) -> StoreResult<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::unavailable(format!("failed to get Redis connection: {e}")))?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| self.classify(e))
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn transition(&self, next: ConnectionState, error: Option<&StoreError>) {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            if !previous.can_transition_to(next) {
                return;
            }
            *state = next;
            previous
        };

        match next {
            ConnectionState::Ready => {
                tracing::info!(url = %self.redacted_url, from = %previous, "Redis connection ready")
            }
            ConnectionState::Error => tracing::warn!(
                url = %self.redacted_url,
                error = ?error.map(|e| e.to_string()),
                "Redis connection error"
            ),
            ConnectionState::Reconnecting => {
                tracing::info!(url = %self.redacted_url, "Redis reconnecting")
            }
            ConnectionState::Closed => {
                tracing::info!(url = %self.redacted_url, "Redis connection closed")
            }
            _ => tracing::debug!(url = %self.redacted_url, state = %next, "Redis state change"),
        }

        let mut properties = vec![("state", next.to_string())];
        if let Some(e) = error {
            properties.push(("error", e.to_string()));
        }
        self.telemetry.track_event(next.event_name(), &properties);
    }

    fn mark_ready(&self) {
        let current = *self.state.lock();
        match current {
            ConnectionState::Ready | ConnectionState::Closed => {}
            ConnectionState::Error => {
                self.transition(ConnectionState::Reconnecting, None);
                self.transition(ConnectionState::Ready, None);
            }
            _ => self.transition(ConnectionState::Ready, None),
        }
    }

    fn classify(&self, e: RedisError) -> StoreError {
        if e.is_timeout() {
            StoreError::Timeout(self.command_timeout)
        } else if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
            StoreError::unavailable(e.to_string())
        } else {
            StoreError::command(e.to_string())
        }
    }

    async fn attempt<T: FromRedisValue>(&self, request: &Request<'_>) -> Result<T, AttemptError> {
        let mut conn = self.pool.get().await.map_err(|e| AttemptError {
            error: StoreError::unavailable(format!("failed to get Redis connection: {e}")),
            sent: false,
        })?;

        let result = match request {
            Request::Cmd(cmd) => cmd.query_async::<T>(&mut conn).await,
            Request::Pipe(pipe) => pipe.query_async::<T>(&mut conn).await,
        };

        result.map_err(|e| AttemptError {
            sent: !e.is_connection_refusal(),
            error: self.classify(e),
        })
    }

    async fn execute<T: FromRedisValue>(
        &self,
        op: &'static str,
        request: Request<'_>,
        idempotent: bool,
    ) -> StoreResult<T> {
        if *self.state.lock() == ConnectionState::Closed {
            return Err(StoreError::unavailable("Redis store is closed"));
        }

        let mut attempt = 1;
        loop {
            let failure = match tokio::time::timeout(self.command_timeout, self.attempt(&request))
                .await
            {
                Ok(Ok(value)) => {
                    self.mark_ready();
                    return Ok(value);
                }
                Ok(Err(failure)) => failure,
                Err(_) => AttemptError {
                    error: StoreError::Timeout(self.command_timeout),
                    sent: true,
                },
            };

            let error = failure.error;
            if !error.is_transient() {
                // Server answered; the connection is fine.
                return Err(error);
            }

            self.transition(ConnectionState::Error, Some(&error));

            let retryable = idempotent || !failure.sent;
            if !retryable || !self.retry.should_retry(attempt) {
                tracing::warn!(op, attempt, error = %error, "Redis command failed");
                return Err(error);
            }

            let delay = self.retry.delay_for(attempt);
            tracing::debug!(
                op,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying Redis command"
            );
            self.transition(ConnectionState::Reconnecting, None);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn run_single(&self, command: &Command) -> StoreResult<Reply> {
        let mut pipe = redis::pipe();
        self.stage(&mut pipe, command);
        let values: Vec<Value> = self
            .execute(command.name(), Request::Pipe(&pipe), true)
            .await?;
        values
            .into_iter()
            .next()
            .map_or_else(|| Err(StoreError::command("missing pipeline reply")), reply_from_value)
    }

    fn stage(&self, pipe: &mut redis::Pipeline, command: &Command) {
        match command {
            Command::Get { key } => {
                pipe.cmd("GET").arg(self.prefixed(key));
            }
            Command::SetEx { key, value, ttl } => {
                pipe.cmd("SET")
                    .arg(self.prefixed(key))
                    .arg(value.as_slice())
                    .arg("EX")
                    .arg(ttl.as_secs());
            }
            Command::Del { key } => {
                pipe.cmd("DEL").arg(self.prefixed(key));
            }
            Command::Incr { key } => {
                pipe.cmd("INCR").arg(self.prefixed(key));
            }
            Command::Expire { key, ttl } => {
                pipe.cmd("EXPIRE").arg(self.prefixed(key)).arg(ttl.as_secs());
            }
            Command::Ttl { key } => {
                pipe.cmd("TTL").arg(self.prefixed(key));
            }
        }
    }
}

fn reply_from_value(value: Value) -> StoreResult<Reply> {
    match value {
        Value::Nil => Ok(Reply::Nil),
        Value::Okay => Ok(Reply::Ok),
        Value::Int(n) => Ok(Reply::Int(n)),
        Value::Boolean(b) => Ok(Reply::Int(i64::from(b))),
        Value::BulkString(bytes) => Ok(Reply::Bytes(bytes)),
        Value::SimpleString(s) if s == "OK" => Ok(Reply::Ok),
        Value::SimpleString(s) => Ok(Reply::Bytes(s.into_bytes())),
        Value::ServerError(e) => Err(StoreError::command(format!("{e:?}"))),
        other => Err(StoreError::command(format!("unexpected reply: {other:?}"))),
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(self.prefixed(key));
        self.execute("GET", Request::Cmd(&cmd), true).await
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Ttl) -> StoreResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.prefixed(key))
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs());
        self.execute("SET", Request::Cmd(&cmd), true).await
    }

    async fn del(&self, key: &str) -> StoreResult<u64> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(self.prefixed(key));
        self.execute("DEL", Request::Cmd(&cmd), true).await
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut cmd = redis::cmd("INCR");
        cmd.arg(self.prefixed(key));
        self.execute("INCR", Request::Cmd(&cmd), false).await
    }

    async fn expire(&self, key: &str, ttl: Ttl) -> StoreResult<bool> {
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(self.prefixed(key)).arg(ttl.as_secs());
        self.execute("EXPIRE", Request::Cmd(&cmd), true).await
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        let mut cmd = redis::cmd("TTL");
        cmd.arg(self.prefixed(key));
        let raw: i64 = self.execute("TTL", Request::Cmd(&cmd), true).await?;
        Ok(KeyTtl::from_reply(raw))
    }

    async fn info(&self) -> StoreResult<String> {
        let cmd = redis::cmd("INFO");
        self.execute("INFO", Request::Cmd(&cmd), true).await
    }

    async fn pipeline(&self, commands: Vec<Command>) -> StoreResult<Vec<StoreResult<Reply>>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let idempotent = !commands.iter().any(|c| matches!(c, Command::Incr { .. }));
        let mut pipe = redis::pipe();
        for command in &commands {
            self.stage(&mut pipe, command);
        }

        match self
            .execute::<Vec<Value>>("PIPELINE", Request::Pipe(&pipe), idempotent)
            .await
        {
            Ok(values) => {
                let mut replies: Vec<StoreResult<Reply>> =
                    values.into_iter().map(reply_from_value).collect();
                replies.resize_with(commands.len(), || {
                    Err(StoreError::command("missing pipeline reply"))
                });
                Ok(replies)
            }
            // At least one command got an error reply and the client failed the
            // whole batch. Idempotent batches are resolved command by command.
            Err(StoreError::Command(msg)) if idempotent => {
                tracing::debug!(
                    count = commands.len(),
                    error = %msg,
                    "pipeline reported an error reply, resolving per command"
                );
                let mut replies = Vec::with_capacity(commands.len());
                for command in &commands {
                    replies.push(self.run_single(command).await);
                }
                Ok(replies)
            }
            // Replaying INCR would count twice; every slot reports the error.
            Err(StoreError::Command(msg)) => Ok(commands
                .iter()
                .map(|_| Err(StoreError::command(msg.clone())))
                .collect()),
            Err(e) => Err(e),
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        let cmd = redis::cmd("PING");
        self.execute::<String>("PING", Request::Cmd(&cmd), true)
            .await
            .map(|_| ())
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn close(&self) {
        self.pool.close();
        self.transition(ConnectionState::Closed, None);
    }

    fn provider_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_pipeline_values() {
        assert_eq!(reply_from_value(Value::Okay).unwrap(), Reply::Ok);
        assert_eq!(reply_from_value(Value::Nil).unwrap(), Reply::Nil);
        assert_eq!(reply_from_value(Value::Int(3)).unwrap(), Reply::Int(3));
        assert_eq!(
            reply_from_value(Value::BulkString(b"x".to_vec())).unwrap(),
            Reply::Bytes(b"x".to_vec())
        );
        assert_eq!(
            reply_from_value(Value::SimpleString("OK".into())).unwrap(),
            Reply::Ok
        );
    }

    #[tokio::test]
    async fn unreachable_server_starts_degraded() {
        let config = RedisConfig {
            enabled: true,
            host: "127.0.0.1".into(),
            // Reserved port; nothing listens here.
            port: 1,
            connect_timeout_ms: 200,
            command_timeout_ms: 200,
            ..Default::default()
        };

        let store = RedisStore::connect(&config, RetryPolicy::none(), cachet_core::telemetry::noop())
            .await
            .unwrap();
        assert_eq!(store.state(), ConnectionState::Error);

        let err = store.get("k").await.unwrap_err();
        assert!(err.is_transient());

        store.close().await;
        assert_eq!(store.state(), ConnectionState::Closed);
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
