//! The narrow key-value store interface the cache layer is written against.

use std::fmt;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::keys::Ttl;

/// Lifecycle of a store connection.
///
/// ```text
/// Disconnected → Connecting → Ready → (Error → Reconnecting → Ready) → Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Error,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Ready)
                | (Connecting, Error)
                | (Ready, Error)
                | (Error, Reconnecting)
                | (Reconnecting, Ready)
                | (Reconnecting, Error)
                | (_, Closed)
        ) && self != Closed
    }

    /// Telemetry event fired when this state is entered.
    pub fn event_name(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "CacheDisconnected",
            ConnectionState::Connecting => "CacheConnecting",
            ConnectionState::Ready => "CacheReady",
            ConnectionState::Error => "CacheError",
            ConnectionState::Reconnecting => "CacheReconnecting",
            ConnectionState::Closed => "CacheClosed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Error => "error",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A single command staged into a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { key: String },
    SetEx { key: String, value: Vec<u8>, ttl: Ttl },
    Del { key: String },
    Incr { key: String },
    Expire { key: String, ttl: Ttl },
    Ttl { key: String },
}

impl Command {
    pub fn set_ex(key: impl Into<String>, value: Vec<u8>, ttl: Ttl) -> Self {
        Command::SetEx {
            key: key.into(),
            value,
            ttl,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Command::Get { key }
            | Command::SetEx { key, .. }
            | Command::Del { key }
            | Command::Incr { key }
            | Command::Expire { key, .. }
            | Command::Ttl { key } => key,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::SetEx { .. } => "SET",
            Command::Del { .. } => "DEL",
            Command::Incr { .. } => "INCR",
            Command::Expire { .. } => "EXPIRE",
            Command::Ttl { .. } => "TTL",
        }
    }
}

/// Reply to one pipelined command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Nil,
    Int(i64),
    Bytes(Vec<u8>),
}

/// Remaining lifetime of a key as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Expires(u64),
}

impl KeyTtl {
    /// Map the Redis `TTL` reply convention (-2 missing, -1 no expiry).
    pub fn from_reply(raw: i64) -> Self {
        match raw {
            -2 => KeyTtl::Missing,
            r if r < 0 => KeyTtl::Persistent,
            secs => KeyTtl::Expires(secs as u64),
        }
    }
}

/// Operations the cache layer needs from a remote key-value store.
///
/// Every method may fail with [`StoreError`](crate::error::StoreError); the
/// implementation owns timeouts, retries and reconnection.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Ttl) -> StoreResult<()>;

    /// Returns the number of keys removed (0 when absent).
    async fn del(&self, key: &str) -> StoreResult<u64>;

    /// Increment the integer at `key`, creating it at 1.
    async fn incr(&self, key: &str) -> StoreResult<i64>;

    /// Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Ttl) -> StoreResult<bool>;

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl>;

    /// Raw `key:value` text block of server statistics.
    async fn info(&self) -> StoreResult<String>;

    /// Execute all commands in one round trip. One failed command does not
    /// stop the others; results come back in command order.
    async fn pipeline(&self, commands: Vec<Command>) -> StoreResult<Vec<StoreResult<Reply>>>;

    async fn ping(&self) -> StoreResult<()>;

    fn state(&self) -> ConnectionState;

    /// Release all connections. Further commands fail with `Unavailable`.
    async fn close(&self);

    fn provider_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Error));
        assert!(Error.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Closed));

        assert!(!Ready.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Ready));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[test]
    fn ttl_reply_mapping() {
        assert_eq!(KeyTtl::from_reply(-2), KeyTtl::Missing);
        assert_eq!(KeyTtl::from_reply(-1), KeyTtl::Persistent);
        assert_eq!(KeyTtl::from_reply(0), KeyTtl::Expires(0));
        assert_eq!(KeyTtl::from_reply(42), KeyTtl::Expires(42));
    }

    #[test]
    fn command_accessors() {
        let cmd = Command::set_ex("user:1", b"{}".to_vec(), Ttl::from_secs(60).unwrap());
        assert_eq!(cmd.key(), "user:1");
        assert_eq!(cmd.name(), "SET");
    }
}
