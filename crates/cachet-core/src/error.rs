use std::time::Duration;

use thiserror::Error;

/// Failures reported by a [`KeyValueStore`](crate::store::KeyValueStore).
///
/// Strategies treat every variant as "cache layer degraded": they fall back to
/// the loader or writer, fail open, or log and continue.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached (pool exhausted, connection refused or dropped).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The command did not complete within the per-command timeout.
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with an error reply (wrong type, not an integer, ...).
    #[error("Store command failed: {0}")]
    Command(String),
}

impl StoreError {
    /// Create a new Unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a new Command error
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    /// Whether retrying the same command may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Failures while turning values into envelopes and back.
///
/// On the read path this always means corrupted or incompatible stored bytes.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to serialize value: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Invalid base64 in compressed envelope: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Failed to (de)compress payload: {0}")]
    Decompress(#[from] std::io::Error),

    #[error("Failed to deserialize value: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// Top-level error for the cache layer.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Invalid construction parameters. Raised at build time, never on the request path.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CacheError {
    /// Create a new Configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Result type for store commands
pub type StoreResult<T> = Result<T, StoreError>;
