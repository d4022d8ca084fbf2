//! Core building blocks for the cachet caching layer.
//!
//! - [`codec`]: self-describing envelopes with optional gzip compression
//! - [`keys`]: key namespace and TTL classes
//! - [`store`]: the `KeyValueStore` trait and pipeline types
//! - [`memory`]: in-process store used for local mode and tests
//! - [`telemetry`]: the `TelemetrySink` trait and default sinks

pub mod codec;
pub mod error;
pub mod keys;
pub mod memory;
pub mod store;
pub mod telemetry;

pub use codec::{Codec, GZIP_MARKER};
pub use error::{CacheError, CacheResult, CodecError, StoreError, StoreResult};
pub use keys::{CacheKey, Ttl, TtlClass, TtlTable};
pub use memory::MemoryStore;
pub use store::{Command, ConnectionState, KeyTtl, KeyValueStore, Reply};
pub use telemetry::{FanoutTelemetry, NoopTelemetry, Properties, TelemetrySink, TracingTelemetry};
