use std::time::Duration;

use cachet_core::{CacheError, CacheResult, Codec, TtlClass, TtlTable};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::store::RetryPolicy;
use crate::strategy::rate_limit::RateLimitPolicy;
use crate::strategy::write_behind::WriteBehindSettings;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Redis connection settings
    #[serde(default)]
    pub redis: RedisConfig,
    /// Reconnect/backoff policy for store commands
    #[serde(default)]
    pub retry: RetryConfig,
    /// Local (in-process) store settings, used when Redis is disabled
    #[serde(default)]
    pub local: LocalConfig,
    /// Per-value-class TTLs
    #[serde(default)]
    pub ttl: TtlConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub write_behind: WriteBehindConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub warmer: WarmerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl AppConfig {
    /// Reject invalid construction parameters up front.
    pub fn validate(&self) -> CacheResult<()> {
        let fail = |msg: &str| Err(CacheError::configuration(msg));

        // Redis validations
        if self.redis.host.trim().is_empty() {
            return fail("redis.host must not be empty");
        }
        if self.redis.port == 0 {
            return fail("redis.port must be > 0");
        }
        if self.redis.pool_size == 0 {
            return fail("redis.pool_size must be > 0");
        }
        if self.redis.connect_timeout_ms == 0 || self.redis.command_timeout_ms == 0 {
            return fail("redis timeouts must be > 0");
        }
        // Retry validations
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be > 0");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return fail("retry.base_delay_ms must be <= retry.max_delay_ms");
        }
        if self.local.max_entries == Some(0) {
            return fail("local.max_entries must be > 0 when set");
        }
        // TTL, codec, queue and limiter settings
        self.ttl.to_table()?;
        self.codec.to_codec()?;
        self.write_behind.to_settings().validate()?;
        self.rate_limit.to_policy()?;
        if self.warmer.concurrency == 0 {
            return fail("warmer.concurrency must be > 0");
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(CacheError::configuration(format!(
                "logging.level must be one of {valid_levels:?}"
            )));
        }
        Ok(())
    }
}

/// Redis connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Use Redis. When false the layer runs against an in-process store.
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// ACL username (Redis 6+); omitted for legacy `requirepass` auth
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Logical database index
    #[serde(default)]
    pub db: u32,

    /// Prefix prepended to every key by the store client
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Connect with `rediss://`
    #[serde(default)]
    pub tls: bool,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Upper bound for a single command, including pool checkout
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_key_prefix() -> String {
    "cachet:".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_command_timeout_ms() -> u64 {
    3000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            host: default_redis_host(),
            port: default_redis_port(),
            username: None,
            password: None,
            db: 0,
            key_prefix: default_key_prefix(),
            tls: false,
            pool_size: default_redis_pool_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl RedisConfig {
    /// Connection URL including credentials.
    pub fn url(&self) -> CacheResult<String> {
        self.build_url(self.password.as_deref())
    }

    /// Connection URL safe for logs.
    pub fn redacted_url(&self) -> String {
        let masked = self.password.as_ref().map(|_| "***");
        self.build_url(masked)
            .unwrap_or_else(|_| format!("{}:{}", self.host, self.port))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    fn build_url(&self, password: Option<&str>) -> CacheResult<String> {
        let scheme = if self.tls { "rediss" } else { "redis" };
        let mut url = Url::parse(&format!(
            "{scheme}://{}:{}/{}",
            self.host, self.port, self.db
        ))
        .map_err(|e| CacheError::configuration(format!("invalid redis host/port: {e}")))?;

        if let Some(user) = self.username.as_deref() {
            url.set_username(user)
                .map_err(|_| CacheError::configuration("redis.username cannot be set on this URL"))?;
        }
        if let Some(password) = password {
            url.set_password(Some(password))
                .map_err(|_| CacheError::configuration("redis.password cannot be set on this URL"))?;
        }
        Ok(url.to_string())
    }
}

/// Exponential backoff for store commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Total attempts per command, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay_ms() -> u64 {
    50
}

fn default_max_delay_ms() -> u64 {
    2000
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.max_attempts,
        )
    }
}

/// In-process store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Max keys held locally; `None` is unbounded
    #[serde(default = "default_local_max_entries")]
    pub max_entries: Option<usize>,
}

fn default_local_max_entries() -> Option<usize> {
    Some(10_000)
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_entries: default_local_max_entries(),
        }
    }
}

/// TTL per value class, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlConfig {
    #[serde(default = "default_ttl_user_profile")]
    pub user_profile: u64,
    #[serde(default = "default_ttl_api_key")]
    pub api_key: u64,
    #[serde(default = "default_ttl_session")]
    pub session: u64,
    #[serde(default = "default_ttl_organization")]
    pub organization: u64,
    #[serde(default = "default_ttl_ai_config")]
    pub ai_config: u64,
    #[serde(default = "default_ttl_ai_model")]
    pub ai_model: u64,
    #[serde(default = "default_ttl_rate_limit")]
    pub rate_limit: u64,
    #[serde(default = "default_ttl_conversation")]
    pub conversation: u64,
    #[serde(default = "default_ttl_analytics")]
    pub analytics: u64,
}

fn default_ttl_user_profile() -> u64 {
    TtlClass::UserProfile.default_ttl().as_secs()
}

fn default_ttl_api_key() -> u64 {
    TtlClass::ApiKey.default_ttl().as_secs()
}

fn default_ttl_session() -> u64 {
    TtlClass::Session.default_ttl().as_secs()
}

fn default_ttl_organization() -> u64 {
    TtlClass::Organization.default_ttl().as_secs()
}

fn default_ttl_ai_config() -> u64 {
    TtlClass::AiConfig.default_ttl().as_secs()
}

fn default_ttl_ai_model() -> u64 {
    TtlClass::AiModel.default_ttl().as_secs()
}

fn default_ttl_rate_limit() -> u64 {
    TtlClass::RateLimit.default_ttl().as_secs()
}

fn default_ttl_conversation() -> u64 {
    TtlClass::Conversation.default_ttl().as_secs()
}

fn default_ttl_analytics() -> u64 {
    TtlClass::Analytics.default_ttl().as_secs()
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            user_profile: default_ttl_user_profile(),
            api_key: default_ttl_api_key(),
            session: default_ttl_session(),
            organization: default_ttl_organization(),
            ai_config: default_ttl_ai_config(),
            ai_model: default_ttl_ai_model(),
            rate_limit: default_ttl_rate_limit(),
            conversation: default_ttl_conversation(),
            analytics: default_ttl_analytics(),
        }
    }
}

impl TtlConfig {
    pub fn to_table(&self) -> CacheResult<TtlTable> {
        let mut table = TtlTable::default();
        table.set(TtlClass::UserProfile, self.user_profile)?;
        table.set(TtlClass::ApiKey, self.api_key)?;
        table.set(TtlClass::Session, self.session)?;
        table.set(TtlClass::Organization, self.organization)?;
        table.set(TtlClass::AiConfig, self.ai_config)?;
        table.set(TtlClass::AiModel, self.ai_model)?;
        table.set(TtlClass::RateLimit, self.rate_limit)?;
        table.set(TtlClass::Conversation, self.conversation)?;
        table.set(TtlClass::Analytics, self.analytics)?;
        Ok(table)
    }
}

/// Envelope compression settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Serialized payloads larger than this many bytes are gzipped
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,

    /// gzip level, 0-9
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
}

fn default_compression_threshold() -> usize {
    cachet_core::codec::DEFAULT_COMPRESSION_THRESHOLD
}

fn default_compression_level() -> u32 {
    cachet_core::codec::DEFAULT_COMPRESSION_LEVEL
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression_threshold: default_compression_threshold(),
            compression_level: default_compression_level(),
        }
    }
}

impl CodecConfig {
    pub fn to_codec(&self) -> CacheResult<Codec> {
        Codec::new(self.compression_threshold, self.compression_level)
    }
}

/// Write-behind queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBehindConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Budget for the final flush on shutdown
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval_ms() -> u64 {
    5000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl WriteBehindConfig {
    pub fn to_settings(&self) -> WriteBehindSettings {
        WriteBehindSettings {
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
        }
    }
}

/// Default fixed-window limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_max_requests() -> u64 {
    100
}

fn default_window_secs() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
        }
    }
}

impl RateLimitConfig {
    pub fn to_policy(&self) -> CacheResult<RateLimitPolicy> {
        RateLimitPolicy::new(self.max_requests, self.window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmerConfig {
    /// Loader calls in flight at once; 1 loads sequentially
    #[serde(default = "default_warm_concurrency")]
    pub concurrency: usize,
}

fn default_warm_concurrency() -> usize {
    1
}

impl Default for WarmerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_warm_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Install the Prometheus recorder and report telemetry into it
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use cachet_core::{CacheError, CacheResult};
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Load configuration from an optional TOML file plus `CACHET__*` env overrides.
    pub fn load_config(path: Option<&str>) -> CacheResult<AppConfig> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                } else {
                    return Err(CacheError::configuration(format!(
                        "config file not found: {p}"
                    )));
                }
            }
            None => {
                // Try default root-level file
                let default_path = PathBuf::from("cachet.toml");
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment variable overrides, e.g., CACHET__REDIS__PORT=6380
        builder = builder.add_source(
            Environment::with_prefix("CACHET")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| CacheError::configuration(format!("config build error: {e}")))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| CacheError::configuration(format!("config deserialize error: {e}")))?;
        merged.validate()?;
        Ok(merged)
    }
}
