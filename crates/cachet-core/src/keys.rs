//! Key namespace and TTL classes.
//!
//! Keys are namespaced as `{domain}:{identifier}[:{sub-identifier}]`. The
//! store-level prefix (for example `cachet:`) is applied by the store client,
//! not here.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// A canonical cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// `{domain}:{id}`
    pub fn new(domain: &str, id: impl fmt::Display) -> Self {
        Self(format!("{domain}:{id}"))
    }

    /// `{domain}:{id}:{sub}`
    pub fn with_sub(domain: &str, id: impl fmt::Display, sub: impl fmt::Display) -> Self {
        Self(format!("{domain}:{id}:{sub}"))
    }

    /// Wrap an already namespaced key, e.g. one read back from an operator command.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub fn user(user_id: impl fmt::Display) -> CacheKey {
    CacheKey::new("user", user_id)
}

pub fn user_api_keys(user_id: impl fmt::Display) -> CacheKey {
    CacheKey::with_sub("user", user_id, "apikeys")
}

pub fn api_key(key_id: impl fmt::Display) -> CacheKey {
    CacheKey::new("apikey", key_id)
}

pub fn session(session_id: impl fmt::Display) -> CacheKey {
    CacheKey::new("session", session_id)
}

pub fn organization(org_id: impl fmt::Display) -> CacheKey {
    CacheKey::new("org", org_id)
}

pub fn ai_config(provider: impl fmt::Display) -> CacheKey {
    CacheKey::with_sub("ai", "config", provider)
}

pub fn ai_model(model_id: impl fmt::Display) -> CacheKey {
    CacheKey::with_sub("ai", "model", model_id)
}

/// Counter key for the fixed-window rate limiter.
pub fn rate_limit(subject: impl fmt::Display, resource: impl fmt::Display) -> CacheKey {
    CacheKey::with_sub("rate-limit", subject, resource)
}

pub fn conversation(conversation_id: impl fmt::Display) -> CacheKey {
    CacheKey::new("conversation", conversation_id)
}

/// Daily analytics rollup, `date` formatted as the caller stores it (e.g. `2024-05-01`).
pub fn analytics(date: impl fmt::Display) -> CacheKey {
    CacheKey::with_sub("analytics", "daily", date)
}

/// A strictly positive time-to-live, in whole seconds.
///
/// Every entry is written with one of these; there is no way to express
/// "no expiry".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ttl(u64);

impl Ttl {
    pub const fn from_secs_const(secs: u64) -> Self {
        assert!(secs > 0, "ttl must be positive");
        Self(secs)
    }

    pub fn from_secs(secs: u64) -> Result<Self, CacheError> {
        if secs == 0 {
            return Err(CacheError::configuration("ttl must be > 0 seconds"));
        }
        Ok(Self(secs))
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.0)
    }
}

impl TryFrom<Duration> for Ttl {
    type Error = CacheError;

    fn try_from(value: Duration) -> Result<Self, Self::Error> {
        Self::from_secs(value.as_secs())
    }
}

/// Named value classes with their own TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlClass {
    UserProfile,
    ApiKey,
    Session,
    Organization,
    AiConfig,
    AiModel,
    RateLimit,
    Conversation,
    Analytics,
}

impl TtlClass {
    pub const ALL: [TtlClass; 9] = [
        TtlClass::UserProfile,
        TtlClass::ApiKey,
        TtlClass::Session,
        TtlClass::Organization,
        TtlClass::AiConfig,
        TtlClass::AiModel,
        TtlClass::RateLimit,
        TtlClass::Conversation,
        TtlClass::Analytics,
    ];

    /// Built-in TTL for this class.
    pub const fn default_ttl(self) -> Ttl {
        match self {
            TtlClass::UserProfile => Ttl::from_secs_const(3600),
            TtlClass::ApiKey => Ttl::from_secs_const(3600),
            TtlClass::Session => Ttl::from_secs_const(1800),
            TtlClass::Organization => Ttl::from_secs_const(7200),
            TtlClass::AiConfig => Ttl::from_secs_const(86400),
            TtlClass::AiModel => Ttl::from_secs_const(43200),
            TtlClass::RateLimit => Ttl::from_secs_const(60),
            TtlClass::Conversation => Ttl::from_secs_const(3600),
            TtlClass::Analytics => Ttl::from_secs_const(86400),
        }
    }
}

impl fmt::Display for TtlClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TtlClass::UserProfile => "user_profile",
            TtlClass::ApiKey => "api_key",
            TtlClass::Session => "session",
            TtlClass::Organization => "organization",
            TtlClass::AiConfig => "ai_config",
            TtlClass::AiModel => "ai_model",
            TtlClass::RateLimit => "rate_limit",
            TtlClass::Conversation => "conversation",
            TtlClass::Analytics => "analytics",
        };
        f.write_str(name)
    }
}

/// Per-class TTL lookup, seeded from [`TtlClass::default_ttl`].
#[derive(Debug, Clone)]
pub struct TtlTable {
    entries: [Ttl; 9],
}

impl Default for TtlTable {
    fn default() -> Self {
        Self {
            entries: TtlClass::ALL.map(TtlClass::default_ttl),
        }
    }
}

impl TtlTable {
    pub fn get(&self, class: TtlClass) -> Ttl {
        self.entries[class as usize]
    }

    /// Override one class. Zero is rejected.
    pub fn set(&mut self, class: TtlClass, secs: u64) -> Result<(), CacheError> {
        let ttl = Ttl::from_secs(secs).map_err(|_| {
            CacheError::configuration(format!("ttl.{class} must be > 0 seconds"))
        })?;
        self.entries[class as usize] = ttl;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(user(42).as_str(), "user:42");
        assert_eq!(user_api_keys("u1").as_str(), "user:u1:apikeys");
        assert_eq!(api_key("k9").as_str(), "apikey:k9");
        assert_eq!(session("s").as_str(), "session:s");
        assert_eq!(organization(7).as_str(), "org:7");
        assert_eq!(ai_config("openai").as_str(), "ai:config:openai");
        assert_eq!(ai_model("gpt").as_str(), "ai:model:gpt");
        assert_eq!(rate_limit("u1", "/api/x").as_str(), "rate-limit:u1:/api/x");
        assert_eq!(conversation("c").as_str(), "conversation:c");
        assert_eq!(analytics("2024-05-01").as_str(), "analytics:daily:2024-05-01");
    }

    #[test]
    fn keys_are_deterministic() {
        assert_eq!(user(42), user("42"));
        assert_ne!(user(42), organization(42));
    }

    #[test]
    fn zero_ttl_is_rejected() {
        assert!(Ttl::from_secs(0).is_err());
        assert!(Ttl::try_from(Duration::from_millis(999)).is_err());
        assert_eq!(Ttl::from_secs(5).unwrap().as_duration(), Duration::from_secs(5));
    }

    #[test]
    fn table_defaults_and_overrides() {
        let mut table = TtlTable::default();
        assert_eq!(table.get(TtlClass::Session).as_secs(), 1800);
        assert_eq!(table.get(TtlClass::AiModel).as_secs(), 43200);

        table.set(TtlClass::Session, 60).unwrap();
        assert_eq!(table.get(TtlClass::Session).as_secs(), 60);

        let err = table.set(TtlClass::Analytics, 0).unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: ttl.analytics must be > 0 seconds");
    }
}
