use std::sync::Arc;

use cachet_core::{
    CacheError, CacheResult, Codec, KeyTtl, KeyValueStore, TelemetrySink, Ttl, keys,
};
use serde::Serialize;

use super::CacheContext;

/// Limit and window of a fixed-window counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    max_requests: u64,
    window: Ttl,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Ttl::from_secs_const(60),
        }
    }
}

impl RateLimitPolicy {
    pub fn new(max_requests: u64, window_secs: u64) -> CacheResult<Self> {
        if max_requests == 0 {
            return Err(CacheError::configuration("rate_limit.max_requests must be > 0"));
        }
        let window = Ttl::from_secs(window_secs)
            .map_err(|_| CacheError::configuration("rate_limit.window_secs must be > 0"))?;
        Ok(Self {
            max_requests,
            window,
        })
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn window(&self) -> Ttl {
        self.window
    }
}

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
    /// Seconds until the current window ends.
    pub reset_in: u64,
}

impl RateLimitDecision {
    fn fail_open(policy: RateLimitPolicy) -> Self {
        Self {
            allowed: true,
            remaining: policy.max_requests,
            limit: policy.max_requests,
            reset_in: policy.window.as_secs(),
        }
    }
}

/// Fixed-window request counter keyed by subject and resource.
///
/// Fails open: when the store cannot be reached every request is allowed.
#[derive(Clone)]
pub struct RateLimiter {
    ctx: CacheContext,
    defaults: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        telemetry: Arc<dyn TelemetrySink>,
        defaults: RateLimitPolicy,
    ) -> Self {
        Self::from_context(CacheContext::new(store, Codec::default(), telemetry), defaults)
    }

    pub(crate) fn from_context(ctx: CacheContext, defaults: RateLimitPolicy) -> Self {
        Self { ctx, defaults }
    }

    pub fn defaults(&self) -> RateLimitPolicy {
        self.defaults
    }

    /// Check against the configured default limit and window.
    pub async fn check(&self, subject: &str, resource: &str) -> RateLimitDecision {
        self.is_allowed(subject, resource, self.defaults).await
    }

    /// Count one request for `subject` on `resource` and decide whether it
    /// fits in the current window.
    pub async fn is_allowed(
        &self,
        subject: &str,
        resource: &str,
        policy: RateLimitPolicy,
    ) -> RateLimitDecision {
        let key = keys::rate_limit(subject, resource);
        let decision = match self.count(key.as_str(), policy).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "rate limit check failed, allowing request");
                RateLimitDecision::fail_open(policy)
            }
        };

        if !decision.allowed {
            tracing::debug!(key = %key, limit = decision.limit, "rate limit exceeded");
        }
        self.ctx.telemetry.track_metric(
            "RateLimitCheck",
            if decision.allowed { 1.0 } else { 0.0 },
            &[
                ("resource", resource.to_string()),
                ("allowed", decision.allowed.to_string()),
            ],
        );
        decision
    }

    async fn count(
        &self,
        key: &str,
        policy: RateLimitPolicy,
    ) -> cachet_core::StoreResult<RateLimitDecision> {
        let store = &self.ctx.store;
        let count = store.incr(key).await?.max(0) as u64;

        // Only the first hit opens the window; later hits must not extend it.
        if count == 1 {
            store.expire(key, policy.window).await?;
        }

        let reset_in = match store.ttl(key).await? {
            KeyTtl::Expires(secs) => secs,
            KeyTtl::Persistent => {
                // INCR landed but its EXPIRE did not.
                tracing::warn!(key = %key, "rate limit counter has no expiry, repairing");
                store.expire(key, policy.window).await?;
                policy.window.as_secs()
            }
            KeyTtl::Missing => policy.window.as_secs(),
        };

        Ok(RateLimitDecision {
            allowed: count <= policy.max_requests,
            remaining: policy.max_requests.saturating_sub(count),
            limit: policy.max_requests,
            reset_in,
        })
    }

    /// Clear the counter for `subject` on `resource`. Best-effort.
    pub async fn reset(&self, subject: &str, resource: &str) {
        let key = keys::rate_limit(subject, resource);
        match self.ctx.store.del(key.as_str()).await {
            Ok(_) => {
                tracing::debug!(key = %key, "rate limit reset");
                self.ctx.telemetry.track_event(
                    "RateLimitReset",
                    &[
                        ("subject", subject.to_string()),
                        ("resource", resource.to_string()),
                    ],
                );
            }
            Err(e) => tracing::warn!(key = %key, error = %e, "rate limit reset failed"),
        }
    }
}
