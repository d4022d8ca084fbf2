use anyhow::Result;
use cachet::{CacheLayer, RateLimitPolicy};

use crate::cli::{OutputFormat, RateLimitCheckArgs, RateLimitTarget};
use crate::output::{print_record, print_success};

pub async fn check(layer: &CacheLayer, args: &RateLimitCheckArgs, format: OutputFormat) -> Result<()> {
    let limiter = layer.rate_limiter();
    let defaults = limiter.defaults();
    let policy = RateLimitPolicy::new(
        args.max.unwrap_or(defaults.max_requests()),
        args.window.unwrap_or(defaults.window().as_secs()),
    )?;

    let decision = limiter
        .is_allowed(&args.target.subject, &args.target.resource, policy)
        .await;
    print_record(&decision, format)
}

pub async fn reset(layer: &CacheLayer, target: &RateLimitTarget) -> Result<()> {
    layer
        .rate_limiter()
        .reset(&target.subject, &target.resource)
        .await;
    print_success(&format!(
        "Reset rate limit for {} on {}",
        target.subject, target.resource
    ));
    Ok(())
}
