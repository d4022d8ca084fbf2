use anyhow::{Context, Result};
use cachet::{AppConfig, CacheLayer, HitRate, StoreInfo};
use colored::Colorize;
use serde::Serialize;
use serde_json::Value;

use crate::cli::OutputFormat;
use crate::output::{print_json, print_record, print_success, print_warning};

pub async fn ping(layer: &CacheLayer) -> Result<()> {
    let store = layer.store();
    store
        .ping()
        .await
        .with_context(|| format!("{} store did not answer", store.provider_name()))?;
    print_success(&format!(
        "PONG from {} store ({})",
        store.provider_name(),
        store.state()
    ));
    Ok(())
}

#[derive(Serialize)]
struct StatsReport {
    info: StoreInfo,
    hit_rate: HitRate,
}

pub async fn stats(layer: &CacheLayer, format: OutputFormat) -> Result<()> {
    let stats = layer.stats();
    let Some(info) = stats.get_info().await else {
        anyhow::bail!("store unavailable; no statistics");
    };
    let hit_rate = HitRate::from_counts(info.keyspace_hits, info.keyspace_misses);

    match format {
        OutputFormat::Json => print_json(&StatsReport { info, hit_rate }),
        OutputFormat::Table => {
            print_record(&info, format)?;
            println!(
                "{}: {:.2}% ({} hits / {} lookups)",
                "Hit rate".cyan(),
                hit_rate.hit_rate,
                hit_rate.hits,
                hit_rate.total
            );
            Ok(())
        }
    }
}

pub async fn get(layer: &CacheLayer, key: &str) -> Result<()> {
    let value: Option<Value> = layer
        .peek(key)
        .await
        .with_context(|| format!("failed to read {key}"))?;
    match value {
        Some(value) => print_json(&value),
        None => {
            print_warning(&format!("{key} is not cached"));
            Ok(())
        }
    }
}

pub async fn invalidate(layer: &CacheLayer, key: &str) -> Result<()> {
    let removed = layer
        .store()
        .del(key)
        .await
        .with_context(|| format!("failed to invalidate {key}"))?;
    if removed > 0 {
        print_success(&format!("Invalidated {key}"));
    } else {
        print_warning(&format!("{key} was not cached"));
    }
    Ok(())
}

pub fn show_config(config: &AppConfig) -> Result<()> {
    let mut redacted = config.clone();
    if redacted.redis.password.is_some() {
        redacted.redis.password = Some("***".to_string());
    }
    println!("{}: {}", "Store URL".cyan(), config.redis.redacted_url());
    print_json(&redacted)
}
