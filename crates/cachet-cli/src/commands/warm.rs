use std::convert::Infallible;

use anyhow::{Context, Result};
use cachet::CacheLayer;
use serde_json::{Map, Value};

use crate::cli::{OutputFormat, WarmArgs, WarmClass};
use crate::output::{print_record, print_warning};

pub async fn warm(layer: &CacheLayer, args: &WarmArgs, format: OutputFormat) -> Result<()> {
    let entries = read_entries(&args.file)?;
    let ids: Vec<String> = entries.keys().cloned().collect();
    let loader = |id: String| {
        let value = entries.get(&id).cloned();
        async move { Ok::<_, Infallible>(value) }
    };

    let warmer = layer.warmer();
    let report = match args.class {
        WarmClass::UserProfile => warmer.warm_user_profiles(ids, loader).await,
        WarmClass::AiConfig => warmer.warm_ai_configs(ids, loader).await,
    };

    print_record(&report, format)?;
    if report.failed > 0 {
        print_warning(&format!("{} entries were not cached", report.failed));
    }
    Ok(())
}

fn read_entries(path: &str) -> Result<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    let value: Value =
        serde_json::from_str(&raw).with_context(|| format!("{path} is not valid JSON"))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("{path} must contain a JSON object of id -> value"),
    }
}
