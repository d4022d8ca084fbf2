mod cli;
mod commands;
mod output;

use std::sync::Arc;

use anyhow::{Context, Result};
use cachet::telemetry::{FanoutTelemetry, TracingTelemetry};
use cachet::{AppConfig, CacheLayer, MetricsTelemetry, TelemetrySink};
use clap::Parser;

use cli::{Cli, Commands, RateLimitCommands};
use output::print_error;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let format = cli.format.unwrap_or_default();

    let config =
        cachet::config::loader::load_config(cli.config.as_deref()).context("failed to load configuration")?;

    cachet::init_tracing_with_level(log_level(&cli, &config));

    if let Commands::Config = cli.command {
        return commands::cache::show_config(&config);
    }

    let mut telemetry = FanoutTelemetry::new().with(Arc::new(TracingTelemetry));
    if config.metrics.enabled && cachet::init_metrics() {
        telemetry = telemetry.with(Arc::new(MetricsTelemetry));
    }
    let telemetry: Arc<dyn TelemetrySink> = Arc::new(telemetry);

    let layer = CacheLayer::from_config(&config, telemetry)
        .await
        .context("failed to initialize cache layer")?;

    let result = match &cli.command {
        Commands::Ping => commands::cache::ping(&layer).await,
        Commands::Stats => commands::cache::stats(&layer, format).await,
        Commands::Get(args) => commands::cache::get(&layer, &args.key).await,
        Commands::Invalidate(args) => commands::cache::invalidate(&layer, &args.key).await,
        Commands::RateLimit(args) => match &args.command {
            RateLimitCommands::Check(check) => {
                commands::rate_limit::check(&layer, check, format).await
            }
            RateLimitCommands::Reset(target) => commands::rate_limit::reset(&layer, target).await,
        },
        Commands::Warm(args) => commands::warm::warm(&layer, args, format).await,
        Commands::Config => Ok(()),
    };

    layer.shutdown().await;

    if cli.print_metrics {
        match cachet::render_metrics() {
            Some(text) => println!("{text}"),
            None => output::print_warning("metrics are disabled (metrics.enabled = false)"),
        }
    }

    result
}

/// `--log-level` wins over `logging.level` from config.
fn log_level<'a>(cli: &'a Cli, config: &'a AppConfig) -> &'a str {
    cli.log_level.as_deref().unwrap_or(&config.logging.level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_comes_from_config_unless_overridden() {
        let mut config = AppConfig::default();
        config.logging.level = "debug".into();

        let cli = Cli::parse_from(["cachet", "ping"]);
        assert_eq!(log_level(&cli, &config), "debug");

        let cli = Cli::parse_from(["cachet", "--log-level", "error", "ping"]);
        assert_eq!(log_level(&cli, &config), "error");
    }
}
