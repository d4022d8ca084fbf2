use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "cachet")]
#[command(about = "Inspect and operate a cachet cache")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a TOML config file (defaults to ./cachet.toml when present)
    #[arg(short, long, global = true, env = "CACHET_CONFIG")]
    pub config: Option<String>,

    /// Log level (overrides logging.level from config)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Output format
    #[arg(short, long, global = true)]
    pub format: Option<OutputFormat>,

    /// Print Prometheus metrics collected while the command ran
    #[arg(long, global = true)]
    pub print_metrics: bool,
}

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check that the store answers
    Ping,
    /// Show store statistics and the keyspace hit rate
    Stats,
    /// Read and decode a cached value
    Get(KeyArgs),
    /// Remove a cached value
    Invalidate(KeyArgs),
    /// Inspect or reset rate-limit counters
    RateLimit(RateLimitArgs),
    /// Preload values from a JSON file
    Warm(WarmArgs),
    /// Show the effective configuration (credentials redacted)
    Config,
}

#[derive(clap::Args)]
pub struct KeyArgs {
    /// Cache key without the store prefix (e.g. user:42)
    pub key: String,
}

#[derive(clap::Args)]
pub struct RateLimitArgs {
    #[command(subcommand)]
    pub command: RateLimitCommands,
}

#[derive(Subcommand)]
pub enum RateLimitCommands {
    /// Count one request and print the decision
    Check(RateLimitCheckArgs),
    /// Clear the counter
    Reset(RateLimitTarget),
}

#[derive(clap::Args)]
pub struct RateLimitTarget {
    /// Subject being limited (user id, API key, IP)
    pub subject: String,
    /// Resource being accessed (e.g. /api/chat)
    pub resource: String,
}

#[derive(clap::Args)]
pub struct RateLimitCheckArgs {
    #[command(flatten)]
    pub target: RateLimitTarget,
    /// Max requests per window (defaults to rate_limit.max_requests)
    #[arg(long)]
    pub max: Option<u64>,
    /// Window length in seconds (defaults to rate_limit.window_secs)
    #[arg(long)]
    pub window: Option<u64>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum WarmClass {
    /// Keys `user:{id}` with the user_profile TTL
    UserProfile,
    /// Keys `ai:config:{provider}` with the ai_config TTL
    AiConfig,
}

#[derive(clap::Args)]
pub struct WarmArgs {
    /// JSON object mapping identifiers to values
    pub file: String,
    /// Value class to warm
    #[arg(long, value_enum, default_value = "user-profile")]
    pub class: WarmClass,
}
