//! Grid trader entrypoint.
//!
//! CLI arguments plus a TOML config file; credentials come from the
//! environment. Exit code is non-zero on fatal configuration or ledger
//! failures.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use grid_trader::{
    AppConfig, BinanceSpot, LogFormat, LogMetricsSink, LogNotifier, Supervisor,
};

#[derive(Parser)]
#[command(name = "grid_trader")]
#[command(version, about = "Autonomous spot-market grid trading agent", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "grid_trader.toml")]
    config: PathBuf,

    /// Override trading symbol from config
    #[arg(long)]
    symbol: Option<String>,

    /// API key (overrides config)
    #[arg(long, env = "BINANCE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Secret key (overrides config)
    #[arg(long, env = "BINANCE_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Output format (pretty, json, compact)
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a sample config file
    GenerateConfig {
        /// Output file path
        #[arg(short, long, default_value = "grid_trader.toml")]
        output: PathBuf,
    },
    /// Validate config without running
    ValidateConfig,
    /// Run the grid trader (default)
    Run,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env if present, before CLI parsing picks up env-backed args.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::GenerateConfig { output }) => {
            generate_sample_config(output)?;
            return Ok(());
        }
        Some(Commands::ValidateConfig) => {
            let config = load_config(&cli)?;
            config.validate()?;
            println!("Configuration is valid:\n{config:#?}");
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    let config = load_config(&cli)?;
    config.validate()?;

    let _log_guard = grid_trader::init_logging(&config.logging)?;

    let api_key = cli
        .api_key
        .clone()
        .or_else(|| config.exchange.api_key.clone())
        .ok_or("API key required: set BINANCE_API_KEY or [exchange].api_key")?;
    let secret_key = cli
        .secret_key
        .clone()
        .or_else(|| config.exchange.secret_key.clone())
        .ok_or("Secret key required: set BINANCE_SECRET_KEY or [exchange].secret_key")?;

    let exchange = Arc::new(BinanceSpot::with_base_url(
        api_key,
        secret_key,
        config.exchange.base_url.clone(),
    ));
    exchange.sync_time().await?;

    info!(
        symbol = %config.grid.symbol,
        grid_levels = config.grid.grid_levels,
        range_min = config.grid.range_min,
        range_max = config.grid.range_max,
        "Starting grid trader"
    );

    let config_path = cli.config.exists().then(|| cli.config.clone());
    let supervisor = Supervisor::new(
        config,
        config_path,
        exchange,
        Arc::new(LogNotifier::new()),
        Arc::new(LogMetricsSink),
    );
    supervisor.run().await?;

    Ok(())
}

fn load_config(cli: &Cli) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let mut config = AppConfig::load_from(&cli.config)?;

    if let Some(symbol) = &cli.symbol {
        config.grid.symbol = symbol.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.logging.format = match format.as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        };
    }

    Ok(config)
}

fn generate_sample_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let sample = AppConfig::default();
    let content = toml::to_string_pretty(&sample)?;

    let with_comments = format!(
        r#"# Grid trader configuration
# See: grid_trader --help

{content}
# Note: set credentials via BINANCE_API_KEY / BINANCE_SECRET_KEY
# environment variables, or uncomment below (not recommended):
# [exchange]
# api_key = "..."
# secret_key = "..."
"#
    );

    std::fs::write(path, with_comments)?;
    println!("Sample config written to: {}", path.display());
    Ok(())
}
