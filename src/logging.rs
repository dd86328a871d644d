//! Structured logging setup.
//!
//! `tracing` with EnvFilter, optional daily-rotating file output, and
//! component log targets for filtering:
//!
//! | Target | Description |
//! |--------|-------------|
//! | `grid_trader::controller` | Rung decisions and repositions |
//! | `grid_trader::pipeline` | Order placement and retries |
//! | `grid_trader::ingest` | Execution-report processing |
//! | `grid_trader::reconcile` | Reconciliation passes |
//! | `grid_trader::volatility` | Spacing and regime updates |
//! | `grid_trader::breaker` | Circuit-breaker decisions |
//! | `grid_trader::stream` | WebSocket lifecycle |
//! | `grid_trader::ledger` | Store and balance activity |

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable format (default for development)
    #[default]
    Pretty,
    /// JSON format (best for log aggregation)
    Json,
    /// Compact single-line format
    Compact,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogSettings {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_level")]
    pub level: String,
    /// Stdout format
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for rotated log files
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// Also write JSON logs to a daily-rotated file
    #[serde(default)]
    pub file_enabled: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            log_dir: default_log_dir(),
            file_enabled: false,
        }
    }
}

/// Initialize the global subscriber.
///
/// Returns the appender guard when file logging is enabled; it must be kept
/// alive for the duration of the program so buffered lines are flushed.
pub fn init_logging(settings: &LogSettings) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(&settings.level)
            .add_directive("hyper=warn".parse().expect("static directive"))
            .add_directive("reqwest=warn".parse().expect("static directive"))
            .add_directive("tokio_tungstenite=warn".parse().expect("static directive"))
    });

    if settings.file_enabled {
        std::fs::create_dir_all(&settings.log_dir)?;
        let appender =
            RollingFileAppender::new(Rotation::DAILY, &settings.log_dir, "grid-trader.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let file_layer = fmt::layer().with_writer(writer).with_ansi(false).json();

        match settings.format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(file_layer)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Compact => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(file_layer)
                    .with(fmt::layer().compact())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(file_layer)
                    .with(fmt::layer().with_target(false))
                    .init();
            }
        }
        return Ok(Some(guard));
    }

    match settings.format {
        LogFormat::Json => {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        }
        LogFormat::Compact => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .compact()
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
        }
    }
    Ok(None)
}

/// Log target constants for component-specific logging.
pub mod targets {
    pub const CONTROLLER: &str = "grid_trader::controller";
    pub const PIPELINE: &str = "grid_trader::pipeline";
    pub const INGEST: &str = "grid_trader::ingest";
    pub const RECONCILE: &str = "grid_trader::reconcile";
    pub const VOLATILITY: &str = "grid_trader::volatility";
    pub const BREAKER: &str = "grid_trader::breaker";
    pub const STREAM: &str = "grid_trader::stream";
    pub const LEDGER: &str = "grid_trader::ledger";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults() {
        let settings = LogSettings::default();
        assert_eq!(settings.level, "info");
        assert_eq!(settings.format, LogFormat::Pretty);
        assert!(!settings.file_enabled);
    }

    #[test]
    fn format_serde() {
        let json = serde_json::to_string(&LogFormat::Json).unwrap();
        assert_eq!(json, "\"json\"");
        let parsed: LogFormat = serde_json::from_str("\"compact\"").unwrap();
        assert_eq!(parsed, LogFormat::Compact);
    }
}
