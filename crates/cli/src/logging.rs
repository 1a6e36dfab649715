use std::str::FromStr;

use anyhow::{anyhow, Result};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: LevelFilter,
    /// JSON lines instead of the human-readable format
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LevelFilter::INFO,
            json: false,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: LevelFilter) -> Self {
        LoggingConfig {
            level,
            ..Default::default()
        }
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }
}

/// Parse a level name, falling back to `info` when missing or unknown
pub fn parse_log_level(level: Option<&str>) -> LevelFilter {
    level
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .and_then(|l| LevelFilter::from_str(l).ok())
        .unwrap_or(LevelFilter::INFO)
}

/// Install the global subscriber
///
/// `RUST_LOG` directives still apply on top of the configured level.
pub fn setup_logging(config: LoggingConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = if config.json {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };

    installed.map_err(|e| anyhow!("failed to install log subscriber: {}", e))
}
