//! Centralized logging configuration for the Postflow binaries
//!
//! Supports text, JSON and pretty output, configured either explicitly or
//! from environment variables.
//!
//! # Examples
//!
//! ```no_run
//! use libpostflow::logging::{LoggingConfig, LogFormat};
//!
//! let config = LoggingConfig::new(LogFormat::Json, "info".to_string(), false);
//! config.init();
//!
//! // Or respect POSTFLOW_LOG_FORMAT / POSTFLOW_LOG_LEVEL
//! libpostflow::logging::init_default();
//! ```

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

pub const LOG_FORMAT_ENV: &str = "POSTFLOW_LOG_FORMAT";
pub const LOG_LEVEL_ENV: &str = "POSTFLOW_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable text, no colors
    Text,
    /// One JSON object per line, for log shippers
    Json,
    /// Colored multi-line output for development
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(format!(
                "Invalid log format: '{}'. Valid options: text, json, pretty",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
            LogFormat::Pretty => write!(f, "pretty"),
        }
    }
}

pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
    pub verbose: bool,
}

impl LoggingConfig {
    pub fn new(format: LogFormat, level: String, verbose: bool) -> Self {
        Self {
            format,
            level,
            verbose,
        }
    }

    /// Read format and level from the environment, falling back to text/info
    pub fn from_env(verbose: bool) -> Self {
        let format = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(LogFormat::Text);
        let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string());
        Self::new(format, level, verbose)
    }

    /// Filter directive in effect: `RUST_LOG` wins, then `--verbose`, then the level
    pub fn filter(&self) -> EnvFilter {
        let fallback = if self.verbose { "debug" } else { self.level.as_str() };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
    }

    /// Install the global subscriber. Call once, early in `main`.
    ///
    /// A second call is a no-op.
    pub fn init(&self) {
        let filter = self.filter();

        let result = match self.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .with_span_list(true)
                .flatten_event(true)
                .with_target(true)
                .with_line_number(true)
                .with_file(true)
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true)
                .with_file(true)
                .try_init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_level(true)
                .try_init(),
        };

        if let Err(e) = result {
            tracing::debug!(error = %e, "Logging subscriber already installed");
        }
    }
}

/// Initialize logging from `POSTFLOW_LOG_FORMAT` and `POSTFLOW_LOG_LEVEL`
///
/// ```bash
/// export POSTFLOW_LOG_FORMAT=json
/// export POSTFLOW_LOG_LEVEL=debug
/// postflow-send --once
/// ```
pub fn init_default() {
    LoggingConfig::from_env(false).init();
}
