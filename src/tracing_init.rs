//! Tracing Setup
//!
//! Structured logging for the agent built on `tracing` and `tracing-subscriber`:
//! - Structured events with fields (`group`, `image`, `device`, ...)
//! - Pretty, compact or JSON output
//! - `RUST_LOG` overrides the configured level
//!
//! # Example
//! ```no_run
//! use imager_agent::{config::ImagerConfig, tracing_init};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ImagerConfig::load()?;
//! tracing_init::init_from_config(&config)?;
//! info!(camera = %config.devices.camera, "Imager starting");
//! # Ok(())
//! # }
//! ```

use crate::config::ImagerConfig;
use crate::error::{AppResult, ImagerError};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, colored (interactive use)
    Pretty,
    /// One line per event, no colors
    Compact,
    /// One JSON object per event (log aggregation)
    Json,
}

impl FromStr for OutputFormat {
    type Err = ImagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(ImagerError::Configuration(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                other
            ))),
        }
    }
}

/// Tracing options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Minimum level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Emit span NEW/CLOSE events
    pub with_span_events: bool,
    /// Include source file and line
    pub with_file_and_line: bool,
    /// Include thread names
    pub with_thread_names: bool,
    /// ANSI colors (Pretty only)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Derive tracing options from the agent configuration
    pub fn from_config(config: &ImagerConfig) -> AppResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            ..Default::default()
        })
    }

    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize tracing from the agent configuration
pub fn init_from_config(config: &ImagerConfig) -> AppResult<()> {
    init(TracingConfig::from_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: a second call (tests, embedding applications) is a no-op.
pub fn init(config: TracingConfig) -> AppResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let result = match config.format {
        OutputFormat::Pretty => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .pretty()
                    .with_span_events(span_events)
                    .with_file(config.with_file_and_line)
                    .with_line_number(config.with_file_and_line)
                    .with_thread_names(config.with_thread_names)
                    .with_ansi(config.with_ansi)
                    .with_filter(env_filter),
            )
            .try_init(),
        OutputFormat::Compact => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .compact()
                    .with_span_events(span_events)
                    .with_file(config.with_file_and_line)
                    .with_line_number(config.with_file_and_line)
                    .with_thread_names(config.with_thread_names)
                    .with_ansi(false)
                    .with_filter(env_filter),
            )
            .try_init(),
        OutputFormat::Json => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(span_events)
                    .with_file(config.with_file_and_line)
                    .with_line_number(config.with_file_and_line)
                    .with_thread_names(config.with_thread_names)
                    .with_filter(env_filter),
            )
            .try_init(),
    };

    result.or_else(already_initialized_is_ok)
}

fn already_initialized_is_ok(e: TryInitError) -> AppResult<()> {
    if e.to_string().contains("already") {
        Ok(())
    } else {
        Err(ImagerError::Configuration(format!(
            "Failed to initialize tracing: {}",
            e
        )))
    }
}

/// Parse a log level name (case-insensitive)
pub fn parse_log_level(level: &str) -> AppResult<Level> {
    Level::from_str(level).map_err(|_| {
        ImagerError::Configuration(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))
    })
}
