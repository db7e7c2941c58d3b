//! Diagnostic Tracing Setup
//!
//! Structured operator-facing diagnostics using `tracing` and `tracing-subscriber`:
//! - Multiple output formats (pretty, compact, JSON)
//! - `RUST_LOG` overrides the configured level
//! - Idempotent initialisation, safe to call from tests
//!
//! Tracing is separate from the run log. The run log is the test record written for each
//! run; tracing is for whoever is watching the rig.
//!
//! # Example
//! ```no_run
//! use b2b_dyno::{config::DynoConfig, tracing_setup};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DynoConfig::load_from("dyno.toml")?;
//! tracing_setup::init_from_config(&config)?;
//! tracing::info!("Rig configured");
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::DynoConfig;
use crate::error::{AppResult, DynoError};

/// Output format for tracing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, coloured when stdout is a terminal (for the bench)
    #[default]
    Pretty,
    /// Single-line format without colors
    Compact,
    /// JSON format for log collection
    Json,
}

/// Resolved tracing settings.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Source locations on every event; on at debug and trace
    pub with_file_and_line: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_file_and_line: false,
        }
    }
}

impl TracingConfig {
    /// Resolve the `[tracing]` section of the dyno configuration.
    pub fn from_dyno_config(config: &DynoConfig) -> AppResult<Self> {
        let level = parse_log_level(&config.tracing.level)?;
        Ok(Self {
            level,
            format: config.tracing.format,
            with_file_and_line: level >= Level::DEBUG,
        })
    }
}

/// Initialize tracing from the dyno configuration
pub fn init_from_config(config: &DynoConfig) -> AppResult<()> {
    init(TracingConfig::from_dyno_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: if a subscriber is already installed (an earlier call, or a test harness),
/// this returns `Ok(())`.
pub fn init(config: TracingConfig) -> AppResult<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directive(config.level)));
    let located = config.with_file_and_line;

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(located)
            .with_line_number(located)
            .with_ansi(std::io::stdout().is_terminal())
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_file(located)
            .with_line_number(located)
            .with_ansi(false)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_file(located)
            .with_line_number(located)
            .boxed(),
    };

    match tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init()
    {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("global default trace dispatcher has already been set") => {
            Ok(())
        }
        Err(e) => Err(DynoError::Configuration(format!(
            "cannot install tracing subscriber: {e}"
        ))),
    }
}

/// Parse a `[tracing] level` value, case-insensitively.
pub fn parse_log_level(level: &str) -> AppResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(DynoError::Configuration(format!(
            "tracing level '{level}' is not one of trace, debug, info, warn, error"
        ))),
    }
}

/// `EnvFilter` directive for a level.
fn filter_directive(level: Level) -> String {
    level.as_str().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));

        // Case insensitive
        assert!(matches!(parse_log_level("INFO"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));

        assert!(matches!(
            parse_log_level("verbose"),
            Err(DynoError::Configuration(_))
        ));
    }

    #[test]
    fn test_tracing_config_from_dyno_config() {
        let config = DynoConfig::from_toml_str(
            r#"
            [controllers]
            dut_port = "a"
            absorber_port = "b"
            [grid]
            mode = "cross"
            speeds_rpm = [100.0]
            currents_a = [1.0]
            [capture]
            samples = 1
            poll_interval = "10ms"
            [ramp]
            settling = "10ms"
            max_speed_step_rpm = 10.0
            max_current_step_a = 1.0
            [tracing]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        let tracing_config = TracingConfig::from_dyno_config(&config).unwrap();
        assert!(matches!(tracing_config.level, Level::DEBUG));
        assert_eq!(tracing_config.format, OutputFormat::Json);
        assert!(tracing_config.with_file_and_line);
        assert!(!TracingConfig::default().with_file_and_line);
    }

    #[test]
    fn test_filter_string_is_lowercase() {
        assert_eq!(filter_directive(Level::WARN), "warn");
    }
}
