//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for a dyno run.
//! Configuration is loaded from:
//! 1. A TOML or JSON file (chosen by extension)
//! 2. Environment variables (prefixed with `B2B_DYNO_`, nested keys separated by `__`)
//!
//! Loading only checks shape. `DynoConfig::validate` checks meaning and turns the grid into a
//! [`TestPlan`]; nothing touches hardware until that has succeeded.
//!
//! # Example
//! ```no_run
//! use b2b_dyno::config::DynoConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DynoConfig::load_from("dyno.toml")?;
//! let plan = config.validate()?;
//! println!("{} operating points", plan.total_points());
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Json, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, DynoError};
use crate::sequencer::plan::{
    CaptureLength, GridMode, OperatingPoint, RampLimits, SpeedStage, StepBound, TestPlan,
};
use crate::tracing_setup::{parse_log_level, OutputFormat};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "B2B_DYNO_";

/// Top-level dyno configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynoConfig {
    /// Serial ports of the two controllers
    pub controllers: ControllerConfig,
    /// Operating-point grid
    pub grid: GridConfig,
    /// Sampling parameters
    pub capture: CaptureConfig,
    /// Ramp parameters
    pub ramp: RampConfig,
    /// Run log file settings
    #[serde(default)]
    pub log: LogConfig,
    /// Diagnostic tracing settings
    #[serde(default)]
    pub tracing: TracingSettings,
}

/// Controller connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Serial port of the device under test
    pub dut_port: String,
    /// Serial port of the absorber
    pub absorber_port: String,
    /// Serial baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// How long to wait for a reply before treating a poll as unanswered
    #[serde(default = "default_reply_timeout", with = "humantime_serde")]
    pub reply_timeout: Duration,
}

/// Operating-point grid, with an explicit mode flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GridConfig {
    /// Every speed crossed with every current; capture length from `[capture]`.
    Cross {
        /// Absorber speeds, outer loop
        speeds_rpm: Vec<f64>,
        /// DUT currents, inner loop
        currents_a: Vec<f64>,
    },
    /// Parallel arrays of (speed, current, capture duration), one operating point per index.
    Paired {
        /// Absorber speed per point
        speeds_rpm: Vec<f64>,
        /// DUT current per point
        currents_a: Vec<f64>,
        /// Capture duration per point
        durations: Vec<humantime_serde::Serde<Duration>>,
    },
}

/// Capture burst settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Samples per operating point (cross mode)
    #[serde(default)]
    pub samples: Option<u32>,
    /// Burst duration per operating point (cross mode)
    #[serde(default, with = "humantime_serde")]
    pub duration: Option<Duration>,
    /// Delay between polls
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Delay after reaching a current set-point, before capturing
    #[serde(default, with = "humantime_serde")]
    pub settling: Duration,
}

/// Ramp settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampConfig {
    /// Delay after each ramp step
    #[serde(with = "humantime_serde")]
    pub settling: Duration,
    /// Largest speed change per step
    pub max_speed_step_rpm: f64,
    /// Largest current change per step
    pub max_current_step_a: f64,
}

/// Run log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory the log file is created in
    #[serde(default = "default_log_directory")]
    pub directory: PathBuf,
    /// File name prefix; a `_YYYYmmdd_HHMMSS.txt` suffix is appended
    #[serde(default = "default_log_prefix")]
    pub prefix: String,
    /// Identity written on the first log line
    #[serde(default = "default_script_name")]
    pub script_name: String,
}

/// Diagnostic tracing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingSettings {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_tracing_level")]
    pub level: String,
    /// Output format (pretty, compact, json)
    #[serde(default)]
    pub format: OutputFormat,
}

// Default value functions
fn default_baud_rate() -> u32 {
    115_200
}

fn default_reply_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_log_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_prefix() -> String {
    "dut_log".to_string()
}

fn default_script_name() -> String {
    "Back-to-back dyno".to_string()
}

fn default_tracing_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            prefix: default_log_prefix(),
            script_name: default_script_name(),
        }
    }
}

impl Default for TracingSettings {
    fn default() -> Self {
        Self {
            level: default_tracing_level(),
            format: OutputFormat::default(),
        }
    }
}

impl DynoConfig {
    /// Load configuration from a file and environment variables
    ///
    /// Files ending in `.json` are read as JSON, everything else as TOML.
    /// Environment variables override the file, e.g. `B2B_DYNO_CONTROLLERS__DUT_PORT=/dev/ttyACM2`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(DynoError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("configuration file not found: {}", path.display()),
            )));
        }

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let figment = if is_json {
            Figment::new().merge(Json::file(path))
        } else {
            Figment::new().merge(Toml::file(path))
        };

        Ok(figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Parse a TOML document without touching the filesystem or environment.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Ok(Figment::new().merge(Toml::string(toml)).extract()?)
    }

    /// Validate configuration and build the test plan
    ///
    /// Every check that could stop a run happens here, before any hardware command.
    pub fn validate(&self) -> AppResult<TestPlan> {
        parse_log_level(&self.tracing.level)?;

        let dut = self.controllers.dut_port.trim();
        let absorber = self.controllers.absorber_port.trim();
        if dut.is_empty() || absorber.is_empty() {
            return Err(invalid("both controller ports must be set"));
        }
        if dut == absorber {
            return Err(invalid(format!(
                "DUT and absorber share the same port '{dut}'"
            )));
        }

        let ramp = RampLimits {
            settling: self.ramp.settling,
            max_speed_step: StepBound::new(self.ramp.max_speed_step_rpm)?,
            max_current_step: StepBound::new(self.ramp.max_current_step_a)?,
        };

        let poll_interval = self.capture.poll_interval;
        let (mode, stages) = match &self.grid {
            GridConfig::Cross {
                speeds_rpm,
                currents_a,
            } => {
                check_values("speeds_rpm", speeds_rpm)?;
                check_values("currents_a", currents_a)?;
                let capture = self.cross_capture_length()?;
                let stages = speeds_rpm
                    .iter()
                    .map(|&rpm| SpeedStage {
                        rpm,
                        points: currents_a
                            .iter()
                            .map(|&current_a| OperatingPoint {
                                rpm,
                                current_a,
                                capture,
                            })
                            .collect(),
                    })
                    .collect();
                (GridMode::Cross, stages)
            }
            GridConfig::Paired {
                speeds_rpm,
                currents_a,
                durations,
            } => {
                if self.capture.samples.is_some() || self.capture.duration.is_some() {
                    return Err(invalid(
                        "paired grids take per-point durations; remove capture.samples and capture.duration",
                    ));
                }
                check_values("speeds_rpm", speeds_rpm)?;
                check_values("currents_a", currents_a)?;
                if currents_a.len() != speeds_rpm.len() || durations.len() != speeds_rpm.len() {
                    return Err(invalid(format!(
                        "paired grid arrays differ in length: {} speeds, {} currents, {} durations",
                        speeds_rpm.len(),
                        currents_a.len(),
                        durations.len()
                    )));
                }
                let mut stages = Vec::with_capacity(speeds_rpm.len());
                for ((&rpm, &current_a), duration) in
                    speeds_rpm.iter().zip(currents_a).zip(durations)
                {
                    let capture = CaptureLength::Duration(**duration);
                    check_capture(capture, poll_interval)?;
                    stages.push(SpeedStage {
                        rpm,
                        points: vec![OperatingPoint {
                            rpm,
                            current_a,
                            capture,
                        }],
                    });
                }
                (GridMode::Paired, stages)
            }
        };

        Ok(TestPlan {
            mode,
            stages,
            poll_interval,
            settling: self.capture.settling,
            ramp,
        })
    }

    fn cross_capture_length(&self) -> AppResult<CaptureLength> {
        let capture = match (self.capture.samples, self.capture.duration) {
            (Some(samples), None) => CaptureLength::Samples(samples),
            (None, Some(duration)) => CaptureLength::Duration(duration),
            (Some(_), Some(_)) => {
                return Err(invalid("set capture.samples or capture.duration, not both"))
            }
            (None, None) => return Err(invalid("capture.samples or capture.duration is required")),
        };
        check_capture(capture, self.capture.poll_interval)?;
        Ok(capture)
    }

    /// Controller ports as (DUT, absorber).
    pub fn ports(&self) -> (&str, &str) {
        (
            self.controllers.dut_port.trim(),
            self.controllers.absorber_port.trim(),
        )
    }
}

fn invalid(msg: impl Into<String>) -> DynoError {
    DynoError::Configuration(msg.into())
}

fn check_values(name: &str, values: &[f64]) -> AppResult<()> {
    if values.is_empty() {
        return Err(invalid(format!("grid.{name} is empty")));
    }
    if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
        return Err(invalid(format!("grid.{name} contains non-finite value {bad}")));
    }
    Ok(())
}

fn check_capture(capture: CaptureLength, poll_interval: Duration) -> AppResult<()> {
    match capture {
        CaptureLength::Samples(0) => Err(invalid("capture.samples must be at least 1")),
        CaptureLength::Samples(_) => Ok(()),
        CaptureLength::Duration(_) if poll_interval.is_zero() => Err(invalid(
            "capture.poll_interval must be positive when capturing for a duration",
        )),
        CaptureLength::Duration(duration) if duration < poll_interval => Err(invalid(format!(
            "capture duration {duration:?} is shorter than the poll interval {poll_interval:?}"
        ))),
        CaptureLength::Duration(_) => Ok(()),
    }
}
