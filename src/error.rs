//! Custom error types for the application.
//!
//! This module defines the primary error type, `DynoError`. Using the `thiserror` crate, it
//! provides a single place for the failures that can stop a dyno run before or after the
//! hardware sequence, from configuration problems to I/O on the run log.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically a missing file, a parse error, or a
//!   field with the wrong type.
//! - **`Configuration`**: Semantic errors that pass parsing but are logically incorrect (an
//!   empty grid, a zero ramp step). These are caught by `DynoConfig::validate` before any
//!   hardware command is issued.
//! - **`InvalidRampStep`**: A ramp was asked to run with a non-positive or non-finite step
//!   bound. This is a precondition violation, not a runtime fault.
//! - **`Io`**: Wraps `std::io::Error`, covering the run log file.
//! - **`Instrument`**: Failures opening or identifying a motor controller at startup.
//! - **`Protocol`**: Malformed frames from the controller wire protocol.
//! - **`RunLog`**: A write to the run log failed during the sequence. The sequence still
//!   unwinds the hardware; this error is reported once it has terminated.
//!
//! Controller faults and dropped polls are *not* errors: they are recorded in the run log and
//! handled by the sequencer.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DynoError>;

#[derive(Error, Debug)]
pub enum DynoError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Ramp step bound must be positive and finite, got {0}")]
    InvalidRampStep(f64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Run log write failed: {0}")]
    RunLog(std::io::Error),
}

impl From<figment::Error> for DynoError {
    fn from(value: figment::Error) -> Self {
        DynoError::Config(Box::new(value))
    }
}

impl DynoError {
    /// Whether the error was raised before any hardware command could be issued.
    pub fn is_startup_failure(&self) -> bool {
        !matches!(self, DynoError::RunLog(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_log_failure_is_not_a_startup_failure() {
        let err = DynoError::RunLog(std::io::Error::other("disk full"));
        assert!(!err.is_startup_failure());
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn configuration_errors_are_startup_failures() {
        let err = DynoError::Configuration("grid is empty".into());
        assert!(err.is_startup_failure());
        assert_eq!(
            err.to_string(),
            "Configuration validation error: grid is empty"
        );
    }

    #[test]
    fn figment_errors_convert() {
        let err: DynoError = figment::Error::from("missing field `grid`".to_string()).into();
        match err {
            DynoError::Config(inner) => assert!(inner.to_string().contains("grid")),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
