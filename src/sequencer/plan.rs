//! Validated test plan: the normalised operating-point grid plus timing and ramp limits.
//!
//! A `TestPlan` is only built by `DynoConfig::validate`, so everything in it has already been
//! checked. Both grid modes land in the same shape: a list of speed stages, each holding the
//! current points to visit at that speed.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AppResult, DynoError};
use crate::sequencer::ramp::RampPlan;

/// How the grid was specified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridMode {
    /// Speeds crossed with currents
    Cross,
    /// Explicit (speed, current, duration) triples
    Paired,
}

/// A positive, finite per-step bound for a ramp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct StepBound(f64);

impl StepBound {
    /// Reject zero, negative and non-finite bounds.
    pub fn new(value: f64) -> AppResult<Self> {
        if value.is_finite() && value > 0.0 {
            Ok(Self(value))
        } else {
            Err(DynoError::InvalidRampStep(value))
        }
    }

    /// The bound as a plain number.
    pub fn get(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for StepBound {
    type Error = DynoError;

    fn try_from(value: f64) -> AppResult<Self> {
        Self::new(value)
    }
}

impl From<StepBound> for f64 {
    fn from(bound: StepBound) -> f64 {
        bound.0
    }
}

/// Bounds shared by every speed and current ramp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RampLimits {
    /// Wait after each ramp step
    pub settling: Duration,
    /// Largest speed change per step (RPM)
    pub max_speed_step: StepBound,
    /// Largest current change per step (A)
    pub max_current_step: StepBound,
}

/// How long a capture burst runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureLength {
    /// Fixed number of poll iterations
    Samples(u32),
    /// Iterations that fit in this duration at the poll interval
    Duration(Duration),
}

impl CaptureLength {
    /// Poll iterations for this burst. Duration bursts round down.
    pub fn iterations(self, poll_interval: Duration) -> u32 {
        match self {
            CaptureLength::Samples(n) => n,
            CaptureLength::Duration(_) if poll_interval.is_zero() => 0,
            CaptureLength::Duration(duration) => {
                let n = duration.as_nanos() / poll_interval.as_nanos();
                u32::try_from(n).unwrap_or(u32::MAX)
            }
        }
    }
}

/// One (speed, current) target with its capture length.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperatingPoint {
    /// Absorber speed (RPM)
    pub rpm: f64,
    /// DUT current (A)
    pub current_a: f64,
    /// Capture burst length
    pub capture: CaptureLength,
}

/// Current points visited while the absorber holds one speed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedStage {
    /// Absorber speed (RPM)
    pub rpm: f64,
    /// Points in visiting order
    pub points: Vec<OperatingPoint>,
}

/// Everything the sequencer needs to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPlan {
    /// How the grid was given
    pub mode: GridMode,
    /// Speed stages in visiting order
    pub stages: Vec<SpeedStage>,
    /// Delay between capture polls
    pub poll_interval: Duration,
    /// Delay between reaching a current and capturing
    pub settling: Duration,
    /// Ramp bounds
    pub ramp: RampLimits,
}

impl TestPlan {
    /// Number of operating points across all stages.
    pub fn total_points(&self) -> usize {
        self.stages.iter().map(|stage| stage.points.len()).sum()
    }

    /// Wall-clock estimate for a fault-free run, counting only deliberate waits.
    ///
    /// Follows the same ramps the sequencer will issue, including both unwinds.
    pub fn estimated_duration(&self) -> Duration {
        let settle = self.ramp.settling;
        let mut total = Duration::ZERO;
        let mut last_rpm = 0.0;

        for stage in &self.stages {
            total += RampPlan::new(last_rpm, stage.rpm, self.ramp.max_speed_step, settle).duration();
            let mut last_current = 0.0;
            for point in &stage.points {
                total +=
                    RampPlan::new(last_current, point.current_a, self.ramp.max_current_step, settle)
                        .duration();
                total += self.settling;
                let polls = point.capture.iterations(self.poll_interval);
                total += self.poll_interval * polls.saturating_sub(1);
                last_current = point.current_a;
            }
            total += RampPlan::retraction(last_current, settle).duration();
            last_rpm = stage.rpm;
        }
        total + RampPlan::new(last_rpm, 0.0, self.ramp.max_speed_step, settle).duration()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(v: f64) -> StepBound {
        StepBound::new(v).unwrap()
    }

    #[test]
    fn step_bound_rejects_non_positive() {
        assert!(matches!(StepBound::new(0.0), Err(DynoError::InvalidRampStep(_))));
        assert!(StepBound::new(-1.0).is_err());
        assert!(StepBound::new(f64::NAN).is_err());
        assert!(StepBound::new(f64::INFINITY).is_err());
        assert_eq!(bound(2.5).get(), 2.5);
    }

    #[test]
    fn capture_iterations_round_down() {
        let poll = Duration::from_millis(300);
        assert_eq!(CaptureLength::Samples(7).iterations(poll), 7);
        assert_eq!(CaptureLength::Duration(Duration::from_secs(1)).iterations(poll), 3);
        assert_eq!(
            CaptureLength::Duration(Duration::from_secs(1)).iterations(Duration::ZERO),
            0
        );
    }

    #[test]
    fn estimated_duration_counts_ramps_settling_and_polls() {
        let capture = CaptureLength::Samples(3);
        let plan = TestPlan {
            mode: GridMode::Cross,
            stages: vec![SpeedStage {
                rpm: 100.0,
                points: vec![OperatingPoint {
                    rpm: 100.0,
                    current_a: 2.0,
                    capture,
                }],
            }],
            poll_interval: Duration::from_millis(100),
            settling: Duration::from_secs(1),
            ramp: RampLimits {
                settling: Duration::from_millis(10),
                max_speed_step: bound(50.0),
                max_current_step: bound(1.0),
            },
        };

        // speed up 2 steps, current up 2 steps, retraction 1, speed down 2: 7 ramp steps
        let expected = Duration::from_millis(70) + Duration::from_secs(1) + Duration::from_millis(200);
        assert_eq!(plan.estimated_duration(), expected);
        assert_eq!(plan.total_points(), 1);
    }
}
