//! Sequencer state, last-applied set-points and progress snapshots.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::measurement::{FaultCode, Role};

/// Phase of the test sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequencerState {
    /// Not yet started
    Idle,
    /// Absorber speed moving towards the next stage
    RampingSpeed,
    /// DUT current moving towards the next operating point
    RampingCurrent,
    /// Waiting at the operating point before capture
    Settling,
    /// Polling both controllers
    Capturing,
    /// DUT current returning to zero
    UnwindingCurrent,
    /// Absorber speed returning to zero
    UnwindingSpeed,
    /// Sequence finished, both set-points at zero
    Terminated,
}

impl SequencerState {
    /// Whether the sequence is bringing the rig back to rest.
    pub fn is_unwinding(self) -> bool {
        matches!(
            self,
            SequencerState::UnwindingCurrent | SequencerState::UnwindingSpeed
        )
    }
}

impl fmt::Display for SequencerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SequencerState::Idle => "idle",
            SequencerState::RampingSpeed => "ramping speed",
            SequencerState::RampingCurrent => "ramping current",
            SequencerState::Settling => "settling",
            SequencerState::Capturing => "capturing",
            SequencerState::UnwindingCurrent => "unwinding current",
            SequencerState::UnwindingSpeed => "unwinding speed",
            SequencerState::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

/// Set-points the sequencer last commanded, and whether the run has faulted.
///
/// Every ramp starts from these values, never from zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RunState {
    /// Last absorber speed set-point (RPM)
    pub last_rpm: f64,
    /// Last DUT current set-point (A)
    pub last_current_a: f64,
    /// Set once a fault is observed; never cleared
    pub faulted: bool,
}

/// Snapshot published on the progress channel at every state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencerProgress {
    /// Current phase
    pub state: SequencerState,
    /// Operating points whose capture has finished
    pub completed_points: usize,
    /// Operating points in the plan
    pub total_points: usize,
    /// Speed of the stage in progress (RPM)
    pub stage_rpm: Option<f64>,
    /// Current of the point in progress (A)
    pub point_current_a: Option<f64>,
    /// Controller and code that ended the run, if any
    pub fault: Option<(Role, FaultCode)>,
}

impl SequencerProgress {
    /// Idle snapshot for a plan of `total_points`.
    pub fn idle(total_points: usize) -> Self {
        Self {
            state: SequencerState::Idle,
            completed_points: 0,
            total_points,
            stage_rpm: None,
            point_current_a: None,
            fault: None,
        }
    }

    /// Completed fraction, 0.0 to 1.0.
    pub fn fraction(&self) -> f64 {
        if self.total_points == 0 {
            return 1.0;
        }
        self.completed_points as f64 / self.total_points as f64
    }
}

/// Outcome of a finished sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Operating points whose capture ran (including one cut short by a fault)
    pub points_captured: usize,
    /// Operating points in the plan
    pub total_points: usize,
    /// Sample rows written to the run log
    pub rows_logged: usize,
    /// Controller and code that ended the run early
    pub fault: Option<(Role, FaultCode)>,
    /// Set-points at termination; both zero after a clean unwind
    pub final_state: RunState,
}

impl RunSummary {
    /// Whether every operating point was captured without a fault.
    pub fn completed(&self) -> bool {
        self.fault.is_none() && self.points_captured == self.total_points
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwinding_states() {
        assert!(SequencerState::UnwindingCurrent.is_unwinding());
        assert!(SequencerState::UnwindingSpeed.is_unwinding());
        assert!(!SequencerState::Capturing.is_unwinding());
        assert_eq!(SequencerState::RampingSpeed.to_string(), "ramping speed");
    }

    #[test]
    fn progress_fraction() {
        let mut progress = SequencerProgress::idle(4);
        assert_eq!(progress.fraction(), 0.0);
        progress.completed_points = 3;
        assert_eq!(progress.fraction(), 0.75);
        assert_eq!(SequencerProgress::idle(0).fraction(), 1.0);
    }

    #[test]
    fn summary_completion() {
        let summary = RunSummary {
            points_captured: 2,
            total_points: 2,
            rows_logged: 8,
            fault: None,
            final_state: RunState::default(),
        };
        assert!(summary.completed());

        let faulted = RunSummary {
            fault: Some((Role::Dut, FaultCode(1))),
            ..summary
        };
        assert!(!faulted.completed());
    }
}
