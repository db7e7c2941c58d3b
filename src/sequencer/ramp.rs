//! Bounded-step ramps for speed and current set-points.
//!
//! A ramp from `start` to `end` with bound `max_step` takes `ceil(|end - start| / max_step)`
//! equal steps. Intermediate targets are `start + delta * i`; the last target is `end` itself,
//! so rounding never leaves the set-point short of or past the target. Each step is followed by
//! the settling wait.

use std::fmt;
use std::time::Duration;

use crate::error::AppResult;
use crate::hardware::MotorController;
use crate::measurement::Role;
use crate::sequencer::clock::Clock;
use crate::sequencer::plan::StepBound;
use crate::sequencer::run_log::RunLog;

/// Which set-point a ramp drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setpoint {
    /// Speed in RPM
    Speed,
    /// Current in amps
    Current,
}

impl fmt::Display for Setpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Setpoint::Speed => f.write_str("speed"),
            Setpoint::Current => f.write_str("current"),
        }
    }
}

/// Speed command value: RPM truncated toward zero.
pub fn rpm_command(rpm: f64) -> i32 {
    rpm.trunc() as i32
}

/// Current command value: amps rounded to the nearest milliamp.
pub fn milliamp_command(amps: f64) -> i32 {
    (amps * 1000.0).round() as i32
}

/// Steps of one ramp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampPlan {
    start: f64,
    end: f64,
    steps: u32,
    settling: Duration,
}

impl RampPlan {
    /// Plan a bounded ramp.
    pub fn new(start: f64, end: f64, max_step: StepBound, settling: Duration) -> Self {
        let span = (end - start).abs();
        let steps = (span / max_step.get()).ceil();
        Self {
            start,
            end,
            steps: if steps >= f64::from(u32::MAX) { u32::MAX } else { steps as u32 },
            settling,
        }
    }

    /// Plan a ramp from an unchecked step bound.
    ///
    /// # Errors
    /// `DynoError::InvalidRampStep` if `max_step` is zero, negative or not finite.
    pub fn checked(start: f64, end: f64, max_step: f64, settling: Duration) -> AppResult<Self> {
        Ok(Self::new(start, end, StepBound::new(max_step)?, settling))
    }

    /// Single full-range step from `start` to zero, or nothing if already at zero.
    pub fn retraction(start: f64, settling: Duration) -> Self {
        Self {
            start,
            end: 0.0,
            steps: u32::from(start != 0.0),
            settling,
        }
    }

    /// Starting set-point.
    pub fn start(&self) -> f64 {
        self.start
    }

    /// Final set-point.
    pub fn end(&self) -> f64 {
        self.end
    }

    /// Number of commands the ramp issues.
    pub fn steps(&self) -> u32 {
        self.steps
    }

    /// Total settling time across all steps.
    pub fn duration(&self) -> Duration {
        self.settling.checked_mul(self.steps).unwrap_or(Duration::MAX)
    }

    /// Cumulative target of every step, ending exactly on `end`.
    pub fn targets(&self) -> impl Iterator<Item = f64> + '_ {
        let delta = if self.steps == 0 {
            0.0
        } else {
            (self.end - self.start) / f64::from(self.steps)
        };
        (1..=self.steps).map(move |i| {
            if i == self.steps {
                self.end
            } else {
                self.start + delta * f64::from(i)
            }
        })
    }
}

/// Drives one controller through a [`RampPlan`].
pub struct RampController<'a> {
    clock: &'a dyn Clock,
}

impl<'a> RampController<'a> {
    /// Ramp using `clock` for the settling waits.
    pub fn new(clock: &'a dyn Clock) -> Self {
        Self { clock }
    }

    /// Issue every step of `plan` to `motor`, waiting `settling` after each.
    ///
    /// A rejected command is written to the run log and the ramp carries on with the next step.
    /// Returns the number of commands issued.
    pub async fn ramp(
        &self,
        motor: &dyn MotorController,
        role: Role,
        setpoint: Setpoint,
        plan: &RampPlan,
        log: &mut RunLog,
    ) -> u32 {
        if plan.steps() == 0 {
            return 0;
        }
        tracing::debug!(
            %role,
            %setpoint,
            from = plan.start(),
            to = plan.end(),
            steps = plan.steps(),
            "Ramp started"
        );

        let mut issued = 0;
        for target in plan.targets() {
            let result = match setpoint {
                Setpoint::Speed => motor.set_rpm(rpm_command(target)).await,
                Setpoint::Current => motor.set_current(milliamp_command(target)).await,
            };
            issued += 1;
            if let Err(e) = result {
                tracing::warn!(%role, %setpoint, target, "Set command failed: {}", e);
                log.comm_error(role, &format!("set {} to {} failed: {}", setpoint, target, e));
            }
            self.clock.sleep(plan.settling).await;
        }
        issued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DynoError;
    use crate::hardware::mock::{Journal, MockMotorController};
    use crate::sequencer::clock::RecordingClock;
    use crate::sequencer::run_log::MemoryLogSink;

    fn plan(start: f64, end: f64, max_step: f64) -> RampPlan {
        RampPlan::checked(start, end, max_step, Duration::from_millis(10)).unwrap()
    }

    #[test]
    fn step_count_is_ceiling_of_span_over_bound() {
        assert_eq!(plan(0.0, 100.0, 50.0).steps(), 2);
        assert_eq!(plan(0.0, 100.0, 30.0).steps(), 4);
        assert_eq!(plan(200.0, 0.0, 50.0).steps(), 4);
        assert_eq!(plan(5.0, 5.0, 1.0).steps(), 0);
    }

    #[test]
    fn targets_land_exactly_on_end() {
        for (start, end, step) in [(0.0, 1.0, 0.3), (3.7, -2.2, 0.45), (0.0, 2000.0, 333.0)] {
            let ramp = plan(start, end, step);
            let targets: Vec<f64> = ramp.targets().collect();
            assert_eq!(targets.len() as u32, ramp.steps());
            assert_eq!(*targets.last().unwrap(), end);

            let mut previous = start;
            for t in targets {
                assert!((t - previous).abs() <= step + 1e-9);
                previous = t;
            }
        }
    }

    #[test]
    fn non_positive_bound_is_rejected() {
        let err = RampPlan::checked(0.0, 10.0, 0.0, Duration::ZERO).unwrap_err();
        assert!(matches!(err, DynoError::InvalidRampStep(v) if v == 0.0));
        assert!(RampPlan::checked(0.0, 10.0, -1.0, Duration::ZERO).is_err());
    }

    #[test]
    fn retraction_is_one_step_or_none() {
        let ramp = RampPlan::retraction(7.5, Duration::from_millis(10));
        assert_eq!(ramp.targets().collect::<Vec<_>>(), vec![0.0]);
        assert_eq!(RampPlan::retraction(0.0, Duration::from_millis(10)).steps(), 0);
        assert_eq!(RampPlan::retraction(-3.0, Duration::ZERO).steps(), 1);
    }

    #[test]
    fn command_conversions() {
        assert_eq!(milliamp_command(1.2346), 1235);
        assert_eq!(milliamp_command(-0.5), -500);
        assert_eq!(rpm_command(1499.9), 1499);
        assert_eq!(rpm_command(-10.7), -10);
    }

    #[tokio::test]
    async fn ramp_issues_each_step_then_settles() {
        let journal = Journal::new();
        let motor = MockMotorController::new(Role::Absorber, journal.clone());
        let clock = RecordingClock::new(journal.clone());
        let mut log = RunLog::new(MemoryLogSink::new());

        let issued = RampController::new(&clock)
            .ramp(&motor, Role::Absorber, Setpoint::Speed, &plan(0.0, 100.0, 40.0), &mut log)
            .await;

        assert_eq!(issued, 3);
        assert_eq!(journal.commanded_rpms(Role::Absorber), vec![33, 66, 100]);
        assert_eq!(journal.total_sleep(), Duration::from_millis(30));
    }

    #[tokio::test]
    async fn equal_start_and_end_issue_nothing() {
        let journal = Journal::new();
        let motor = MockMotorController::new(Role::Dut, journal.clone());
        let clock = RecordingClock::new(journal.clone());
        let mut log = RunLog::new(MemoryLogSink::new());

        let issued = RampController::new(&clock)
            .ramp(&motor, Role::Dut, Setpoint::Current, &plan(2.0, 2.0, 1.0), &mut log)
            .await;

        assert_eq!(issued, 0);
        assert!(journal.entries().is_empty());
    }

    #[tokio::test]
    async fn rejected_commands_are_logged_and_ramp_continues() {
        let journal = Journal::new();
        let motor = MockMotorController::new(Role::Dut, journal.clone()).with_rejected_commands();
        let clock = RecordingClock::new(journal.clone());
        let sink = MemoryLogSink::new();
        let mut log = RunLog::new(sink.clone());

        let issued = RampController::new(&clock)
            .ramp(&motor, Role::Dut, Setpoint::Current, &plan(0.0, 2.0, 1.0), &mut log)
            .await;

        assert_eq!(issued, 2);
        assert_eq!(journal.commanded_currents(Role::Dut), vec![1000, 2000]);
        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Communication error with DUT - set current to 1 failed"));
    }
}
