//! Test Sequencer
//!
//! The state machine that walks both controllers through the operating-point grid and always
//! brings them back to rest.
//!
//! # Sequence
//!
//! ```text
//! Idle → RampingSpeed → (RampingCurrent → Settling → Capturing)* → UnwindingCurrent
//!                ↑                                                        │
//!                └──────────────────── next speed stage ──────────────────┘
//!      → UnwindingSpeed → Terminated
//! ```
//!
//! For each speed stage the absorber ramps from the last commanded speed to the stage speed.
//! For each current point the DUT ramps from the last commanded current, the rig settles, and
//! a capture burst runs. After the current loop the DUT current is retracted to zero in one
//! step. A fault ends the current loop and the speed loop; the retraction and the final speed
//! ramp to zero still run, in that order.
//!
//! Nothing inside the sequence returns early. Communication failures are logged and skipped,
//! faults switch to the unwind path, and a failing run log only surfaces once the rig is at
//! rest.
//!
//! # Example
//!
//! ```rust,ignore
//! let clock = TokioClock;
//! let sequencer = TestSequencer::new(&plan, &dut, &absorber, &clock);
//! let mut progress = sequencer.subscribe();
//! let summary = sequencer.run(RunLog::new(FileLogSink::create(dir, "dut_log")?)).await?;
//! ```

pub mod clock;
pub mod plan;
pub mod ramp;
pub mod run_log;
pub mod sampler;
pub mod state;

pub use clock::{Clock, RecordingClock, TokioClock};
pub use plan::{CaptureLength, GridMode, OperatingPoint, RampLimits, SpeedStage, StepBound, TestPlan};
pub use ramp::{RampController, RampPlan, Setpoint};
pub use run_log::{FileLogSink, LogSink, MemoryLogSink, RunLog};
pub use sampler::{BurstReport, MeasurementSampler};
pub use state::{RunState, RunSummary, SequencerProgress, SequencerState};

use tokio::sync::watch;

use crate::error::AppResult;
use crate::hardware::MotorController;
use crate::measurement::{FaultCode, Role};

/// Firmware string logged when a controller does not identify itself.
pub const UNKNOWN_FIRMWARE: &str = "unknown";

/// Default script identity for the log header.
pub const DEFAULT_SCRIPT_NAME: &str = "Back-to-back dyno";

/// Drives a [`TestPlan`] across a DUT and an absorber.
pub struct TestSequencer<'a> {
    plan: &'a TestPlan,
    dut: &'a dyn MotorController,
    absorber: &'a dyn MotorController,
    clock: &'a dyn Clock,
    ramps: RampController<'a>,
    sampler: MeasurementSampler<'a>,
    script_name: String,
    run: RunState,
    progress: SequencerProgress,
    progress_tx: watch::Sender<SequencerProgress>,
}

impl<'a> TestSequencer<'a> {
    /// Sequencer for `plan` with both controllers already connected.
    pub fn new(
        plan: &'a TestPlan,
        dut: &'a dyn MotorController,
        absorber: &'a dyn MotorController,
        clock: &'a dyn Clock,
    ) -> Self {
        let progress = SequencerProgress::idle(plan.total_points());
        let (progress_tx, _) = watch::channel(progress.clone());
        Self {
            plan,
            dut,
            absorber,
            clock,
            ramps: RampController::new(clock),
            sampler: MeasurementSampler::new(clock),
            script_name: DEFAULT_SCRIPT_NAME.to_string(),
            run: RunState::default(),
            progress,
            progress_tx,
        }
    }

    /// Identity written on the first log line.
    pub fn with_script_name(mut self, name: impl Into<String>) -> Self {
        self.script_name = name.into();
        self
    }

    /// Receive a progress snapshot at every state change.
    pub fn subscribe(&self) -> watch::Receiver<SequencerProgress> {
        self.progress_tx.subscribe()
    }

    /// Current phase.
    pub fn state(&self) -> SequencerState {
        self.progress.state
    }

    fn enter(&mut self, state: SequencerState) {
        tracing::debug!(from = %self.progress.state, to = %state, "Sequencer state change");
        self.progress.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.progress_tx.send_replace(self.progress.clone());
    }

    async fn firmware(&self, motor: &dyn MotorController, role: Role) -> String {
        match motor.firmware_version().await {
            Ok(version) => version,
            Err(e) => {
                tracing::warn!(%role, "Firmware query failed: {}", e);
                UNKNOWN_FIRMWARE.to_string()
            }
        }
    }

    /// Run the whole sequence, writing to `log`.
    ///
    /// Returns after both set-points are back at zero and the closing line is written.
    ///
    /// # Errors
    /// `DynoError::RunLog` if any log write failed. The hardware sequence has still run to
    /// completion by then.
    pub async fn run(mut self, mut log: RunLog) -> AppResult<RunSummary> {
        let plan = self.plan;
        let limits = plan.ramp;
        tracing::info!(
            stages = plan.stages.len(),
            points = plan.total_points(),
            estimate = ?plan.estimated_duration(),
            "Test sequence starting"
        );

        let dut_fw = self.firmware(self.dut, Role::Dut).await;
        let absorber_fw = self.firmware(self.absorber, Role::Absorber).await;
        log.header(&self.script_name, &dut_fw, &absorber_fw);

        for stage in &plan.stages {
            self.progress.stage_rpm = Some(stage.rpm);
            self.enter(SequencerState::RampingSpeed);
            let speed_ramp =
                RampPlan::new(self.run.last_rpm, stage.rpm, limits.max_speed_step, limits.settling);
            self.ramps
                .ramp(self.absorber, Role::Absorber, Setpoint::Speed, &speed_ramp, &mut log)
                .await;

            for point in &stage.points {
                self.progress.point_current_a = Some(point.current_a);
                self.enter(SequencerState::RampingCurrent);
                let current_ramp = RampPlan::new(
                    self.run.last_current_a,
                    point.current_a,
                    limits.max_current_step,
                    limits.settling,
                );
                self.ramps
                    .ramp(self.dut, Role::Dut, Setpoint::Current, &current_ramp, &mut log)
                    .await;

                self.enter(SequencerState::Settling);
                self.clock.sleep(plan.settling).await;

                self.enter(SequencerState::Capturing);
                let iterations = point.capture.iterations(plan.poll_interval);
                let report = self
                    .sampler
                    .capture_burst(self.dut, self.absorber, iterations, plan.poll_interval, &mut log)
                    .await;
                self.run.last_current_a = point.current_a;
                self.progress.completed_points += 1;

                if let Some((role, code)) = report.fault {
                    self.record_fault(role, code);
                    break;
                }
                self.publish();
            }

            self.progress.point_current_a = None;
            self.enter(SequencerState::UnwindingCurrent);
            let retraction = RampPlan::retraction(self.run.last_current_a, limits.settling);
            self.ramps
                .ramp(self.dut, Role::Dut, Setpoint::Current, &retraction, &mut log)
                .await;
            // The retraction left the DUT at zero; the next stage ramps up from there.
            self.run.last_current_a = 0.0;
            self.run.last_rpm = stage.rpm;

            if self.run.faulted {
                break;
            }
        }

        self.progress.stage_rpm = None;
        self.enter(SequencerState::UnwindingSpeed);
        let speed_down =
            RampPlan::new(self.run.last_rpm, 0.0, limits.max_speed_step, limits.settling);
        self.ramps
            .ramp(self.absorber, Role::Absorber, Setpoint::Speed, &speed_down, &mut log)
            .await;
        self.run.last_rpm = 0.0;

        log.end();
        self.enter(SequencerState::Terminated);

        let summary = RunSummary {
            points_captured: self.progress.completed_points,
            total_points: self.progress.total_points,
            rows_logged: log.rows(),
            fault: self.progress.fault,
            final_state: self.run,
        };
        tracing::info!(
            points = summary.points_captured,
            rows = summary.rows_logged,
            faulted = self.run.faulted,
            "Test sequence terminated"
        );

        log.finish()?;
        Ok(summary)
    }

    fn record_fault(&mut self, role: Role, code: FaultCode) {
        tracing::error!(%role, fault = %code, "Fault detected, unwinding");
        self.run.faulted = true;
        self.progress.fault = Some((role, code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{Journal, MockMotorController, PollScript};
    use crate::measurement::COLUMN_HEADER;
    use std::time::Duration;

    fn plan(speeds: &[f64], currents: &[f64], samples: u32) -> TestPlan {
        TestPlan {
            mode: GridMode::Cross,
            stages: speeds
                .iter()
                .map(|&rpm| SpeedStage {
                    rpm,
                    points: currents
                        .iter()
                        .map(|&current_a| OperatingPoint {
                            rpm,
                            current_a,
                            capture: CaptureLength::Samples(samples),
                        })
                        .collect(),
                })
                .collect(),
            poll_interval: Duration::from_millis(100),
            settling: Duration::from_millis(500),
            ramp: RampLimits {
                settling: Duration::from_millis(20),
                max_speed_step: StepBound::new(1000.0).unwrap(),
                max_current_step: StepBound::new(10.0).unwrap(),
            },
        }
    }

    #[tokio::test]
    async fn progress_ends_terminated_with_all_points() {
        let journal = Journal::new();
        let dut = MockMotorController::new(Role::Dut, journal.clone());
        let absorber = MockMotorController::new(Role::Absorber, journal.clone());
        let clock = RecordingClock::new(journal.clone());
        let plan = plan(&[100.0], &[1.0, 2.0], 1);

        let sequencer = TestSequencer::new(&plan, &dut, &absorber, &clock);
        assert_eq!(sequencer.state(), SequencerState::Idle);
        let progress = sequencer.subscribe();

        let summary = sequencer.run(RunLog::new(MemoryLogSink::new())).await.unwrap();

        let last = progress.borrow().clone();
        assert_eq!(last.state, SequencerState::Terminated);
        assert_eq!(last.completed_points, 2);
        assert!(summary.completed());
        assert_eq!(summary.rows_logged, 2);
        assert_eq!(summary.final_state, RunState::default());
    }

    #[tokio::test]
    async fn header_uses_script_name_and_firmware() {
        let journal = Journal::new();
        let dut = MockMotorController::new(Role::Dut, journal.clone()).with_firmware("6.05 (dut)");
        let absorber = MockMotorController::new(Role::Absorber, journal.clone());
        let clock = RecordingClock::new(journal.clone());
        let plan = plan(&[100.0], &[1.0], 1);
        let sink = MemoryLogSink::new();

        TestSequencer::new(&plan, &dut, &absorber, &clock)
            .with_script_name("Torque-Speed profile script")
            .run(RunLog::new(sink.clone()))
            .await
            .unwrap();

        let lines = sink.lines();
        assert_eq!(lines[0], "Torque-Speed profile script");
        assert_eq!(lines[1], "DUT Firmware: 6.05 (dut)");
        assert_eq!(lines[2], "Absorber Firmware: 6.02 (mock)");
        assert_eq!(lines[3], COLUMN_HEADER);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn firmware_failure_is_warned_and_run_continues() {
        let journal = Journal::new();
        let dut = MockMotorController::new(Role::Dut, journal.clone()).without_firmware();
        let absorber = MockMotorController::new(Role::Absorber, journal.clone());
        let clock = RecordingClock::new(journal.clone());
        let plan = plan(&[100.0], &[1.0], 1);
        let sink = MemoryLogSink::new();

        let summary = TestSequencer::new(&plan, &dut, &absorber, &clock)
            .run(RunLog::new(sink.clone()))
            .await
            .unwrap();

        assert!(summary.completed());
        assert_eq!(sink.lines()[1], "DUT Firmware: unknown");
        assert!(logs_contain("Firmware query failed"));
    }

    #[tokio::test]
    async fn fault_marks_run_state_and_still_zeroes_setpoints() {
        let journal = Journal::new();
        let dut = MockMotorController::new(Role::Dut, journal.clone())
            .with_script([PollScript::Fault(FaultCode(3))]);
        let absorber = MockMotorController::new(Role::Absorber, journal.clone());
        let clock = RecordingClock::new(journal.clone());
        let plan = plan(&[100.0, 200.0], &[1.0, 2.0], 2);

        let summary = TestSequencer::new(&plan, &dut, &absorber, &clock)
            .run(RunLog::new(MemoryLogSink::new()))
            .await
            .unwrap();

        assert_eq!(summary.fault, Some((Role::Dut, FaultCode(3))));
        assert!(summary.final_state.faulted);
        assert_eq!(summary.final_state.last_rpm, 0.0);
        assert_eq!(summary.final_state.last_current_a, 0.0);
        assert_eq!(summary.points_captured, 1);
        assert_eq!(journal.commanded_rpms(Role::Absorber), vec![100, 0]);
        assert_eq!(journal.commanded_currents(Role::Dut), vec![1000, 0]);
    }

    #[tokio::test]
    async fn run_log_failure_surfaces_after_unwind() {
        let journal = Journal::new();
        let dut = MockMotorController::new(Role::Dut, journal.clone());
        let absorber = MockMotorController::new(Role::Absorber, journal.clone());
        let clock = RecordingClock::new(journal.clone());
        let plan = plan(&[300.0], &[4.0], 1);

        let result = TestSequencer::new(&plan, &dut, &absorber, &clock)
            .run(RunLog::new(MemoryLogSink::failing_after(2)))
            .await;

        assert!(matches!(result, Err(crate::error::DynoError::RunLog(_))));
        assert_eq!(journal.commanded_rpms(Role::Absorber), vec![300, 0]);
        assert_eq!(journal.commanded_currents(Role::Dut), vec![4000, 0]);
    }
}
