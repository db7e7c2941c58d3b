//! Run sessions: acquire the controllers and the log, run the sequence, release everything.
//!
//! Both controllers and the log file are acquired before the sequence issues its first
//! command. Any failure there is a startup failure and nothing is commanded. Once acquired,
//! the controllers live until the end of the session function and are released on every path
//! out of it, fault or not.

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::DynoConfig;
use crate::hardware::mock::{Journal, MockMotorController};
use crate::hardware::MotorController;
use crate::measurement::Role;
use crate::sequencer::{
    Clock, FileLogSink, RunLog, RunSummary, SequencerProgress, TestPlan, TestSequencer, TokioClock,
};

/// Run the plan on the two configured VESC controllers.
#[cfg(feature = "instrument_serial")]
pub async fn run_hardware(config: &DynoConfig, plan: &TestPlan) -> Result<RunSummary> {
    use crate::hardware::VescController;

    let (dut_port, absorber_port) = config.ports();
    let baud = config.controllers.baud_rate;
    let timeout = config.controllers.reply_timeout;

    let dut = open_controller(Role::Dut, dut_port, baud, timeout).await?;
    let absorber = open_controller(Role::Absorber, absorber_port, baud, timeout).await?;
    tracing::info!(
        dut = dut.port_name(),
        absorber = absorber.port_name(),
        "Controllers ready"
    );

    run_with(config, plan, &dut, &absorber, &TokioClock).await
}

/// Open the controller for `role`. Failure here is a startup failure.
#[cfg(feature = "instrument_serial")]
async fn open_controller(
    role: Role,
    port: &str,
    baud_rate: u32,
    timeout: std::time::Duration,
) -> crate::AppResult<crate::hardware::VescController> {
    crate::hardware::VescController::open_with(port, baud_rate, timeout)
        .await
        .map_err(|e| {
            crate::DynoError::Instrument(format!("cannot open {role} controller on {port}: {e:#}"))
        })
}

/// Open one controller and read its firmware and a single measurement.
#[cfg(feature = "instrument_serial")]
pub async fn probe(
    port: &str,
    baud_rate: u32,
    timeout: std::time::Duration,
) -> Result<(String, crate::measurement::MeasurementSample)> {
    use crate::hardware::capabilities::{Identified, Measurable};
    use crate::hardware::VescController;

    let motor = VescController::open_with(port, baud_rate, timeout)
        .await
        .with_context(|| format!("Cannot open controller on {port}"))?;
    let firmware = motor
        .firmware_version()
        .await
        .with_context(|| format!("No firmware reply from {port}"))?;
    let sample = motor
        .get_measurement()
        .await
        .with_context(|| format!("No measurement reply from {port}"))?;
    Ok((firmware, sample))
}

/// Run the plan against simulated controllers in real time, writing a real log file.
pub async fn run_simulated(config: &DynoConfig, plan: &TestPlan) -> Result<RunSummary> {
    let journal = Journal::new();
    let dut = MockMotorController::new(Role::Dut, journal.clone()).with_firmware("simulated DUT");
    let absorber =
        MockMotorController::new(Role::Absorber, journal).with_firmware("simulated absorber");

    run_with(config, plan, &dut, &absorber, &TokioClock).await
}

/// Open the log file and run the sequence on already-acquired controllers.
pub async fn run_with(
    config: &DynoConfig,
    plan: &TestPlan,
    dut: &dyn MotorController,
    absorber: &dyn MotorController,
    clock: &dyn Clock,
) -> Result<RunSummary> {
    let sink = FileLogSink::create(&config.log.directory, &config.log.prefix).with_context(|| {
        format!(
            "Cannot create run log in {}",
            config.log.directory.display()
        )
    })?;
    let log_path = sink.path().to_path_buf();

    let sequencer =
        TestSequencer::new(plan, dut, absorber, clock).with_script_name(&config.log.script_name);
    let reporter = spawn_progress_reporter(sequencer.subscribe());

    let result = sequencer.run(RunLog::new(sink)).await;
    reporter.abort();

    let summary = result.with_context(|| format!("Run log {} is incomplete", log_path.display()))?;
    tracing::info!(path = %log_path.display(), "Run log closed");
    Ok(summary)
}

/// Log each completed operating point as the sequence reports it, and the start of an unwind.
///
/// The task runs in the caller's span so its events are attributed to the run.
pub fn spawn_progress_reporter(mut rx: watch::Receiver<SequencerProgress>) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut last_completed = 0;
            let mut unwinding = false;
            while rx.changed().await.is_ok() {
                let progress = rx.borrow_and_update().clone();
                if progress.completed_points != last_completed {
                    last_completed = progress.completed_points;
                    tracing::info!(
                        completed = progress.completed_points,
                        total = progress.total_points,
                        percent = format!("{:.0}", progress.fraction() * 100.0),
                        "Operating point captured"
                    );
                }
                if progress.state.is_unwinding() && !unwinding {
                    unwinding = true;
                    match progress.fault {
                        Some((role, code)) => {
                            tracing::warn!(%role, fault = %code, state = %progress.state, "Run faulted, unwinding")
                        }
                        None => tracing::info!(state = %progress.state, "Unwinding to rest"),
                    }
                }
            }
        }
        .in_current_span(),
    )
}
