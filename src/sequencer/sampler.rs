//! Capture bursts at a held operating point.
//!
//! Each iteration polls the DUT, then the absorber. DUT samples go straight to the run log as
//! rows; absorber samples are only checked for faults. A poll that gets no answer is logged as
//! a communication error and skipped. A non-zero fault code is written as a fault line (after
//! the DUT row, for the DUT) and ends the burst at once.

use std::time::Duration;

use crate::hardware::MotorController;
use crate::measurement::{FaultCode, Role};
use crate::sequencer::clock::Clock;
use crate::sequencer::run_log::RunLog;

/// What a capture burst did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BurstReport {
    /// Iterations started
    pub iterations: u32,
    /// DUT sample rows written
    pub rows_logged: u32,
    /// Controller and code that cut the burst short
    pub fault: Option<(Role, FaultCode)>,
}

impl BurstReport {
    /// Whether a fault ended the burst.
    pub fn fault_detected(&self) -> bool {
        self.fault.is_some()
    }
}

/// Polls the two controllers for a capture burst.
pub struct MeasurementSampler<'a> {
    clock: &'a dyn Clock,
}

impl<'a> MeasurementSampler<'a> {
    /// Sample using `clock` for the poll interval.
    pub fn new(clock: &'a dyn Clock) -> Self {
        Self { clock }
    }

    /// Run `iterations` polls of both controllers, `poll_interval` apart.
    pub async fn capture_burst(
        &self,
        dut: &dyn MotorController,
        absorber: &dyn MotorController,
        iterations: u32,
        poll_interval: Duration,
        log: &mut RunLog,
    ) -> BurstReport {
        let mut report = BurstReport::default();

        for i in 0..iterations {
            report.iterations = i + 1;

            for (role, motor) in [(Role::Dut, dut), (Role::Absorber, absorber)] {
                if let Some(code) = poll(motor, role, log, &mut report).await {
                    tracing::error!(%role, fault = %code, "Controller fault, ending capture");
                    report.fault = Some((role, code));
                    return report;
                }
            }

            if i + 1 < iterations {
                self.clock.sleep(poll_interval).await;
            }
        }
        report
    }
}

/// Poll one controller; returns its fault code if it reported one.
async fn poll(
    motor: &dyn MotorController,
    role: Role,
    log: &mut RunLog,
    report: &mut BurstReport,
) -> Option<FaultCode> {
    match motor.get_measurement().await {
        Ok(sample) => {
            if role == Role::Dut {
                log.sample(&sample);
                report.rows_logged += 1;
            }
            if sample.fault.is_fault() {
                log.fault(role, sample.fault);
                return Some(sample.fault);
            }
            None
        }
        Err(e) => {
            tracing::warn!(%role, "Poll failed: {}", e);
            log.comm_error(role, "received no response");
            None
        }
    }
}
