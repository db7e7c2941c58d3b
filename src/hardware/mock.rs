//! Mock Motor Controller
//!
//! Provides a simulated VESC for testing and for `run --simulate` without physical hardware.
//!
//! # Behaviour
//!
//! - Set-commands are accepted instantly and remembered as the current operating point
//! - Polls follow a script (`PollScript`); once the script runs out every poll is healthy
//! - Every command and poll is appended to a shared `Journal`, so a test can check the exact
//!   interleaving of DUT commands, absorber commands and clock waits
//!
//! # Example
//!
//! ```rust,ignore
//! let journal = Journal::new();
//! let dut = MockMotorController::new(Role::Dut, journal.clone())
//!     .with_script([PollScript::Healthy, PollScript::Fault(FaultCode(4))]);
//! dut.set_current(2000).await?;
//! assert_eq!(journal.commanded_currents(Role::Dut), vec![2000]);
//! ```

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::hardware::capabilities::{CurrentControl, Identified, Measurable, SpeedControl};
use crate::measurement::{FaultCode, MeasurementSample, Role};

// =============================================================================
// Journal - shared record of everything the rig was asked to do
// =============================================================================

/// One recorded interaction with the simulated rig.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalEntry {
    /// Speed command sent to a controller.
    SetRpm {
        /// Target controller.
        role: Role,
        /// Commanded electrical RPM.
        rpm: i32,
    },
    /// Current command sent to a controller.
    SetCurrent {
        /// Target controller.
        role: Role,
        /// Commanded current in milliamps.
        milliamps: i32,
    },
    /// Measurement poll.
    Poll {
        /// Polled controller.
        role: Role,
    },
    /// Blocking wait requested from the clock.
    Sleep(Duration),
}

/// Append-only, cloneable journal shared by mocks and the recording clock.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl Journal {
    /// Create an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<JournalEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an entry.
    pub fn record(&self, entry: JournalEntry) {
        self.lock().push(entry);
    }

    /// Snapshot of all entries in order.
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.lock().clone()
    }

    /// Speed commands sent to `role`, in order.
    pub fn commanded_rpms(&self, role: Role) -> Vec<i32> {
        self.lock()
            .iter()
            .filter_map(|entry| match entry {
                JournalEntry::SetRpm { role: r, rpm } if *r == role => Some(*rpm),
                _ => None,
            })
            .collect()
    }

    /// Current commands sent to `role`, in order.
    pub fn commanded_currents(&self, role: Role) -> Vec<i32> {
        self.lock()
            .iter()
            .filter_map(|entry| match entry {
                JournalEntry::SetCurrent { role: r, milliamps } if *r == role => Some(*milliamps),
                _ => None,
            })
            .collect()
    }

    /// Number of polls issued to `role`.
    pub fn poll_count(&self, role: Role) -> usize {
        self.lock()
            .iter()
            .filter(|entry| matches!(entry, JournalEntry::Poll { role: r } if *r == role))
            .count()
    }

    /// Sum of all recorded clock waits.
    pub fn total_sleep(&self) -> Duration {
        self.lock()
            .iter()
            .filter_map(|entry| match entry {
                JournalEntry::Sleep(d) => Some(*d),
                _ => None,
            })
            .sum()
    }
}

// =============================================================================
// MockMotorController
// =============================================================================

/// Scripted outcome of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollScript {
    /// Answer with a sample reflecting the commanded operating point.
    Healthy,
    /// Do not answer.
    NoResponse,
    /// Answer with the given fault code.
    Fault(FaultCode),
}

#[derive(Debug, Default)]
struct OperatingState {
    rpm: i32,
    milliamps: i32,
}

/// Simulated VESC with a scripted poll sequence.
pub struct MockMotorController {
    role: Role,
    firmware: Option<String>,
    journal: Journal,
    script: Mutex<VecDeque<PollScript>>,
    state: Mutex<OperatingState>,
    reject_commands: bool,
    opened_at: Instant,
}

impl MockMotorController {
    /// Create a healthy mock that records into `journal`.
    pub fn new(role: Role, journal: Journal) -> Self {
        Self {
            role,
            firmware: Some("6.02 (mock)".to_string()),
            journal,
            script: Mutex::new(VecDeque::new()),
            state: Mutex::new(OperatingState::default()),
            reject_commands: false,
            opened_at: Instant::now(),
        }
    }

    /// Queue poll outcomes; polls past the end of the script are healthy.
    pub fn with_script(self, script: impl IntoIterator<Item = PollScript>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(script);
        self
    }

    /// Make every set-command fail as if the controller stopped answering.
    ///
    /// Commands are still journalled so the caller's intent stays visible.
    pub fn with_rejected_commands(mut self) -> Self {
        self.reject_commands = true;
        self
    }

    /// Override the reported firmware string.
    pub fn with_firmware(mut self, firmware: impl Into<String>) -> Self {
        self.firmware = Some(firmware.into());
        self
    }

    /// Make the firmware query go unanswered.
    pub fn without_firmware(mut self) -> Self {
        self.firmware = None;
        self
    }

    fn state(&self) -> MutexGuard<'_, OperatingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sample(&self, fault: FaultCode) -> MeasurementSample {
        let state = self.state();
        let amps = f64::from(state.milliamps) / 1000.0;
        MeasurementSample {
            time_ms: u64::try_from(self.opened_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            rpm: f64::from(state.rpm),
            duty_cycle: (f64::from(state.rpm) / 50_000.0).clamp(-1.0, 1.0),
            v_in: 48.0,
            avg_motor_current: amps,
            avg_input_current: amps * 0.9,
            temp_fet: 30.0,
            temp_motor: 28.0,
            fault,
        }
    }

    fn check_accepting(&self) -> Result<()> {
        if self.reject_commands {
            return Err(anyhow!("Mock {}: command not acknowledged", self.role));
        }
        Ok(())
    }
}

#[async_trait]
impl SpeedControl for MockMotorController {
    async fn set_rpm(&self, rpm: i32) -> Result<()> {
        self.journal.record(JournalEntry::SetRpm {
            role: self.role,
            rpm,
        });
        self.check_accepting()?;
        self.state().rpm = rpm;
        tracing::trace!(role = %self.role, rpm, "mock speed command");
        Ok(())
    }
}

#[async_trait]
impl CurrentControl for MockMotorController {
    async fn set_current(&self, milliamps: i32) -> Result<()> {
        self.journal.record(JournalEntry::SetCurrent {
            role: self.role,
            milliamps,
        });
        self.check_accepting()?;
        self.state().milliamps = milliamps;
        tracing::trace!(role = %self.role, milliamps, "mock current command");
        Ok(())
    }
}

#[async_trait]
impl Measurable for MockMotorController {
    async fn get_measurement(&self) -> Result<MeasurementSample> {
        self.journal.record(JournalEntry::Poll { role: self.role });
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(PollScript::Healthy);

        match next {
            PollScript::Healthy => Ok(self.sample(FaultCode::NONE)),
            PollScript::Fault(code) => Ok(self.sample(code)),
            PollScript::NoResponse => Err(anyhow!("Mock {}: no response", self.role)),
        }
    }
}

#[async_trait]
impl Identified for MockMotorController {
    async fn firmware_version(&self) -> Result<String> {
        self.firmware
            .clone()
            .ok_or_else(|| anyhow!("Mock {}: no firmware reply", self.role))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
