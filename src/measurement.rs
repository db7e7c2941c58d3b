//! Measurement snapshot types shared by the drivers, the sampler and the run log.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Column header written to the run log ahead of the sample rows.
pub const COLUMN_HEADER: &str =
    "time_ms, rpm, duty_cycle, v_in, avg_motor_current, avg_input_current, temp_fet, temp_motor";

/// Which side of the back-to-back rig a controller sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Device under test, driven through the current grid.
    Dut,
    /// Load motor holding the commanded speed.
    Absorber,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Dut => f.write_str("DUT"),
            Role::Absorber => f.write_str("Absorber"),
        }
    }
}

/// Controller-reported fault code. Zero means healthy; anything else ends the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FaultCode(pub u8);

impl FaultCode {
    /// The healthy sentinel.
    pub const NONE: FaultCode = FaultCode(0);

    /// Whether this code signals a protection trip.
    pub fn is_fault(self) -> bool {
        self.0 != 0
    }

    /// Symbolic VESC name for known codes.
    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            0 => "NONE",
            1 => "OVER_VOLTAGE",
            2 => "UNDER_VOLTAGE",
            3 => "DRV",
            4 => "ABS_OVER_CURRENT",
            5 => "OVER_TEMP_FET",
            6 => "OVER_TEMP_MOTOR",
            7 => "GATE_DRIVER_OVER_VOLTAGE",
            8 => "GATE_DRIVER_UNDER_VOLTAGE",
            9 => "MCU_UNDER_VOLTAGE",
            10 => "BOOTING_FROM_WATCHDOG_RESET",
            11 => "ENCODER_SPI",
            12 => "ENCODER_SINCOS_BELOW_MIN_AMPLITUDE",
            13 => "ENCODER_SINCOS_ABOVE_MAX_AMPLITUDE",
            14 => "FLASH_CORRUPTION",
            15 => "HIGH_OFFSET_CURRENT_SENSOR_1",
            16 => "HIGH_OFFSET_CURRENT_SENSOR_2",
            17 => "HIGH_OFFSET_CURRENT_SENSOR_3",
            18 => "UNBALANCED_CURRENTS",
            19 => "BRK",
            20 => "RESOLVER_LOT",
            21 => "RESOLVER_DOS",
            22 => "RESOLVER_LOS",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", self.0, name),
            None => write!(f, "{}", self.0),
        }
    }
}

/// One snapshot read from a motor controller.
///
/// Samples are written straight through to the run log and dropped; nothing retains them.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MeasurementSample {
    /// Milliseconds since the controller connection was opened.
    pub time_ms: u64,
    /// Electrical RPM.
    pub rpm: f64,
    /// Duty cycle, -1.0 to 1.0.
    pub duty_cycle: f64,
    /// Bus voltage in volts.
    pub v_in: f64,
    /// Average motor current in amps.
    pub avg_motor_current: f64,
    /// Average input current in amps.
    pub avg_input_current: f64,
    /// FET temperature in degrees Celsius.
    pub temp_fet: f64,
    /// Motor temperature in degrees Celsius.
    pub temp_motor: f64,
    /// Fault code reported alongside the sample.
    pub fault: FaultCode,
}

impl MeasurementSample {
    /// Format as one run-log row, in `COLUMN_HEADER` order.
    pub fn to_row(&self) -> String {
        format!(
            "{}, {}, {}, {}, {}, {}, {}, {}",
            self.time_ms,
            self.rpm,
            self.duty_cycle,
            self.v_in,
            self.avg_motor_current,
            self.avg_input_current,
            self.temp_fet,
            self.temp_motor
        )
    }
}
