//! Atomic Motor Controller Capabilities
//!
//! This module defines fine-grained capability traits that a motor controller implements.
//! The sequencer only ever needs four operations, so each one is its own trait:
//!
//! - `SpeedControl` - hold a commanded electrical RPM
//! - `CurrentControl` - hold a commanded motor current
//! - `Measurable` - read a measurement snapshot
//! - `Identified` - report firmware identity
//!
//! A physical VESC implements all four and therefore gets `MotorController` through the
//! blanket impl at the bottom of this file.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! An `Err` from any of these methods means "the controller did not answer". The sequencer
//! records it in the run log and carries on; it is never allowed to unwind the test early.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn hold_point<M: MotorController + ?Sized>(motor: &M) -> Result<MeasurementSample> {
//!     motor.set_rpm(3000).await?;
//!     motor.get_measurement().await
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;

use crate::measurement::MeasurementSample;

/// Capability: Speed Control
///
/// # Contract
/// - `rpm` is electrical RPM, already truncated to an integer by the caller
/// - The controller keeps regulating to the last value it received
#[async_trait]
pub trait SpeedControl: Send + Sync {
    /// Command a target speed in electrical RPM.
    async fn set_rpm(&self, rpm: i32) -> Result<()>;
}

/// Capability: Current Control
///
/// # Contract
/// - `milliamps` is in controller wire units; the amps-to-milliamps conversion happens in the
///   ramp, at the point the command is issued
/// - Zero releases the motor
#[async_trait]
pub trait CurrentControl: Send + Sync {
    /// Command a target motor current in milliamps.
    async fn set_current(&self, milliamps: i32) -> Result<()>;
}

/// Capability: Measurement Readout
#[async_trait]
pub trait Measurable: Send + Sync {
    /// Poll the controller for a measurement snapshot.
    ///
    /// # Returns
    /// - Ok(sample) with whatever fault code the controller reported
    /// - Err if the controller did not respond
    async fn get_measurement(&self) -> Result<MeasurementSample>;
}

/// Capability: Firmware Identity
#[async_trait]
pub trait Identified: Send + Sync {
    /// Human-readable firmware version string.
    async fn firmware_version(&self) -> Result<String>;
}

// =============================================================================
// Combined Traits (for trait objects)
// =============================================================================

/// Combined trait for a full motor controller.
///
/// This trait exists solely to enable trait objects. Implement the individual
/// traits and get this automatically via blanket impl.
///
/// ```rust,ignore
/// fn use_controller(motor: Box<dyn MotorController>) { /* ... */ }
/// ```
pub trait MotorController: SpeedControl + CurrentControl + Measurable + Identified {}

/// Blanket implementation - any type implementing all four capabilities is a MotorController
impl<T> MotorController for T where T: SpeedControl + CurrentControl + Measurable + Identified {}
