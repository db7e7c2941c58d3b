//! Motor controller hardware layer.
//!
//! Capability traits, the VESC protocol codec and serial driver, and a scriptable mock.

pub mod capabilities;
pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod vesc;
pub mod vesc_protocol;

pub use capabilities::MotorController;
#[cfg(feature = "instrument_serial")]
pub use vesc::VescController;
