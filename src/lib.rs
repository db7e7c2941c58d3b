//! # Back-to-Back Dyno Library
//!
//! Automates a back-to-back dynamometer test. One motor controller, the device under test
//! (DUT), is driven through a grid of current set-points while a second controller, the
//! absorber, holds a commanded speed. Every transition is a bounded-step ramp, every operating
//! point gets a settling wait and a capture burst, and any controller fault sends the rig
//! through the unwind sequence: DUT current to zero first, then absorber speed to zero.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based loading and validation; produces a `TestPlan`.
//! - **`error`**: The `DynoError` enum for startup and run-log failures.
//! - **`hardware`**: Motor controller capability traits, the VESC serial driver and codec, and a
//!   scriptable mock.
//! - **`measurement`**: Measurement samples, fault codes and controller roles.
//! - **`sequencer`**: Ramps, capture bursts, the run log and the `TestSequencer` state machine.
//! - **`session`**: Acquires controllers and the log file, runs the sequence, releases both.
//! - **`tracing_setup`**: Diagnostic tracing initialisation.

pub mod config;
pub mod error;
pub mod hardware;
pub mod measurement;
pub mod sequencer;
pub mod session;
pub mod tracing_setup;

pub use error::{AppResult, DynoError};
