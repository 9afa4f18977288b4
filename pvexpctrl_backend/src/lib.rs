//! Hardware side of the photoconductance rig: plays synthesized light pulses on an NI card and
//! captures the Reference, PC and PL inputs.
//!
//! - [`daq`]: the [`HardwareChannel`] contract and status-code checking.
//! - [`nidaqmx`]: the NI-DAQmx binding (`nidaqmx` feature).
//! - [`sim`]: a loop-back card for running without hardware.
//! - [`session`]: one playback+capture cycle.
//! - [`aggregator`]: the measurement queue, averaging and reduction to [`MeasurementRecord`]s.
//! - [`worker`]: runs the aggregator on a background thread.
//! - [`python`]: Python bindings (`python` feature).
//!
//! Pulse shapes and settings come from [`pvcompiler_backend`].

pub mod aggregator;
pub mod daq;
pub mod error;
#[cfg(feature = "nidaqmx")]
pub mod nidaqmx;
#[cfg(feature = "python")]
pub mod python;
pub mod record;
pub mod session;
pub mod sim;
pub mod worker;

pub use crate::aggregator::*;
pub use crate::daq::*;
pub use crate::error::{Error, Result};
#[cfg(feature = "nidaqmx")]
pub use crate::nidaqmx::*;
pub use crate::record::*;
pub use crate::session::*;
pub use crate::sim::*;
pub use crate::worker::*;
