//! The hardware contract the acquisition pipeline is written against.
//!
//! ## Overview
//!
//! [`HardwareChannel`] mirrors the handful of NI-DAQmx C functions one playback+capture cycle needs:
//! creating an analog output and an analog input task, configuring their sample clocks, writing the
//! output buffer, starting, reading, stopping and clearing. Every method returns the raw driver
//! status code (`0` on success, negative for errors, positive for warnings) and hands results back
//! through out-parameters, exactly like the C API does. This keeps the implementations thin: the
//! NI binding ([`NiDaq`](crate::nidaqmx::NiDaq), behind the `nidaqmx` feature) forwards each call
//! to the driver, and the [`SimulatedDaq`](crate::sim::SimulatedDaq) loop-back card emulates them.
//!
//! Status codes are turned into errors in one place, [`daqmx_call`] (or [`check_status`] when the
//! call has already been made). Negative codes become [`Error::Hardware`] and are logged at `error`;
//! positive codes become [`Error::HardwareWarning`] and are logged at `warn`. In both cases the
//! message is the driver's own error string.
//!
//! ## Example
//!
//! ```
//! use pvexpctrl_backend::*;
//!
//! let mut hw = SimulatedDaq::default();
//! let mut task = SimTask::default();
//! daqmx_call(&mut hw, |hw| hw.create_output_task("Dev3/ao0", 5., &mut task)).unwrap();
//! daqmx_call(&mut hw, |hw| hw.clear(task)).unwrap();
//! assert_eq!(hw.open_tasks(), 0);
//! ```

use std::fmt;

use crate::error::{Error, Result};

pub type DaqStatus = i32;

pub const DAQMX_SUCCESS: DaqStatus = 0;
/// Read did not complete before the timeout elapsed.
pub const DAQMX_ERROR_TIMEOUT: DaqStatus = -200284;

/// Order of the samples in a multi-channel read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadLayout {
    /// All samples of channel 0, then all samples of channel 1, ...
    GroupByChannel,
    /// One sample of every channel, then the next sample of every channel, ...
    GroupByScanNumber,
}

/// Finite sample clock, sampling on the rising edge of `source`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClockConfig<'a> {
    /// Clock terminal, empty for the on-board clock.
    pub source: &'a str,
    pub rate: f64,
    /// Samples per channel to generate or acquire.
    pub sample_count: u64,
}

pub trait HardwareChannel {
    /// Opaque task handle. `Default` is the null handle.
    type Task: Copy + Default + PartialEq + fmt::Debug;

    /// Creates a task with one analog output voltage channel spanning `±voltage_range`.
    ///
    /// `task` is written as soon as the driver allocates it, so a failed channel creation still
    /// leaves a handle that has to be cleared.
    fn create_output_task(
        &mut self,
        channel: &str,
        voltage_range: f64,
        task: &mut Self::Task,
    ) -> DaqStatus;

    /// Creates a task with differential analog input voltage channels, e.g. `Dev3/ai0:2`.
    fn create_input_task(
        &mut self,
        channel_spec: &str,
        voltage_range: f64,
        task: &mut Self::Task,
    ) -> DaqStatus;

    fn configure_clock(&mut self, task: Self::Task, clock: &ClockConfig) -> DaqStatus;

    /// Writes one sample per entry of `buffer` to a single-channel output task without starting it.
    fn write(&mut self, task: Self::Task, buffer: &[f64], written: &mut usize) -> DaqStatus;

    /// Reads as many samples per channel as fit into `buffer`, blocking for at most `timeout_s`.
    fn read(
        &mut self,
        task: Self::Task,
        buffer: &mut [f64],
        timeout_s: f64,
        layout: ReadLayout,
        samples_per_channel: &mut usize,
    ) -> DaqStatus;

    fn start(&mut self, task: Self::Task) -> DaqStatus;
    fn stop(&mut self, task: Self::Task) -> DaqStatus;
    fn clear(&mut self, task: Self::Task) -> DaqStatus;
    fn reset_device(&mut self, device: &str) -> DaqStatus;

    /// Human readable description of a status code.
    fn error_string(&self, code: DaqStatus) -> String;
}

/// Translates a driver status code into a `Result`, logging anything non-zero.
pub fn check_status<H: HardwareChannel + ?Sized>(hw: &H, status: DaqStatus) -> Result<()> {
    if status < 0 {
        let message = hw.error_string(status);
        log::error!("DAQmx Error {}: {}", status, message);
        Err(Error::Hardware {
            code: status,
            message,
        })
    } else if status > 0 {
        let message = hw.error_string(status);
        log::warn!("DAQmx Warning {}: {}", status, message);
        Err(Error::HardwareWarning {
            code: status,
            message,
        })
    } else {
        Ok(())
    }
}

/// Calls a driver function and checks its status.
///
/// ```ignore
/// daqmx_call(hw, |hw| hw.start(task))?;
/// ```
pub fn daqmx_call<H, F>(hw: &mut H, func: F) -> Result<()>
where
    H: HardwareChannel + ?Sized,
    F: FnOnce(&mut H) -> DaqStatus,
{
    let status = func(hw);
    check_status(hw, status)
}

/// Resets the named device, aborting every task running on it.
pub fn reset_device<H: HardwareChannel + ?Sized>(hw: &mut H, name: &str) -> Result<()> {
    log::info!("Resetting device {}", name);
    daqmx_call(hw, |hw| hw.reset_device(name))
}
