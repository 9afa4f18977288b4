//! One playback+capture cycle on the card.
//!
//! An [`AcquisitionSession`] borrows the hardware for the duration of a single cycle:
//!
//! - [`new`](AcquisitionSession::new) validates the request against the [`RigConfig`] and touches
//!   no hardware;
//! - [`setup`](AcquisitionSession::setup) creates the output and input tasks, configures both
//!   sample clocks as finite acquisitions and writes the output buffer;
//! - [`run`](AcquisitionSession::run) starts both tasks and blocks in the read;
//! - [`stop`](AcquisitionSession::stop) stops and clears whatever tasks exist. It is idempotent and
//!   also runs on drop, so the card is released on every exit path.
//!
//! The output is driven from the input task's sample clock (`/Dev3/ai/SampleClock` on the reference
//! rig), which is why the output task is started first: it only begins generating once the input
//! task starts ticking.

use ndarray::{Array1, ArrayView1};
use pvcompiler_backend::{floor_samples, linspace, OutputChannel, RigConfig, TickTimer};

use crate::daq::*;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct AcquisitionRequest<'w> {
    pub waveform: ArrayView1<'w, f64>,
    pub output_channel: OutputChannel,
    /// Playback duration (s), padding included.
    pub total_time: f64,
    pub input_voltage_range: f64,
    pub output_voltage_range: f64,
    pub input_sample_rate: f64,
    pub output_sample_rate: f64,
}

/// Raw capture of one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionResult {
    /// Channel-blocked samples, `samples_per_channel` per channel.
    pub raw_buffer: Array1<f64>,
    /// Uniform grid over `[0, total_time]` with one entry per sample actually read.
    pub elapsed_time: Array1<f64>,
    pub channel_count: usize,
    pub samples_per_channel: usize,
}

pub struct AcquisitionSession<'a, 'w, H: HardwareChannel> {
    hw: &'a mut H,
    config: &'a RigConfig,
    request: AcquisitionRequest<'w>,
    write_task: Option<H::Task>,
    read_task: Option<H::Task>,
    period_length: usize,
    read_buffer: Vec<f64>,
}

impl<'a, 'w, H: HardwareChannel> AcquisitionSession<'a, 'w, H> {
    pub fn new(
        hw: &'a mut H,
        config: &'a RigConfig,
        request: AcquisitionRequest<'w>,
    ) -> Result<Self> {
        if !config.input_voltage_ranges.contains(&request.input_voltage_range) {
            return Err(Error::Configuration(format!(
                "Input voltage range ±{} V is not one of {:?}",
                request.input_voltage_range, config.input_voltage_ranges
            )));
        }
        if !(request.output_voltage_range > 0.) || !request.output_voltage_range.is_finite() {
            return Err(Error::Configuration(format!(
                "Output voltage range must be positive, got {}",
                request.output_voltage_range
            )));
        }
        for (name, rate, max) in [
            ("Output", request.output_sample_rate, config.max_output_sample_rate),
            ("Input", request.input_sample_rate, config.max_input_sample_rate),
        ] {
            if !(rate > 0.) || rate > max {
                return Err(Error::Configuration(format!(
                    "{} sample rate {} Hz outside of (0, {}] Hz",
                    name, rate, max
                )));
            }
        }
        if !(request.total_time > 0.) || !request.total_time.is_finite() {
            return Err(Error::Configuration(format!(
                "Total time must be positive, got {}",
                request.total_time
            )));
        }
        if request.waveform.is_empty() {
            return Err(Error::Configuration("Waveform is empty".to_string()));
        }
        Ok(Self {
            hw,
            config,
            request,
            write_task: None,
            read_task: None,
            period_length: 0,
            read_buffer: Vec::new(),
        })
    }

    /// Number of output samples played per cycle.
    pub fn period_length(&self) -> usize {
        self.period_length
    }

    /// Size of the read buffer, all channels together.
    pub fn max_input_samples(&self) -> usize {
        self.read_buffer.len()
    }

    pub fn hardware(&self) -> &H {
        &*self.hw
    }

    pub fn is_active(&self) -> bool {
        self.write_task.is_some() || self.read_task.is_some()
    }

    fn create_task(&mut self, output: bool) -> Result<H::Task> {
        let mut task = H::Task::default();
        let status = if output {
            let name = self.config.output_physical_name(self.request.output_channel);
            self.hw
                .create_output_task(&name, self.request.output_voltage_range, &mut task)
        } else {
            let spec = self.config.input_physical_spec();
            self.hw
                .create_input_task(&spec, self.request.input_voltage_range, &mut task)
        };
        // keep whatever handle the driver allocated so stop() can release it
        if task != H::Task::default() {
            if output {
                self.write_task = Some(task);
            } else {
                self.read_task = Some(task);
            }
        }
        check_status(&*self.hw, status)?;
        Ok(task)
    }

    pub fn setup(&mut self) -> Result<()> {
        let mut timer = TickTimer::new();
        let period_length = floor_samples(self.request.output_sample_rate, self.request.total_time);
        if period_length == 0 {
            return Err(Error::Configuration(format!(
                "{} s at {} Hz is shorter than one output sample",
                self.request.total_time, self.request.output_sample_rate
            )));
        }
        if self.request.waveform.len() > period_length {
            log::warn!(
                "Waveform has {} samples, only the first {} fit into {} s",
                self.request.waveform.len(),
                period_length,
                self.request.total_time
            );
        }
        let mut write_data = vec![0.; period_length];
        write_data
            .iter_mut()
            .zip(self.request.waveform.iter())
            .for_each(|(dst, src)| *dst = *src);
        // the output must be dark once the task ends
        write_data[period_length - 1] = 0.;
        self.period_length = period_length;

        let write_task = self.create_task(true)?;
        let clock = ClockConfig {
            source: &self.config.output_clock_source,
            rate: self.request.output_sample_rate,
            sample_count: period_length as u64,
        };
        daqmx_call(&mut *self.hw, |hw| hw.configure_clock(write_task, &clock))?;
        let mut written = 0;
        daqmx_call(&mut *self.hw, |hw| hw.write(write_task, &write_data, &mut written))?;
        if written != period_length {
            log::warn!("Wrote {} of {} output samples", written, period_length);
        }

        let max_input_samples = floor_samples(
            self.request.input_sample_rate * self.config.channel_count as f64,
            self.request.total_time,
        );
        let read_task = self.create_task(false)?;
        let clock = ClockConfig {
            source: &self.config.input_clock_source,
            rate: self.request.input_sample_rate,
            sample_count: max_input_samples as u64,
        };
        daqmx_call(&mut *self.hw, |hw| hw.configure_clock(read_task, &clock))?;
        self.read_buffer = vec![0.; max_input_samples];

        log::debug!(
            "Session set up: {} output samples, {} input samples on {}",
            period_length,
            max_input_samples,
            self.config.input_physical_spec()
        );
        timer.tick_print("session setup");
        Ok(())
    }

    pub fn run(&mut self) -> Result<AcquisitionResult> {
        let (write_task, read_task) = match (self.write_task, self.read_task) {
            (Some(write_task), Some(read_task)) => (write_task, read_task),
            _ => {
                return Err(Error::Configuration(
                    "AcquisitionSession::run called before setup".to_string(),
                ))
            }
        };
        let mut timer = TickTimer::new();
        daqmx_call(&mut *self.hw, |hw| hw.start(write_task))?;
        daqmx_call(&mut *self.hw, |hw| hw.start(read_task))?;

        let timeout_s = self.config.read_timeout_s;
        let mut samples_per_channel = 0;
        let status = self.hw.read(
            read_task,
            &mut self.read_buffer,
            timeout_s,
            ReadLayout::GroupByChannel,
            &mut samples_per_channel,
        );
        if status == DAQMX_ERROR_TIMEOUT {
            let message = self.hw.error_string(status);
            log::error!("DAQmx read timed out after {} s: {}", timeout_s, message);
            return Err(Error::HardwareTimeout { timeout_s, message });
        }
        check_status(&*self.hw, status)?;
        timer.tick_print("session run");

        let channel_count = self.config.channel_count;
        let len = (samples_per_channel * channel_count).min(self.read_buffer.len());
        Ok(AcquisitionResult {
            raw_buffer: Array1::from(self.read_buffer[..len].to_vec()),
            elapsed_time: linspace(0., self.request.total_time, samples_per_channel),
            channel_count,
            samples_per_channel,
        })
    }

    /// Stops and clears both tasks. Every existing task is released even if one call fails; the
    /// first failure is returned.
    pub fn stop(&mut self) -> Result<()> {
        let mut result = Ok(());
        for task in [self.write_task.take(), self.read_task.take()]
            .into_iter()
            .flatten()
        {
            let stopped = daqmx_call(&mut *self.hw, |hw| hw.stop(task));
            let cleared = daqmx_call(&mut *self.hw, |hw| hw.clear(task));
            if result.is_ok() {
                result = stopped.and(cleared);
            }
        }
        result
    }
}

impl<'a, 'w, H: HardwareChannel> Drop for AcquisitionSession<'a, 'w, H> {
    fn drop(&mut self) {
        if self.is_active() {
            if let Err(err) = self.stop() {
                log::error!("Failed to release acquisition tasks: {}", err);
            }
        }
    }
}

/// Runs a complete cycle: setup, run, and an unconditional stop.
pub fn acquire<H: HardwareChannel>(
    hw: &mut H,
    config: &RigConfig,
    request: AcquisitionRequest<'_>,
) -> Result<AcquisitionResult> {
    let mut session = AcquisitionSession::new(hw, config, request)?;
    let result = session.setup().and_then(|_| session.run());
    let stopped = session.stop();
    let result = result?;
    stopped?;
    Ok(result)
}
