//! Loop-back stand-in for the NI card.
//!
//! [`SimulatedDaq`] implements [`HardwareChannel`] without any driver. Input channels echo the
//! waveform written to the running output task, each channel scaled by its own gain (the reference
//! channel sees the commanded voltage, PC and PL see attenuated copies by default). Tests can also
//! queue exact read buffers, inject failure status codes for the next call of a given operation,
//! and inspect the call log and the number of tasks still allocated.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::daq::*;

/// The task handle does not name an allocated task.
pub const SIM_ERROR_INVALID_TASK: DaqStatus = -200088;
/// Read was attempted on a task that is not running.
pub const SIM_ERROR_NOT_RUNNING: DaqStatus = -200983;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    CreateOutput,
    CreateInput,
    ConfigureClock,
    Write,
    Read,
    Start,
    Stop,
    Clear,
    ResetDevice,
}

/// Handle of a simulated task; `0` is the null handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SimTask(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    Output,
    Input,
}

#[derive(Debug)]
struct TaskState {
    kind: TaskKind,
    channel: String,
    rate: f64,
    sample_count: u64,
    running: bool,
    written: Vec<f64>,
}

#[derive(Debug)]
pub struct SimulatedDaq {
    channel_count: usize,
    gains: Vec<f64>,
    tasks: BTreeMap<SimTask, TaskState>,
    next_handle: usize,
    scripted_reads: VecDeque<Vec<f64>>,
    failures: Vec<(SimOp, DaqStatus)>,
    calls: Vec<(SimOp, SimTask)>,
    read_latency: Duration,
}

impl Default for SimulatedDaq {
    fn default() -> Self {
        Self::new(3)
    }
}

impl SimulatedDaq {
    pub fn new(channel_count: usize) -> Self {
        Self {
            channel_count,
            gains: (0..channel_count).map(|c| 1. / (1 << c) as f64).collect(),
            tasks: BTreeMap::new(),
            next_handle: 1,
            scripted_reads: VecDeque::new(),
            failures: Vec::new(),
            calls: Vec::new(),
            read_latency: Duration::ZERO,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Scale factor applied to the echoed output on each input channel.
    pub fn set_gains(&mut self, gains: Vec<f64>) {
        self.gains = gains;
    }

    /// The next read returns `buffer` (channel-blocked) instead of the loop-back signal.
    pub fn push_read(&mut self, buffer: Vec<f64>) {
        self.scripted_reads.push_back(buffer);
    }

    /// Every successful read blocks for `latency` before returning, like a card waiting for its
    /// samples.
    pub fn set_read_latency(&mut self, latency: Duration) {
        self.read_latency = latency;
    }

    /// The next call of `op` returns `status`. Create calls still allocate their handle.
    pub fn fail_next(&mut self, op: SimOp, status: DaqStatus) {
        self.failures.push((op, status));
    }

    pub fn calls(&self) -> &[(SimOp, SimTask)] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Number of tasks created and not yet cleared.
    pub fn open_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Rate and samples per channel the task's clock was configured with.
    pub fn clock_of(&self, task: SimTask) -> Option<(f64, u64)> {
        self.tasks.get(&task).map(|t| (t.rate, t.sample_count))
    }

    /// Physical channel names of the tasks still allocated.
    pub fn open_channels(&self) -> Vec<&str> {
        self.tasks.values().map(|t| t.channel.as_str()).collect()
    }

    fn record(&mut self, op: SimOp, task: SimTask) -> DaqStatus {
        self.calls.push((op, task));
        match self.failures.iter().position(|(failing, _)| *failing == op) {
            Some(idx) => self.failures.remove(idx).1,
            None => DAQMX_SUCCESS,
        }
    }

    fn create(&mut self, kind: TaskKind, channel: &str, task: &mut SimTask) -> SimTask {
        let handle = SimTask(self.next_handle);
        self.next_handle += 1;
        self.tasks.insert(
            handle,
            TaskState {
                kind,
                channel: channel.to_string(),
                rate: 0.,
                sample_count: 0,
                running: false,
                written: Vec::new(),
            },
        );
        *task = handle;
        handle
    }

    fn loop_back(&self, buffer: &mut [f64], samples: usize, layout: ReadLayout) {
        let output = self
            .tasks
            .values()
            .find(|t| t.kind == TaskKind::Output && t.running)
            .map(|t| t.written.as_slice())
            .unwrap_or(&[]);
        for chan in 0..self.channel_count {
            let gain = self.gains.get(chan).copied().unwrap_or(1.);
            for i in 0..samples {
                let value = if output.is_empty() {
                    0.
                } else {
                    gain * output[i * output.len() / samples]
                };
                let idx = match layout {
                    ReadLayout::GroupByChannel => chan * samples + i,
                    ReadLayout::GroupByScanNumber => i * self.channel_count + chan,
                };
                buffer[idx] = value;
            }
        }
    }
}

impl HardwareChannel for SimulatedDaq {
    type Task = SimTask;

    fn create_output_task(&mut self, channel: &str, voltage_range: f64, task: &mut SimTask) -> DaqStatus {
        let handle = self.create(TaskKind::Output, channel, task);
        log::debug!("sim: output task {:?} on {} (±{} V)", handle, channel, voltage_range);
        self.record(SimOp::CreateOutput, handle)
    }

    fn create_input_task(&mut self, channel_spec: &str, voltage_range: f64, task: &mut SimTask) -> DaqStatus {
        let handle = self.create(TaskKind::Input, channel_spec, task);
        log::debug!("sim: input task {:?} on {} (±{} V)", handle, channel_spec, voltage_range);
        self.record(SimOp::CreateInput, handle)
    }

    fn configure_clock(&mut self, task: SimTask, clock: &ClockConfig) -> DaqStatus {
        let status = self.record(SimOp::ConfigureClock, task);
        if status != DAQMX_SUCCESS {
            return status;
        }
        match self.tasks.get_mut(&task) {
            Some(state) => {
                state.rate = clock.rate;
                state.sample_count = clock.sample_count;
                DAQMX_SUCCESS
            }
            None => SIM_ERROR_INVALID_TASK,
        }
    }

    fn write(&mut self, task: SimTask, buffer: &[f64], written: &mut usize) -> DaqStatus {
        let status = self.record(SimOp::Write, task);
        if status != DAQMX_SUCCESS {
            return status;
        }
        match self.tasks.get_mut(&task) {
            Some(state) if state.kind == TaskKind::Output => {
                state.written = buffer.to_vec();
                *written = buffer.len();
                DAQMX_SUCCESS
            }
            _ => SIM_ERROR_INVALID_TASK,
        }
    }

    fn read(
        &mut self,
        task: SimTask,
        buffer: &mut [f64],
        timeout_s: f64,
        layout: ReadLayout,
        samples_per_channel: &mut usize,
    ) -> DaqStatus {
        *samples_per_channel = 0;
        let status = self.record(SimOp::Read, task);
        if status != DAQMX_SUCCESS {
            return status;
        }
        let (rate, sample_count) = match self.tasks.get(&task) {
            Some(state) if state.kind == TaskKind::Input && state.running => {
                (state.rate, state.sample_count)
            }
            Some(_) => return SIM_ERROR_NOT_RUNNING,
            None => return SIM_ERROR_INVALID_TASK,
        };
        if !self.read_latency.is_zero() {
            std::thread::sleep(self.read_latency);
        }

        if let Some(scripted) = self.scripted_reads.pop_front() {
            let len = scripted.len().min(buffer.len());
            buffer[..len].copy_from_slice(&scripted[..len]);
            *samples_per_channel = len / self.channel_count.max(1);
            return DAQMX_SUCCESS;
        }

        let samples = (buffer.len() / self.channel_count.max(1)).min(sample_count as usize);
        if rate > 0. && samples as f64 / rate > timeout_s {
            return DAQMX_ERROR_TIMEOUT;
        }
        self.loop_back(buffer, samples, layout);
        *samples_per_channel = samples;
        DAQMX_SUCCESS
    }

    fn start(&mut self, task: SimTask) -> DaqStatus {
        let status = self.record(SimOp::Start, task);
        if status != DAQMX_SUCCESS {
            return status;
        }
        match self.tasks.get_mut(&task) {
            Some(state) => {
                state.running = true;
                DAQMX_SUCCESS
            }
            None => SIM_ERROR_INVALID_TASK,
        }
    }

    fn stop(&mut self, task: SimTask) -> DaqStatus {
        let status = self.record(SimOp::Stop, task);
        if status != DAQMX_SUCCESS {
            return status;
        }
        match self.tasks.get_mut(&task) {
            Some(state) => {
                state.running = false;
                DAQMX_SUCCESS
            }
            None => SIM_ERROR_INVALID_TASK,
        }
    }

    fn clear(&mut self, task: SimTask) -> DaqStatus {
        let status = self.record(SimOp::Clear, task);
        // the handle is released even when the driver reports a problem
        match self.tasks.remove(&task) {
            Some(_) => status,
            None if status == DAQMX_SUCCESS => SIM_ERROR_INVALID_TASK,
            None => status,
        }
    }

    fn reset_device(&mut self, device: &str) -> DaqStatus {
        let status = self.record(SimOp::ResetDevice, SimTask::default());
        if status == DAQMX_SUCCESS {
            log::debug!("sim: reset {}, aborting {} task(s)", device, self.tasks.len());
            self.tasks.values_mut().for_each(|t| t.running = false);
        }
        status
    }

    fn error_string(&self, code: DaqStatus) -> String {
        match code {
            DAQMX_ERROR_TIMEOUT => {
                "Some or all of the samples requested have not yet been acquired.".to_string()
            }
            SIM_ERROR_INVALID_TASK => "Task specified is invalid or does not exist.".to_string(),
            SIM_ERROR_NOT_RUNNING => "Task is not running.".to_string(),
            _ => format!("Simulated status code {}", code),
        }
    }
}
