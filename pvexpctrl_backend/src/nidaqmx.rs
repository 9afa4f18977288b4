//! [`HardwareChannel`] on top of the NI-DAQmx C library.
//!
//! ## Overview
//!
//! [`NiDaq`] forwards each trait method to the matching
//! [DAQmx C-function](https://www.ni.com/docs/en-US/bundle/ni-daqmx-c-api-ref/page/cdaqmx/help_file_title.html)
//! and returns its status code untouched; turning codes into errors is left to
//! [`daqmx_call`](crate::daq::daqmx_call). Task handles are plain [`NiTaskHandle`] values with no
//! `Drop` of their own: [`AcquisitionSession`](crate::session::AcquisitionSession) owns the
//! stop/clear sequence.
//!
//! Only compiled with the `nidaqmx` feature, which links against `NIDAQmx`.
//!
//! ## Example
//!
//! ```ignore
//! # use pvexpctrl_backend::*;
//! let mut hw = NiDaq::new();
//! reset_device(&mut hw, "Dev3")?;
//! let mut task = NiTaskHandle::default();
//! daqmx_call(&mut hw, |hw| hw.create_output_task("Dev3/ao0", 5., &mut task))?;
//! ```

use std::ffi::{CStr, CString};

use libc;

use crate::daq::*;

type CConstStr = *const libc::c_char;
type CCharBuf = *mut libc::c_char;
type CFloat64 = libc::c_double;
type CUint32 = libc::c_uint;
type CUint64 = libc::c_ulonglong;
type CBool32 = libc::c_uint;
type CInt32 = libc::c_int;
type TaskHandle = *mut libc::c_void;

const DAQMX_VAL_CFG_DEFAULT: CInt32 = -1;
const DAQMX_VAL_RISING: CInt32 = 10280;
const DAQMX_VAL_VOLTS: CInt32 = 10348;
const DAQMX_VAL_FINITESAMPS: CInt32 = 10178;
const DAQMX_VAL_GROUPBYCHANNEL: CBool32 = 0;
const DAQMX_VAL_GROUPBYSCANNUMBER: CBool32 = 1;
const DAQMX_VAL_WAITINFINITELY: CFloat64 = -1.0;

/// Not a driver code: a name handed to the driver contained an interior NUL byte.
pub const NIDAQ_ERROR_INVALID_NAME: DaqStatus = -1;

#[link(name = "NIDAQmx")]
extern "C" {
    fn DAQmxResetDevice(name: CConstStr) -> CInt32;
    fn DAQmxGetErrorString(errorCode: CInt32, errorString: CCharBuf, bufferSize: CUint32) -> CInt32;
    fn DAQmxGetExtendedErrorInfo(errorString: CCharBuf, bufferSize: CUint32) -> CInt32;

    fn DAQmxCreateTask(taskName: CConstStr, taskHandle_ptr: &mut TaskHandle) -> CInt32;
    fn DAQmxStartTask(handle: TaskHandle) -> CInt32;
    fn DAQmxStopTask(handle: TaskHandle) -> CInt32;
    fn DAQmxClearTask(handle: TaskHandle) -> CInt32;

    fn DAQmxCfgSampClkTiming(
        handle: TaskHandle,
        src: CConstStr,
        rate: CFloat64,
        activeEdge: CInt32,
        sampleMode: CInt32,
        sampsPerChan: CUint64,
    ) -> CInt32;

    fn DAQmxCreateAOVoltageChan(
        handle: TaskHandle,
        name: CConstStr,
        assigned_name: CConstStr,
        minVal: CFloat64,
        maxVal: CFloat64,
        units: CInt32,
        customScaleName: CConstStr,
    ) -> CInt32;
    fn DAQmxCreateAIVoltageChan(
        handle: TaskHandle,
        name: CConstStr,
        assigned_name: CConstStr,
        terminalConfig: CInt32,
        minVal: CFloat64,
        maxVal: CFloat64,
        units: CInt32,
        customScaleName: CConstStr,
    ) -> CInt32;

    fn DAQmxWriteAnalogF64(
        handle: TaskHandle,
        seqLen: CInt32,
        autoStart: CBool32,
        timeout: CFloat64,
        dataLayout: CBool32,
        writeArray: *const CFloat64,
        sampsPerChanWritten: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;
    fn DAQmxReadAnalogF64(
        handle: TaskHandle,
        numSampsPerChan: CInt32,
        timeout: CFloat64,
        fillMode: CBool32,
        readArray: *mut CFloat64,
        arraySizeInSamps: CUint32,
        sampsPerChanRead: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;
}

/// Raw DAQmx task handle; the default is the null handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NiTaskHandle(TaskHandle);

impl Default for NiTaskHandle {
    fn default() -> Self {
        Self(std::ptr::null_mut())
    }
}

// DAQmx task handles are opaque driver-side identifiers, safe to use from any thread.
unsafe impl Send for NiTaskHandle {}

/// The NI-DAQmx driver. Stateless: all state lives in the driver behind the task handles.
#[derive(Debug, Default)]
pub struct NiDaq;

impl NiDaq {
    pub fn new() -> Self {
        Self
    }

    fn create_task(task: &mut NiTaskHandle) -> DaqStatus {
        let mut handle: TaskHandle = std::ptr::null_mut();
        let status = match CString::new("") {
            Ok(name) => unsafe { DAQmxCreateTask(name.as_ptr(), &mut handle) },
            Err(_) => NIDAQ_ERROR_INVALID_NAME,
        };
        task.0 = handle;
        status
    }

    /// Last error reported by the driver, with the task and channel context DAQmx attaches to it.
    pub fn extended_error_info(&self) -> String {
        let mut err_buff = [0 as libc::c_char; 2048];
        unsafe {
            DAQmxGetExtendedErrorInfo(err_buff.as_mut_ptr(), err_buff.len() as CUint32);
            CStr::from_ptr(err_buff.as_ptr())
        }
        .to_string_lossy()
        .into_owned()
    }
}

impl HardwareChannel for NiDaq {
    type Task = NiTaskHandle;

    fn create_output_task(
        &mut self,
        channel: &str,
        voltage_range: f64,
        task: &mut NiTaskHandle,
    ) -> DaqStatus {
        let status = Self::create_task(task);
        if status < 0 {
            return status;
        }
        let (name, assigned) = match (CString::new(channel), CString::new("")) {
            (Ok(name), Ok(assigned)) => (name, assigned),
            _ => return NIDAQ_ERROR_INVALID_NAME,
        };
        unsafe {
            DAQmxCreateAOVoltageChan(
                task.0,
                name.as_ptr(),
                assigned.as_ptr(),
                -voltage_range,
                voltage_range,
                DAQMX_VAL_VOLTS,
                std::ptr::null(),
            )
        }
    }

    fn create_input_task(
        &mut self,
        channel_spec: &str,
        voltage_range: f64,
        task: &mut NiTaskHandle,
    ) -> DaqStatus {
        let status = Self::create_task(task);
        if status < 0 {
            return status;
        }
        let (name, assigned) = match (CString::new(channel_spec), CString::new("")) {
            (Ok(name), Ok(assigned)) => (name, assigned),
            _ => return NIDAQ_ERROR_INVALID_NAME,
        };
        unsafe {
            DAQmxCreateAIVoltageChan(
                task.0,
                name.as_ptr(),
                assigned.as_ptr(),
                DAQMX_VAL_CFG_DEFAULT,
                -voltage_range,
                voltage_range,
                DAQMX_VAL_VOLTS,
                std::ptr::null(),
            )
        }
    }

    fn configure_clock(&mut self, task: NiTaskHandle, clock: &ClockConfig) -> DaqStatus {
        let src = match CString::new(clock.source) {
            Ok(src) => src,
            Err(_) => return NIDAQ_ERROR_INVALID_NAME,
        };
        unsafe {
            DAQmxCfgSampClkTiming(
                task.0,
                src.as_ptr(),
                clock.rate as CFloat64,
                DAQMX_VAL_RISING,
                DAQMX_VAL_FINITESAMPS,
                clock.sample_count as CUint64,
            )
        }
    }

    fn write(&mut self, task: NiTaskHandle, buffer: &[f64], written: &mut usize) -> DaqStatus {
        let mut nwritten: CInt32 = 0;
        let status = unsafe {
            DAQmxWriteAnalogF64(
                task.0,
                buffer.len() as CInt32,
                false as CBool32,
                DAQMX_VAL_WAITINFINITELY,
                DAQMX_VAL_GROUPBYCHANNEL,
                buffer.as_ptr(),
                &mut nwritten as *mut CInt32,
                std::ptr::null_mut(),
            )
        };
        *written = nwritten.max(0) as usize;
        status
    }

    fn read(
        &mut self,
        task: NiTaskHandle,
        buffer: &mut [f64],
        timeout_s: f64,
        layout: ReadLayout,
        samples_per_channel: &mut usize,
    ) -> DaqStatus {
        let fill_mode = match layout {
            ReadLayout::GroupByChannel => DAQMX_VAL_GROUPBYCHANNEL,
            ReadLayout::GroupByScanNumber => DAQMX_VAL_GROUPBYSCANNUMBER,
        };
        let mut nread: CInt32 = 0;
        // -1 reads every sample the finite acquisition produces
        let status = unsafe {
            DAQmxReadAnalogF64(
                task.0,
                -1,
                timeout_s as CFloat64,
                fill_mode,
                buffer.as_mut_ptr(),
                buffer.len() as CUint32,
                &mut nread as *mut CInt32,
                std::ptr::null_mut(),
            )
        };
        *samples_per_channel = nread.max(0) as usize;
        status
    }

    fn start(&mut self, task: NiTaskHandle) -> DaqStatus {
        unsafe { DAQmxStartTask(task.0) }
    }

    fn stop(&mut self, task: NiTaskHandle) -> DaqStatus {
        unsafe { DAQmxStopTask(task.0) }
    }

    fn clear(&mut self, task: NiTaskHandle) -> DaqStatus {
        unsafe { DAQmxClearTask(task.0) }
    }

    fn reset_device(&mut self, device: &str) -> DaqStatus {
        match CString::new(device) {
            Ok(name) => unsafe { DAQmxResetDevice(name.as_ptr()) },
            Err(_) => NIDAQ_ERROR_INVALID_NAME,
        }
    }

    fn error_string(&self, code: DaqStatus) -> String {
        if code == NIDAQ_ERROR_INVALID_NAME {
            return "Device, channel or terminal name contains a NUL byte".to_string();
        }
        let mut err_buff = [0 as libc::c_char; 2048];
        let status = unsafe {
            DAQmxGetErrorString(code, err_buff.as_mut_ptr(), err_buff.len() as CUint32)
        };
        if status < 0 {
            return self.extended_error_info();
        }
        unsafe { CStr::from_ptr(err_buff.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}
