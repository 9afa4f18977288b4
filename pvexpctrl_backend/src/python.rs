//! Python bindings (`python` feature).
//!
//! The module exposes waveform synthesis and a [`Rig`] class driving a [`MeasurementAggregator`].
//! `Rig` plays on the simulated card unless the crate is built with `nidaqmx` and asked for the
//! real one. Settings cross the boundary as JSON strings in the settings-dict format.

use numpy::PyArray;
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pvcompiler_backend::{synthesize, ExperimentSettings, RigConfig};

use crate::aggregator::MeasurementAggregator;
use crate::error::Error;
#[cfg(feature = "nidaqmx")]
use crate::nidaqmx::NiDaq;
use crate::record::MeasurementRecord;
use crate::sim::SimulatedDaq;

impl From<Error> for PyErr {
    fn from(err: Error) -> PyErr {
        match err {
            Error::Compile(_) | Error::Configuration(_) | Error::LayoutMismatch { .. } => {
                PyValueError::new_err(err.to_string())
            }
            _ => PyRuntimeError::new_err(err.to_string()),
        }
    }
}

fn rig_config(config_json: Option<&str>) -> PyResult<RigConfig> {
    match config_json {
        Some(json) => RigConfig::from_json_str(json).map_err(|err| Error::from(err).into()),
        None => Ok(RigConfig::default()),
    }
}

/// Synthesizes the pulse described by `settings_json` and returns `(time, samples)`.
#[pyfunction]
#[pyo3(name = "synthesize")]
#[pyo3(signature = (settings_json, config_json=None))]
fn synthesize_py(
    py: Python,
    settings_json: &str,
    config_json: Option<&str>,
) -> PyResult<(PyObject, PyObject)> {
    let config = rig_config(config_json)?;
    let settings = ExperimentSettings::from_json_str(settings_json, &config).map_err(Error::from)?;
    let waveform = synthesize(&settings).map_err(Error::from)?;
    Ok((
        PyArray::from_array(py, &waveform.time_axis).to_object(py),
        PyArray::from_array(py, &waveform.samples).to_object(py),
    ))
}

enum Backend {
    Sim(MeasurementAggregator<SimulatedDaq>),
    #[cfg(feature = "nidaqmx")]
    Ni(MeasurementAggregator<NiDaq>),
}

macro_rules! with_aggregator {
    ($backend:expr, $agg:ident => $body:expr) => {
        match $backend {
            Backend::Sim($agg) => $body,
            #[cfg(feature = "nidaqmx")]
            Backend::Ni($agg) => $body,
        }
    };
}

#[pyclass(unsendable)]
pub struct Rig {
    backend: Backend,
    config: RigConfig,
}

#[pymethods]
impl Rig {
    #[new]
    #[pyo3(signature = (config_json=None, hardware=false))]
    fn new(config_json: Option<&str>, hardware: bool) -> PyResult<Self> {
        let config = rig_config(config_json)?;
        let backend = if hardware {
            hardware_backend(&config)?
        } else {
            Backend::Sim(MeasurementAggregator::new(
                SimulatedDaq::new(config.channel_count),
                config.clone(),
            )?)
        };
        Ok(Self { backend, config })
    }

    /// Queues the pulse described by `settings_json`.
    fn add_to_queue(&mut self, settings_json: &str) -> PyResult<()> {
        let settings =
            ExperimentSettings::from_json_str(settings_json, &self.config).map_err(Error::from)?;
        with_aggregator!(&mut self.backend, agg => agg.enqueue(settings))?;
        Ok(())
    }

    /// Plays every queued pulse and returns one `rows x 4` array per pulse.
    fn series_measurement(&mut self, py: Python) -> PyResult<Vec<PyObject>> {
        let records = with_aggregator!(&mut self.backend, agg => agg.series_measurement())?;
        Ok(records
            .into_iter()
            .map(|record: MeasurementRecord| {
                PyArray::from_owned_array(py, record.into_inner()).to_object(py)
            })
            .collect())
    }

    /// Plays a dark pulse and returns `(record, pc_mean, pc_std)`.
    fn pc_calibration_measurement(
        &mut self,
        py: Python,
        settings_json: &str,
    ) -> PyResult<(PyObject, f64, f64)> {
        let settings =
            ExperimentSettings::from_json_str(settings_json, &self.config).map_err(Error::from)?;
        let (record, calibration) = with_aggregator!(
            &mut self.backend,
            agg => agg.pc_calibration_measurement(&settings)
        )?;
        Ok((
            PyArray::from_owned_array(py, record.into_inner()).to_object(py),
            calibration.mean,
            calibration.std,
        ))
    }

    fn clear_queue(&mut self) {
        with_aggregator!(&mut self.backend, agg => agg.clear_queue())
    }

    fn is_queue_empty(&self) -> bool {
        with_aggregator!(&self.backend, agg => agg.is_queue_empty())
    }

    fn queue_len(&self) -> usize {
        with_aggregator!(&self.backend, agg => agg.queue_len())
    }

    fn reset_device(&mut self) -> PyResult<()> {
        with_aggregator!(&mut self.backend, agg => agg.reset_device())?;
        Ok(())
    }
}

#[cfg(feature = "nidaqmx")]
fn hardware_backend(config: &RigConfig) -> PyResult<Backend> {
    Ok(Backend::Ni(MeasurementAggregator::new(
        NiDaq::new(),
        config.clone(),
    )?))
}

#[cfg(not(feature = "nidaqmx"))]
fn hardware_backend(_config: &RigConfig) -> PyResult<Backend> {
    Err(PyRuntimeError::new_err(
        "pvexpctrl_backend was built without the nidaqmx feature",
    ))
}

#[pymodule]
fn pvexpctrl_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(synthesize_py, m)?)?;
    m.add_class::<Rig>()?;
    Ok(())
}
