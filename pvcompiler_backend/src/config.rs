//! Hardware description of the measurement rig.
//!
//! Every constant that depends on the physical setup (which NI card, which analog lines, the
//! current-to-voltage constants of the LED driver box, sample-rate ceilings of the card) lives in
//! [`RigConfig`]. A single `RigConfig` value is passed into [`ExperimentSettings`] construction and
//! owned by the acquisition side, so tests can run against fake ceilings without touching any
//! process-wide state.
//!
//! `RigConfig::default()` describes the reference rig: an NI card named `Dev3`, the light source
//! driven from `ao0` (high-current range, 2A/V) or `ao1` (low-current range, 50mA/V), and the
//! Reference/PC/PL signals sampled on the differential inputs `ai0:2`.
//!
//! The configuration can be loaded from JSON; missing keys take their default value:
//!
//! ```
//! use pvcompiler_backend::*;
//!
//! let config = RigConfig::from_json_str(r#"{"device_name": "Dev1", "read_timeout_s": 2.5}"#).unwrap();
//! assert_eq!(config.device_name, "Dev1");
//! assert_eq!(config.output_physical_name(OutputChannel::High), "Dev1/ao0");
//! assert_eq!(config.input_physical_spec(), "Dev1/ai0:2");
//! ```
//!
//! [`ExperimentSettings`]: crate::settings::ExperimentSettings

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::settings::OutputChannel;

/// One analog output line of the card together with the constants of the driver box behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputLine {
    /// Physical line name on the card, e.g. `ao0`.
    pub line: String,
    /// Converts commanded voltage to LED current; determined by experimental measurement.
    pub hardware_const: f64,
    /// Largest amplitude (V) that may be commanded on this line.
    pub amplitude_limit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputTable {
    pub low: OutputLine,
    pub high: OutputLine,
}

impl Default for OutputTable {
    fn default() -> Self {
        Self {
            // 10V is the output limit of the data card
            low: OutputLine {
                line: "ao1".to_string(),
                hardware_const: 66.,
                amplitude_limit: 10.,
            },
            // 1.5V is imposed by the current limit of the power supply
            high: OutputLine {
                line: "ao0".to_string(),
                hardware_const: 1840.,
                amplitude_limit: 1.5,
            },
        }
    }
}

/// Inputs sampled on every cycle: Reference, PC and PL.
pub const RIG_INPUT_CHANNELS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub device_name: String,
    /// Input channel range on the card, sampled as Reference, PC, PL.
    pub input_channels: String,
    pub channel_count: usize,
    /// Sample clock terminal driving the output task.
    pub output_clock_source: String,
    /// Sample clock terminal driving the input task; empty for the on-board clock.
    pub input_clock_source: String,
    /// LED current ceiling (mA) from which the voltage threshold is derived.
    pub threshold_ma: f64,
    pub threshold_const: f64,
    pub max_input_sample_rate: f64,
    pub max_output_sample_rate: f64,
    /// Input ranges (±V) supported by the card.
    pub input_voltage_ranges: Vec<f64>,
    pub input_voltage_range: f64,
    pub output_voltage_range: f64,
    pub read_timeout_s: f64,
    pub outputs: OutputTable,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            device_name: "Dev3".to_string(),
            input_channels: "ai0:2".to_string(),
            channel_count: 3,
            output_clock_source: "/Dev3/ai/SampleClock".to_string(),
            input_clock_source: String::new(),
            threshold_ma: 150.,
            threshold_const: 5.,
            // 1.25MS/s/channel on the card, kept below that
            max_input_sample_rate: 1.2e6,
            max_output_sample_rate: 1.2e6,
            input_voltage_ranges: vec![10., 5., 2., 1.],
            input_voltage_range: 10.,
            output_voltage_range: 5.,
            read_timeout_s: 10.,
            outputs: OutputTable::default(),
        }
    }
}

/// The subset of [`RigConfig`] an [`ExperimentSettings`](crate::settings::ExperimentSettings)
/// carries around to re-derive its clamps after a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsLimits {
    pub max_sample_rate: f64,
    pub threshold_ma: f64,
    pub threshold_ceiling: f64,
    pub low: ChannelLimits,
    pub high: ChannelLimits,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelLimits {
    pub line: String,
    pub hardware_const: f64,
    pub amplitude_limit: f64,
}

impl SettingsLimits {
    pub fn channel(&self, channel: OutputChannel) -> &ChannelLimits {
        match channel {
            OutputChannel::Low => &self.low,
            OutputChannel::High => &self.high,
        }
    }
}

impl RigConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: RigConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        log::debug!("Loading rig configuration from {}", path.as_ref().display());
        Self::from_json_str(&contents)
    }

    pub fn output(&self, channel: OutputChannel) -> &OutputLine {
        match channel {
            OutputChannel::Low => &self.outputs.low,
            OutputChannel::High => &self.outputs.high,
        }
    }

    /// Full physical name of an output line as seen by the NI driver, e.g. `Dev3/ao0`.
    pub fn output_physical_name(&self, channel: OutputChannel) -> String {
        format!("{}/{}", self.device_name, self.output(channel).line)
    }

    /// Full physical name of the input channel range, e.g. `Dev3/ai0:2`.
    pub fn input_physical_spec(&self) -> String {
        format!("{}/{}", self.device_name, self.input_channels)
    }

    /// Upper bound for any voltage threshold that exceeds the amplitude.
    pub fn threshold_ceiling(&self) -> f64 {
        self.outputs.low.hardware_const * self.threshold_const
    }

    pub fn limits(&self) -> SettingsLimits {
        let channel_limits = |line: &OutputLine| ChannelLimits {
            line: line.line.clone(),
            hardware_const: line.hardware_const,
            amplitude_limit: line.amplitude_limit,
        };
        SettingsLimits {
            max_sample_rate: self.max_input_sample_rate,
            threshold_ma: self.threshold_ma,
            threshold_ceiling: self.threshold_ceiling(),
            low: channel_limits(&self.outputs.low),
            high: channel_limits(&self.outputs.high),
        }
    }

    /// Checks naming conventions of the physical channels and the sanity of all numeric constants.
    ///
    /// # Naming Conventions:
    /// - Output lines: `ao(number)`, e.g. `ao0`.
    /// - Input channels: `ai(number)` or a range `ai(number):(number)`, e.g. `ai0:2`.
    pub fn validate(&self) -> Result<()> {
        if self.device_name.trim().is_empty() {
            return Err(Error::Configuration("Device name must not be empty".to_string()));
        }
        let ao_re = Regex::new(r"^ao\d+$").map_err(|e| Error::Configuration(e.to_string()))?;
        for line in [&self.outputs.low, &self.outputs.high] {
            if !ao_re.is_match(&line.line) {
                return Err(Error::Configuration(format!(
                    "Expecting output lines to be of format 'ao(number)' yet received {}",
                    line.line
                )));
            }
            if !(line.hardware_const > 0.) || !(line.amplitude_limit > 0.) {
                return Err(Error::Configuration(format!(
                    "Output line {} needs positive hardware constant and amplitude limit, got {} and {}",
                    line.line, line.hardware_const, line.amplitude_limit
                )));
            }
        }
        if self.outputs.low.line == self.outputs.high.line {
            return Err(Error::Configuration(format!(
                "Low and high outputs share the physical line {}",
                self.outputs.low.line
            )));
        }
        let ai_re = Regex::new(r"^ai(\d+)(?::(\d+))?$")
            .map_err(|e| Error::Configuration(e.to_string()))?;
        let caps = ai_re.captures(&self.input_channels).ok_or_else(|| {
            Error::Configuration(format!(
                "Expecting input channels to be of format 'ai(number)' or 'ai(number):(number)' yet received {}",
                self.input_channels
            ))
        })?;
        let line = |idx: usize| -> Result<Option<usize>> {
            caps.get(idx)
                .map(|m| {
                    m.as_str().parse::<usize>().map_err(|e| {
                        Error::Configuration(format!("Input line {}: {}", m.as_str(), e))
                    })
                })
                .transpose()
        };
        let first = line(1)?.unwrap_or(0);
        let last = line(2)?.unwrap_or(first);
        if last < first {
            return Err(Error::Configuration(format!(
                "Input channel range {} is descending",
                self.input_channels
            )));
        }
        if self.channel_count != RIG_INPUT_CHANNELS {
            return Err(Error::Configuration(format!(
                "The rig samples {} inputs (Reference, PC, PL), got channel_count {}",
                RIG_INPUT_CHANNELS, self.channel_count
            )));
        }
        if last - first + 1 != self.channel_count {
            return Err(Error::Configuration(format!(
                "Input channels {} span {} line(s), expected {}",
                self.input_channels,
                last - first + 1,
                self.channel_count
            )));
        }
        for (name, value) in [
            ("threshold_ma", self.threshold_ma),
            ("threshold_const", self.threshold_const),
            ("max_input_sample_rate", self.max_input_sample_rate),
            ("max_output_sample_rate", self.max_output_sample_rate),
            ("output_voltage_range", self.output_voltage_range),
            ("read_timeout_s", self.read_timeout_s),
        ] {
            if !(value > 0.) || !value.is_finite() {
                return Err(Error::Configuration(format!(
                    "{name} must be positive and finite, got {value}"
                )));
            }
        }
        if !self.input_voltage_ranges.contains(&self.input_voltage_range) {
            return Err(Error::Configuration(format!(
                "Input voltage range {} is not one of the supported ranges {:?}",
                self.input_voltage_range, self.input_voltage_ranges
            )));
        }
        Ok(())
    }
}
