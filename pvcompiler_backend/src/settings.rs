//! Validated parameter bundle for one queued experiment.
//!
//! An [`ExperimentSettings`] is built from plain [`SettingsParams`] and a [`RigConfig`]. Construction
//! fails with [`Error::InvalidSettings`] when a physics parameter is out of range, and otherwise
//! applies the hardware safety clamps in a fixed order:
//!
//! 1. the sample rate is capped at the card's maximum input rate,
//! 2. the amplitude is capped at the selected output channel's ceiling,
//! 3. the voltage threshold is derived from the LED current ceiling and the channel's
//!    current-to-voltage constant.
//!
//! Clamps are policy, not errors: they are logged at `warn` and the clamped value is kept.
//! Every later mutation of the amplitude or channel goes through a setter that repeats steps 2 and 3.
//!
//! ```
//! use pvcompiler_backend::*;
//!
//! let config = RigConfig::default();
//! let params = SettingsParams {
//!     channel: OutputChannel::Low,
//!     amplitude: 15.,
//!     ..Default::default()
//! };
//! let settings = ExperimentSettings::new(params, &config).unwrap();
//! assert_eq!(settings.amplitude(), 10.);
//! assert_eq!(settings.channel_name(), "ao1");
//! ```
//!
//! The dictionary form ([`SettingsDict`]) is what crosses the persistence boundary. It keeps the
//! reference key names so queue files written by older tooling can still be read.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{RigConfig, SettingsLimits};
use crate::error::{Error, Result};

pub type SettingsDict = IndexMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaveformKind {
    Cos,
    Sin,
    Square,
    Triangle,
    MattiasCustom,
    FrequencyScan,
    NullWave,
}

impl WaveformKind {
    /// All kinds, in the order used for index-based lookups.
    pub const ALL: [WaveformKind; 7] = [
        WaveformKind::Cos,
        WaveformKind::Sin,
        WaveformKind::Square,
        WaveformKind::Triangle,
        WaveformKind::MattiasCustom,
        WaveformKind::FrequencyScan,
        WaveformKind::NullWave,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            WaveformKind::Cos => "Cos",
            WaveformKind::Sin => "Sin",
            WaveformKind::Square => "Square",
            WaveformKind::Triangle => "Triangle",
            WaveformKind::MattiasCustom => "MattiasCustom",
            WaveformKind::FrequencyScan => "FrequencyScan",
            WaveformKind::NullWave => "NullWave",
        }
    }

    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|kind| kind == self).unwrap_or_default()
    }

    pub fn from_index(index: usize) -> Result<Self> {
        Self::ALL.get(index).copied().ok_or_else(|| {
            Error::Configuration(format!(
                "Waveform index {} out of range, expected 0..{}",
                index,
                Self::ALL.len()
            ))
        })
    }
}

impl fmt::Display for WaveformKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for WaveformKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .find(|kind| kind.name() == s)
            .copied()
            .ok_or_else(|| Error::Configuration(format!("Unknown waveform shape '{}'", s)))
    }
}

/// Selects which analog output line (and driver-box range) the light source is driven from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OutputChannel {
    Low,
    #[default]
    High,
}

impl OutputChannel {
    pub const ALL: [OutputChannel; 2] = [OutputChannel::Low, OutputChannel::High];

    pub fn label(&self) -> &'static str {
        match self {
            OutputChannel::Low => "Low (50mA/V)",
            OutputChannel::High => "High (2A/V)",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            OutputChannel::Low => 0,
            OutputChannel::High => 1,
        }
    }

    pub fn from_index(index: usize) -> Result<Self> {
        Self::ALL.get(index).copied().ok_or_else(|| {
            Error::InvalidSettings(format!("Unsupported output channel index {}", index))
        })
    }
}

impl fmt::Display for OutputChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for OutputChannel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .find(|chan| chan.label() == s || format!("{:?}", chan) == s)
            .copied()
            .ok_or_else(|| Error::InvalidSettings(format!("Unsupported output channel '{}'", s)))
    }
}

/// Raw, unvalidated experiment parameters. `Default` gives the reference pulse.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsParams {
    pub waveform: WaveformKind,
    /// Active pulse duration (s).
    pub duration: f64,
    pub amplitude: f64,
    /// Silence before the pulse (ms).
    pub offset_before: f64,
    /// Silence after the pulse (ms).
    pub offset_after: f64,
    pub sample_rate: f64,
    pub channel: OutputChannel,
    pub binning: usize,
    pub averaging: usize,
}

impl Default for SettingsParams {
    fn default() -> Self {
        Self {
            waveform: WaveformKind::Sin,
            duration: 1.,
            amplitude: 0.5,
            offset_before: 1.,
            offset_after: 10.,
            sample_rate: 1.2e3,
            channel: OutputChannel::High,
            binning: 1,
            averaging: 1,
        }
    }
}

/// Input signals shown with a flipped sign. The PL diode reads negative, so it starts inverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvertedChannels {
    #[serde(rename = "Reference")]
    pub reference: bool,
    #[serde(rename = "PC")]
    pub pc: bool,
    #[serde(rename = "PL")]
    pub pl: bool,
}

impl Default for InvertedChannels {
    fn default() -> Self {
        Self {
            reference: false,
            pc: false,
            pl: true,
        }
    }
}

impl InvertedChannels {
    fn slot(&mut self, label: &str) -> Result<&mut bool> {
        match label {
            "Reference" => Ok(&mut self.reference),
            "PC" => Ok(&mut self.pc),
            "PL" => Ok(&mut self.pl),
            _ => Err(Error::Configuration(format!("Unknown input channel '{}'", label))),
        }
    }

    pub fn is_inverted(&self, label: &str) -> Result<bool> {
        let mut flags = *self;
        flags.slot(label).map(|flag| *flag)
    }

    /// Flips the flag of `label` and returns its new state.
    pub fn toggle(&mut self, label: &str) -> Result<bool> {
        let flag = self.slot(label)?;
        *flag = !*flag;
        Ok(*flag)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentSettings {
    waveform: WaveformKind,
    duration: f64,
    amplitude: f64,
    offset_before: f64,
    offset_after: f64,
    sample_rate: f64,
    channel: OutputChannel,
    binning: usize,
    averaging: usize,
    voltage_threshold: f64,
    inverted_channels: InvertedChannels,
    limits: SettingsLimits,
}

fn check_positive(name: &str, value: f64) -> Result<()> {
    if value > 0. && value.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidSettings(format!(
            "{} must be positive, got {}",
            name, value
        )))
    }
}

fn check_non_negative(name: &str, value: f64) -> Result<()> {
    if value >= 0. && value.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidSettings(format!(
            "{} must be non-negative, got {}",
            name, value
        )))
    }
}

fn check_count(name: &str, value: usize) -> Result<()> {
    if value >= 1 {
        Ok(())
    } else {
        Err(Error::InvalidSettings(format!("{} must be at least 1", name)))
    }
}

impl ExperimentSettings {
    pub fn new(params: SettingsParams, config: &RigConfig) -> Result<Self> {
        check_positive("duration", params.duration)?;
        check_non_negative("offset_before", params.offset_before)?;
        check_non_negative("offset_after", params.offset_after)?;
        check_positive("amplitude", params.amplitude)?;
        check_positive("sample_rate", params.sample_rate)?;
        check_count("averaging", params.averaging)?;
        check_count("binning", params.binning)?;

        let mut settings = Self {
            waveform: params.waveform,
            duration: params.duration,
            amplitude: params.amplitude,
            offset_before: params.offset_before,
            offset_after: params.offset_after,
            sample_rate: params.sample_rate,
            channel: params.channel,
            binning: params.binning,
            averaging: params.averaging,
            voltage_threshold: 0.,
            inverted_channels: InvertedChannels::default(),
            limits: config.limits(),
        };
        settings.clamp_sample_rate();
        settings.clamp_amplitude();
        settings.derive_threshold();
        Ok(settings)
    }

    /// Reference settings (a 1 s half-sine pulse on the high-current output).
    pub fn reference(config: &RigConfig) -> Result<Self> {
        Self::new(SettingsParams::default(), config)
    }

    fn clamp_sample_rate(&mut self) {
        let max = self.limits.max_sample_rate;
        if self.sample_rate > max {
            log::warn!(
                "Sample rate {} Hz exceeds the card maximum, clamping to {} Hz",
                self.sample_rate,
                max
            );
            self.sample_rate = max;
        }
    }

    fn clamp_amplitude(&mut self) {
        let limit = self.limits.channel(self.channel).amplitude_limit;
        if self.amplitude > limit {
            log::warn!(
                "Amplitude {} V exceeds the {} limit, clamping to {} V",
                self.amplitude,
                self.channel,
                limit
            );
            self.amplitude = limit;
        }
    }

    fn derive_threshold(&mut self) {
        let raw = self.limits.threshold_ma / self.limits.channel(self.channel).hardware_const;
        self.apply_threshold(raw);
    }

    // A threshold above both the amplitude and the hardware ceiling is capped at the ceiling.
    fn apply_threshold(&mut self, threshold: f64) {
        let ceiling = self.limits.threshold_ceiling;
        self.voltage_threshold = if threshold > self.amplitude && threshold > ceiling {
            log::warn!(
                "Voltage threshold {} V exceeds the hardware ceiling, clamping to {} V",
                threshold,
                ceiling
            );
            ceiling
        } else {
            threshold
        };
    }

    pub fn waveform(&self) -> WaveformKind {
        self.waveform
    }
    pub fn duration(&self) -> f64 {
        self.duration
    }
    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }
    pub fn offset_before(&self) -> f64 {
        self.offset_before
    }
    pub fn offset_after(&self) -> f64 {
        self.offset_after
    }
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }
    pub fn channel(&self) -> OutputChannel {
        self.channel
    }
    pub fn binning(&self) -> usize {
        self.binning
    }
    pub fn averaging(&self) -> usize {
        self.averaging
    }
    pub fn voltage_threshold(&self) -> f64 {
        self.voltage_threshold
    }
    pub fn inverted_channels(&self) -> InvertedChannels {
        self.inverted_channels
    }

    /// Physical output line the pulse is played on, e.g. `ao0`.
    pub fn channel_name(&self) -> &str {
        &self.limits.channel(self.channel).line
    }

    pub fn set_waveform(&mut self, waveform: WaveformKind) {
        self.waveform = waveform;
    }

    pub fn set_duration(&mut self, duration: f64) -> Result<()> {
        check_positive("duration", duration)?;
        self.duration = duration;
        Ok(())
    }

    pub fn set_offsets(&mut self, offset_before: f64, offset_after: f64) -> Result<()> {
        check_non_negative("offset_before", offset_before)?;
        check_non_negative("offset_after", offset_after)?;
        self.offset_before = offset_before;
        self.offset_after = offset_after;
        Ok(())
    }

    pub fn set_amplitude(&mut self, amplitude: f64) -> Result<()> {
        check_positive("amplitude", amplitude)?;
        self.amplitude = amplitude;
        self.clamp_amplitude();
        self.derive_threshold();
        Ok(())
    }

    /// Switching channel re-clamps the current amplitude to the new channel's ceiling.
    pub fn set_channel(&mut self, channel: OutputChannel) {
        self.channel = channel;
        self.clamp_amplitude();
        self.derive_threshold();
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) -> Result<()> {
        check_positive("sample_rate", sample_rate)?;
        self.sample_rate = sample_rate;
        self.clamp_sample_rate();
        Ok(())
    }

    pub fn set_voltage_threshold(&mut self, threshold: f64) {
        self.apply_threshold(threshold);
    }

    /// Flips the display sign flag of an input channel (`Reference`, `PC` or `PL`).
    pub fn toggle_inverted(&mut self, label: &str) -> Result<bool> {
        self.inverted_channels.toggle(label)
    }

    pub fn set_averaging(&mut self, averaging: usize) -> Result<()> {
        check_count("averaging", averaging)?;
        self.averaging = averaging;
        Ok(())
    }

    pub fn set_binning(&mut self, binning: usize) -> Result<()> {
        check_count("binning", binning)?;
        self.binning = binning;
        Ok(())
    }

    /// Padding plus active duration, in seconds.
    pub fn total_time(&self) -> f64 {
        self.offset_before / 1000. + self.offset_after / 1000. + self.duration
    }

    pub fn frequency(&self) -> f64 {
        1. / self.duration
    }

    pub fn total_data_points(&self) -> f64 {
        self.total_time() * self.sample_rate / self.binning as f64
    }

    pub fn to_params(&self) -> SettingsParams {
        SettingsParams {
            waveform: self.waveform,
            duration: self.duration,
            amplitude: self.amplitude,
            offset_before: self.offset_before,
            offset_after: self.offset_after,
            sample_rate: self.sample_rate,
            channel: self.channel,
            binning: self.binning,
            averaging: self.averaging,
        }
    }

    pub fn as_dict(&self) -> SettingsDict {
        let mut dict = SettingsDict::new();
        dict.insert("waveform".to_string(), Value::from(self.waveform.name()));
        dict.insert("duration".to_string(), Value::from(self.duration));
        dict.insert("amplitude".to_string(), Value::from(self.amplitude));
        dict.insert("offset_before".to_string(), Value::from(self.offset_before));
        dict.insert("offset_after".to_string(), Value::from(self.offset_after));
        dict.insert("sample_rate".to_string(), Value::from(self.sample_rate));
        dict.insert("channel".to_string(), Value::from(self.channel.index()));
        dict.insert("binning".to_string(), Value::from(self.binning));
        dict.insert("averaging".to_string(), Value::from(self.averaging));
        dict.insert(
            "voltage_threshold".to_string(),
            Value::from(self.voltage_threshold),
        );
        dict.insert(
            "inverted_channels".to_string(),
            serde_json::json!({
                "Reference": self.inverted_channels.reference,
                "PC": self.inverted_channels.pc,
                "PL": self.inverted_channels.pl,
            }),
        );
        dict
    }

    /// The settings dictionary plus the derived hardware values, as written next to a measurement.
    pub fn metadata(&self) -> SettingsDict {
        let mut dict = self.as_dict();
        dict.insert("channel_name".to_string(), Value::from(self.channel_name()));
        dict.insert("threshold_mA".to_string(), Value::from(self.limits.threshold_ma));
        dict.insert("total_time".to_string(), Value::from(self.total_time()));
        dict
    }

    /// Rebuilds settings from a dictionary. Missing keys take the reference defaults.
    pub fn from_dict(dict: &SettingsDict, config: &RigConfig) -> Result<Self> {
        let defaults = SettingsParams::default();
        let waveform = match dict.get("waveform") {
            None => defaults.waveform,
            Some(Value::String(name)) => name.parse()?,
            Some(value) => WaveformKind::from_index(dict_index("waveform", value)?)?,
        };
        let channel = match dict.get("channel") {
            None => defaults.channel,
            Some(Value::String(label)) => label.parse()?,
            Some(value) => OutputChannel::from_index(dict_index("channel", value)?)?,
        };
        let params = SettingsParams {
            waveform,
            duration: dict_f64(dict, "duration", defaults.duration)?,
            amplitude: dict_f64(dict, "amplitude", defaults.amplitude)?,
            offset_before: dict_f64(dict, "offset_before", defaults.offset_before)?,
            offset_after: dict_f64(dict, "offset_after", defaults.offset_after)?,
            sample_rate: dict_f64(dict, "sample_rate", defaults.sample_rate)?,
            channel,
            binning: match dict.get("binning") {
                None => defaults.binning,
                Some(value) => dict_index("binning", value)?,
            },
            averaging: match dict.get("averaging") {
                None => defaults.averaging,
                Some(value) => dict_index("averaging", value)?,
            },
        };
        let mut settings = Self::new(params, config)?;
        if dict.contains_key("voltage_threshold") {
            let threshold = dict_f64(dict, "voltage_threshold", settings.voltage_threshold)?;
            settings.apply_threshold(threshold);
        }
        if let Some(value) = dict.get("inverted_channels") {
            settings.inverted_channels = serde_json::from_value(value.clone())?;
        }
        Ok(settings)
    }

    /// Pretty printed JSON object with sorted keys.
    pub fn to_json_string(&self) -> Result<String> {
        let sorted: BTreeMap<String, Value> = self.as_dict().into_iter().collect();
        Ok(serde_json::to_string_pretty(&sorted)?)
    }

    pub fn from_json_str(json: &str, config: &RigConfig) -> Result<Self> {
        let dict: SettingsDict = serde_json::from_str(json)?;
        Self::from_dict(&dict, config)
    }
}

impl fmt::Display for ExperimentSettings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<ExperimentSettings: {}, {} V on {}, {} s, {} V threshold, x{} averaging>",
            self.waveform,
            self.amplitude,
            self.channel_name(),
            self.duration,
            self.voltage_threshold,
            self.averaging
        )
    }
}

fn dict_f64(dict: &SettingsDict, key: &str, default: f64) -> Result<f64> {
    match dict.get(key) {
        None => Ok(default),
        Some(value) => value.as_f64().ok_or_else(|| {
            Error::InvalidSettings(format!("Expected a number for '{}', got {}", key, value))
        }),
    }
}

// Accepts integers and integral floats (older files store counts as 1.0).
fn dict_index(key: &str, value: &Value) -> Result<usize> {
    if let Some(index) = value.as_u64() {
        return Ok(index as usize);
    }
    match value.as_f64() {
        Some(float) if float >= 0. && float.fract() == 0. => Ok(float as usize),
        _ => Err(Error::InvalidSettings(format!(
            "Expected a non-negative integer for '{}', got {}",
            key, value
        ))),
    }
}

/// Loads a queue file: a JSON array of settings dictionaries.
pub fn load_settings_list<P: AsRef<Path>>(
    path: P,
    config: &RigConfig,
) -> Result<Vec<ExperimentSettings>> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let dicts: Vec<SettingsDict> = serde_json::from_str(&contents)?;
    log::debug!(
        "Loaded {} settings from {}",
        dicts.len(),
        path.as_ref().display()
    );
    dicts
        .iter()
        .map(|dict| ExperimentSettings::from_dict(dict, config))
        .collect()
}

pub fn save_settings_list<P: AsRef<Path>>(path: P, settings: &[ExperimentSettings]) -> Result<()> {
    let dicts: Vec<BTreeMap<String, Value>> = settings
        .iter()
        .map(|s| s.as_dict().into_iter().collect())
        .collect();
    std::fs::write(path.as_ref(), serde_json::to_string_pretty(&dicts)?)?;
    log::debug!(
        "Saved {} settings to {}",
        settings.len(),
        path.as_ref().display()
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use crate::config::RigConfig;
    use crate::error::Error;
    use crate::settings::*;

    fn reference() -> ExperimentSettings {
        ExperimentSettings::reference(&RigConfig::default()).unwrap()
    }

    #[test]
    fn reference_threshold() {
        let settings = reference();
        assert_eq!(settings.voltage_threshold(), 0.08152173913043478);
        assert_eq!(settings.channel_name(), "ao0");
        assert_eq!(settings.amplitude(), 0.5);
        assert!((settings.total_time() - 1.011).abs() < 1e-12);
        assert_eq!(settings.frequency(), 1.);
        assert!((settings.total_data_points() - 1213.2).abs() < 1e-9);
    }

    #[test]
    fn amplitude_clamped_per_channel() {
        let mut settings = reference();
        settings.set_channel(OutputChannel::Low);
        settings.set_amplitude(15.).unwrap();
        assert_eq!(settings.amplitude(), 10.);
        assert_eq!(settings.voltage_threshold(), 150. / 66.);

        settings.set_channel(OutputChannel::High);
        assert_eq!(settings.amplitude(), 1.5);
        settings.set_amplitude(15.).unwrap();
        assert_eq!(settings.amplitude(), 1.5);
        assert_eq!(settings.voltage_threshold(), 150. / 1840.);
    }

    #[test]
    fn sample_rate_clamped() {
        let mut settings = reference();
        settings.set_sample_rate(9e90).unwrap();
        assert_eq!(settings.sample_rate(), 1.2e6);
    }

    #[test]
    fn clamps_follow_config() {
        let mut config = RigConfig::default();
        config.max_input_sample_rate = 500.;
        config.outputs.high.amplitude_limit = 0.25;
        let settings = ExperimentSettings::new(SettingsParams::default(), &config).unwrap();
        assert_eq!(settings.sample_rate(), 500.);
        assert_eq!(settings.amplitude(), 0.25);
    }

    #[test]
    fn threshold_ceiling() {
        let mut settings = reference();
        settings.set_voltage_threshold(1000.);
        assert_eq!(settings.voltage_threshold(), 330.);
        settings.set_voltage_threshold(200.);
        assert_eq!(settings.voltage_threshold(), 200.);
        settings.set_voltage_threshold(0.3);
        assert_eq!(settings.voltage_threshold(), 0.3);
    }

    #[test]
    fn invalid_params() {
        let config = RigConfig::default();
        let cases = [
            SettingsParams {
                duration: 0.,
                ..Default::default()
            },
            SettingsParams {
                offset_before: -1.,
                ..Default::default()
            },
            SettingsParams {
                amplitude: -0.1,
                ..Default::default()
            },
            SettingsParams {
                sample_rate: 0.,
                ..Default::default()
            },
            SettingsParams {
                averaging: 0,
                ..Default::default()
            },
            SettingsParams {
                binning: 0,
                ..Default::default()
            },
            SettingsParams {
                duration: f64::NAN,
                ..Default::default()
            },
        ];
        for params in cases {
            let result = ExperimentSettings::new(params.clone(), &config);
            assert!(
                matches!(result, Err(Error::InvalidSettings(_))),
                "{:?} should be rejected",
                params
            );
        }
    }

    #[test]
    fn setters_validate() {
        let mut settings = reference();
        assert!(settings.set_amplitude(0.).is_err());
        assert!(settings.set_averaging(0).is_err());
        assert!(settings.set_offsets(1., -2.).is_err());
        assert_eq!(settings.amplitude(), 0.5);
        assert_eq!(settings.offset_after(), 10.);
    }

    #[test]
    fn waveform_names() {
        for (i, kind) in WaveformKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
            assert_eq!(kind.to_string().parse::<WaveformKind>().unwrap(), *kind);
        }
        assert_eq!(WaveformKind::from_index(3).unwrap(), WaveformKind::Triangle);
        assert!(matches!(
            "Sawtooth".parse::<WaveformKind>(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn dict_round_trip() {
        let config = RigConfig::default();
        let params = SettingsParams {
            waveform: WaveformKind::MattiasCustom,
            duration: 0.25,
            amplitude: 7.5,
            offset_before: 2.5,
            offset_after: 0.,
            sample_rate: 20e3,
            channel: OutputChannel::Low,
            binning: 4,
            averaging: 3,
        };
        let settings = ExperimentSettings::new(params, &config).unwrap();
        let dict = settings.as_dict();
        assert_eq!(dict["waveform"], "MattiasCustom");
        assert_eq!(dict["channel"], 0);

        let rebuilt = ExperimentSettings::from_dict(&dict, &config).unwrap();
        assert_eq!(rebuilt, settings);

        let json = settings.to_json_string().unwrap();
        let from_json = ExperimentSettings::from_json_str(&json, &config).unwrap();
        assert_eq!(from_json, settings);
    }

    #[test]
    fn dict_keeps_overridden_threshold_and_inversion() {
        let config = RigConfig::default();
        let mut settings = ExperimentSettings::reference(&config).unwrap();
        settings.set_voltage_threshold(0.3);
        assert!(!settings.toggle_inverted("PL").unwrap());
        assert!(settings.toggle_inverted("PC").unwrap());

        let dict = settings.as_dict();
        assert_eq!(dict["voltage_threshold"], 0.3);
        assert_eq!(dict["inverted_channels"]["PC"], true);
        assert_eq!(dict["inverted_channels"]["PL"], false);

        let rebuilt = ExperimentSettings::from_dict(&dict, &config).unwrap();
        assert_eq!(rebuilt.voltage_threshold(), 0.3);
        assert_eq!(rebuilt.inverted_channels(), settings.inverted_channels());
        assert_eq!(rebuilt, settings);

        let json = settings.to_json_string().unwrap();
        let from_json = ExperimentSettings::from_json_str(&json, &config).unwrap();
        assert_eq!(from_json, settings);

        // dictionaries without the keys fall back to the derived threshold and default flags
        let mut bare = dict.clone();
        bare.shift_remove("voltage_threshold");
        bare.shift_remove("inverted_channels");
        let fresh = ExperimentSettings::from_dict(&bare, &config).unwrap();
        assert_eq!(fresh.voltage_threshold(), 150. / 1840.);
        assert_eq!(fresh.inverted_channels(), InvertedChannels::default());
    }

    #[test]
    fn inverted_channel_labels() {
        let mut flags = InvertedChannels::default();
        assert!(flags.is_inverted("PL").unwrap());
        assert!(!flags.is_inverted("Reference").unwrap());
        assert!(flags.toggle("Reference").unwrap());
        assert!(matches!(flags.toggle("PD"), Err(Error::Configuration(_))));
    }

    #[test]
    fn dict_accepts_indices_and_labels() {
        let config = RigConfig::default();
        let json = r#"{"waveform": 2, "channel": "Low (50mA/V)", "averaging": 2.0}"#;
        let settings = ExperimentSettings::from_json_str(json, &config).unwrap();
        assert_eq!(settings.waveform(), WaveformKind::Square);
        assert_eq!(settings.channel(), OutputChannel::Low);
        assert_eq!(settings.averaging(), 2);
        assert_eq!(settings.duration(), 1.);
        assert_eq!(settings.sample_rate(), 1200.);
    }

    #[test]
    fn dict_rejects_unknown_values() {
        let config = RigConfig::default();
        assert!(matches!(
            ExperimentSettings::from_json_str(r#"{"waveform": "Ramp"}"#, &config),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            ExperimentSettings::from_json_str(r#"{"channel": 5}"#, &config),
            Err(Error::InvalidSettings(_))
        ));
        assert!(matches!(
            ExperimentSettings::from_json_str(r#"{"amplitude": "high"}"#, &config),
            Err(Error::InvalidSettings(_))
        ));
        assert!(matches!(
            ExperimentSettings::from_json_str("[1, 2]", &config),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn metadata_has_derived_values() {
        let metadata = reference().metadata();
        assert_eq!(metadata["channel_name"], "ao0");
        assert_eq!(metadata["voltage_threshold"], 0.08152173913043478);
        assert_eq!(metadata["threshold_mA"], 150.);
        assert_eq!(metadata["inverted_channels"]["PL"], true);
        assert_eq!(metadata["inverted_channels"]["Reference"], false);
    }
}
