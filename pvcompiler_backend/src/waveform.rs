//! Light-pulse synthesis.
//!
//! [`synthesize`] turns an [`ExperimentSettings`] into the voltage sequence played on the output
//! line. The sequence is built in three stages:
//!
//! 1. a raw curve is generated for the active part of the pulse, either by one of the named shape
//!    generators (dispatched through [`WaveformKind::generator`]) over a uniform time grid, or by
//!    the frequency-scan generator which builds its own time grid;
//! 2. the raw curve is scaled and shifted against the voltage threshold ([`scale_to_threshold`]),
//!    or, for a frequency scan, only shifted;
//! 3. zero padding is added on both sides and a uniform time axis is laid over the whole sequence.
//!
//! The light source is driven by negative voltages: every generator returns curves in
//! `[-amplitude, 0]`, and after threshold scaling the active part spans `[-amplitude, -threshold]`.
//!
//! ```
//! use pvcompiler_backend::*;
//!
//! let settings = ExperimentSettings::reference(&RigConfig::default()).unwrap();
//! let waveform = synthesize(&settings).unwrap();
//! // 1 ms and 10 ms of padding at 1.2 kHz around 1200 active samples
//! assert_eq!(waveform.len(), 1 + 1200 + 12);
//! assert_eq!(waveform.samples[0], 0.);
//! assert!((waveform.total_time() - 1.011).abs() < 1e-12);
//! ```

use std::f64::consts::PI;

use ndarray::{s, Array1};

use crate::error::{Error, Result};
use crate::settings::{ExperimentSettings, WaveformKind};
use crate::utils::{arange, linspace, logspace, round_samples};

/// A named shape generator: `(time_axis, amplitude) -> raw curve` of the same length.
pub type ShapeFn = fn(&Array1<f64>, f64) -> Result<Array1<f64>>;

impl WaveformKind {
    /// Generator for shapes defined over a uniform time grid. `FrequencyScan` builds its own grid
    /// and has no entry here.
    pub fn generator(&self) -> Option<ShapeFn> {
        match self {
            WaveformKind::Cos => Some(cos),
            WaveformKind::Sin => Some(sin),
            WaveformKind::Square => Some(square),
            WaveformKind::Triangle => Some(triangle),
            WaveformKind::MattiasCustom => Some(mattias_custom),
            WaveformKind::NullWave => Some(null_wave),
            WaveformKind::FrequencyScan => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedWaveform {
    pub kind: WaveformKind,
    /// Commanded voltage per output tick, padding included.
    pub samples: Array1<f64>,
    /// Uniform grid over `[0, total_time]`, one entry per sample.
    pub time_axis: Array1<f64>,
    /// Length of the active pulse after sample-count rounding.
    pub active_duration: f64,
}

impl SynthesizedWaveform {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn total_time(&self) -> f64 {
        self.time_axis.last().copied().unwrap_or(0.)
    }
}

fn end_time(time_axis: &Array1<f64>) -> Result<f64> {
    match time_axis.last() {
        Some(&t_end) if t_end > 0. => Ok(t_end),
        _ => Err(Error::InvalidSettings(
            "Shape needs a time axis ending after t = 0".to_string(),
        )),
    }
}

/// Half period of a rectified sine, `-A |sin(pi t / t_end)|`.
pub fn sin(time_axis: &Array1<f64>, amplitude: f64) -> Result<Array1<f64>> {
    let t_end = end_time(time_axis)?;
    Ok(time_axis.mapv(|t| -amplitude * (PI * t / t_end).sin().abs()))
}

/// Smooth ramp from 0 down to `-A` along half a cosine period.
pub fn cos(time_axis: &Array1<f64>, amplitude: f64) -> Result<Array1<f64>> {
    let t_end = end_time(time_axis)?;
    let scale_factor = amplitude * 0.5;
    Ok(time_axis.mapv(|t| -scale_factor * (PI * t / t_end).cos() - scale_factor))
}

pub fn square(time_axis: &Array1<f64>, amplitude: f64) -> Result<Array1<f64>> {
    Ok(Array1::from_elem(time_axis.len(), -amplitude))
}

/// Periodic sawtooth with rising fraction `width`, in `[-1, 1]`.
pub fn sawtooth(t: f64, width: f64) -> f64 {
    let tmod = t.rem_euclid(2. * PI);
    if tmod < width * 2. * PI {
        tmod / (PI * width) - 1.
    } else {
        (PI * (width + 1.) - tmod) / (PI * (1. - width))
    }
}

/// One symmetric triangle over the whole axis, peaking at `-A` halfway.
pub fn triangle(time_axis: &Array1<f64>, amplitude: f64) -> Result<Array1<f64>> {
    let phase = linspace(0., 1., time_axis.len());
    Ok(phase.mapv(|p| -amplitude * 0.5 * (sawtooth(2. * PI * p, 0.5) + 1.)))
}

/// Dark reading: no light at all.
pub fn null_wave(time_axis: &Array1<f64>, _amplitude: f64) -> Result<Array1<f64>> {
    Ok(Array1::zeros(time_axis.len()))
}

/// Inverse-power decay `C/t` spliced with a quartic cap near the midpoint, then mirrored.
///
/// The splice sits at `(0.5 - 0.01)` of the array length; the decay constants are pinned to the
/// time value at `0.01` of the array length, which therefore has to be non-zero.
pub fn mattias_custom(time_axis: &Array1<f64>, amplitude: f64) -> Result<Array1<f64>> {
    let fraction = 0.01;
    let n = time_axis.len() as f64;
    let t_shift = (n * fraction).floor() as usize;
    let t0_index = (n * (0.5 - fraction)).floor() as usize;
    let midpoint = time_axis.len() / 2;
    if time_axis.len() < 2 || !(time_axis[t_shift] > 0.) {
        return Err(Error::InvalidSettings(format!(
            "MattiasCustom needs the sample at index {} to lie after t = 0, got {} samples",
            t_shift,
            time_axis.len()
        )));
    }
    let t_halfway = time_axis[midpoint];
    let t_pin = time_axis[t_shift];

    let b = -amplitude * t_pin.powi(-4) / 5.;
    let c = 4. / 5. * amplitude * t_pin;

    let half: Vec<f64> = (0..midpoint)
        .map(|i| {
            let dt = time_axis[i] - t_halfway;
            if i < t0_index {
                -c / dt
            } else {
                b * dt.powi(4) + amplitude
            }
        })
        .collect();

    Ok(half
        .iter()
        .chain(half.iter().rev())
        .map(|v| -v)
        .collect())
}

/// Log-spaced sine bursts, highest frequency first, after a 10 ms flat lead-in.
///
/// Returns `(samples, time)`; the time grid is non-uniform (every burst restarts its own grid at
/// the end of the previous one). `log_start` and `log_stop` are log10 frequency bounds.
pub fn frequency_scan(
    sample_rate: f64,
    amplitude: f64,
    log_start: f64,
    log_stop: f64,
    count: usize,
) -> Result<(Array1<f64>, Array1<f64>)> {
    let amplitude_fraction = 0.025;
    let initial_time_delay = 0.01;

    if count == 0 {
        return Err(Error::InvalidSettings(
            "FrequencyScan needs a duration of at least 1 (one frequency per second)".to_string(),
        ));
    }

    let lead = (sample_rate * 0.1).floor() as usize;
    let mut voltage = vec![0.; lead];
    let mut time = linspace(0., initial_time_delay, lead).to_vec();
    let mut t0 = time.last().copied().unwrap_or(0.);

    for freq in logspace(log_start, log_stop, count).iter().rev() {
        let t = arange(0., 10. / freq, 1. / sample_rate);
        voltage.extend(
            t.iter()
                .map(|&t| amplitude_fraction * amplitude * (2. * PI * freq * t).sin()),
        );
        time.extend(t.iter().map(|&t| t + t0));
        t0 += t.last().copied().unwrap_or(0.);
    }

    let samples = Array1::from(voltage).mapv(|v| -v - amplitude);
    Ok((samples, Array1::from(time)))
}

/// Shrinks `curve` so its peak magnitude drops by `threshold`, then shifts it down by `threshold`.
///
/// An all-zero curve is only shifted.
pub fn scale_to_threshold(mut curve: Array1<f64>, threshold: f64) -> Array1<f64> {
    let max_voltage = curve.iter().fold(0f64, |acc, v| acc.max(v.abs()));
    if max_voltage > 0. {
        let scale_factor = (max_voltage - threshold) / max_voltage;
        curve.mapv_inplace(|v| v * scale_factor);
    }
    curve.mapv_inplace(|v| v - threshold);
    curve
}

pub fn synthesize(settings: &ExperimentSettings) -> Result<SynthesizedWaveform> {
    let rate = settings.sample_rate();
    let threshold = settings.voltage_threshold();
    let n_before = round_samples(rate, settings.offset_before() / 1000.);
    let n_after = round_samples(rate, settings.offset_after() / 1000.);

    let (curve, active_duration) = match settings.waveform().generator() {
        None => {
            let (voltage, time) = frequency_scan(
                rate,
                settings.amplitude(),
                settings.offset_before(),
                settings.offset_after(),
                settings.duration().floor() as usize,
            )?;
            let active_duration = time.last().copied().unwrap_or(0.);
            (voltage.mapv(|v| v - threshold), active_duration)
        }
        Some(shape) => {
            let n_active = round_samples(rate, settings.duration());
            if n_active < 2 {
                return Err(Error::InvalidSettings(format!(
                    "A {} s pulse at {} Hz spans {} sample(s), at least 2 are needed",
                    settings.duration(),
                    rate,
                    n_active
                )));
            }
            let time_axis = linspace(0., settings.duration(), n_active);
            let raw = shape(&time_axis, settings.amplitude())?;
            let active_duration = time_axis[n_active - 1];
            (scale_to_threshold(raw, threshold), active_duration)
        }
    };

    let total_len = n_before + curve.len() + n_after;
    let mut samples = Array1::zeros(total_len);
    samples
        .slice_mut(s![n_before..n_before + curve.len()])
        .assign(&curve);

    let total_time =
        settings.offset_before() / 1000. + settings.offset_after() / 1000. + active_duration;
    let time_axis = linspace(0., total_time, total_len);

    log::debug!(
        "Synthesized {} waveform: {} samples ({} before, {} after) over {} s",
        settings.waveform(),
        total_len,
        n_before,
        n_after,
        total_time
    );

    Ok(SynthesizedWaveform {
        kind: settings.waveform(),
        samples,
        time_axis,
        active_duration,
    })
}

#[cfg(test)]
mod test {
    use ndarray::{arr1, Array1};

    use crate::config::RigConfig;
    use crate::error::Error;
    use crate::settings::*;
    use crate::utils::linspace;
    use crate::waveform::*;

    fn assert_close(a: f64, b: f64, tol: f64) {
        assert!((a - b).abs() <= tol, "{} != {} (tol {})", a, b, tol);
    }

    fn settings_for(kind: WaveformKind) -> ExperimentSettings {
        let params = SettingsParams {
            waveform: kind,
            ..Default::default()
        };
        ExperimentSettings::new(params, &RigConfig::default()).unwrap()
    }

    #[test]
    fn scale_to_threshold_fixture() {
        let scaled = scale_to_threshold(Array1::from_elem(10, 6.), 0.08152173913043478);
        for v in scaled.iter() {
            assert_close(*v, 5.83695652174, 1e-11);
        }
    }

    #[test]
    fn scale_to_threshold_zero_curve_only_shifts() {
        let scaled = scale_to_threshold(Array1::zeros(4), 0.5);
        assert_eq!(scaled.to_vec(), vec![-0.5; 4]);
    }

    #[test]
    fn sin_matches_formula() {
        let t = linspace(0., 1., 1200);
        let curve = sin(&t, 0.5).unwrap();
        for (v, t) in curve.iter().zip(t.iter()) {
            assert_eq!(*v, -0.5 * (PI * t).sin().abs());
        }
    }

    #[test]
    fn square_and_triangle_fixtures() {
        let curve = square(&linspace(0., 5., 5), -6.).unwrap();
        assert_eq!(curve.to_vec(), vec![6.; 5]);

        let curve = triangle(&arr1(&[0., 1., 2., 3., 4.]), -4.).unwrap();
        let expected = [0., 2., 4., 2., 0.];
        for (v, e) in curve.iter().zip(expected) {
            assert_close(*v, e, 1e-12);
        }
    }

    #[test]
    fn cos_ramps_to_amplitude() {
        let curve = cos(&linspace(0., 1., 101), 2.).unwrap();
        assert_close(curve[0], -2., 1e-12);
        assert_close(curve[50], -1., 1e-12);
        assert_close(curve[100], 0., 1e-12);
    }

    #[test]
    fn mattias_custom_is_symmetric() {
        let t = linspace(0., 1., 1200);
        let curve = mattias_custom(&t, 0.5).unwrap();
        assert_eq!(curve.len(), 1200);
        for i in 0..600 {
            assert_eq!(curve[i], curve[1199 - i]);
        }
        // the quartic cap peaks at the amplitude right before the midpoint
        assert_close(curve[599], -(0.5 - 0.5 / 5. * (t[599] - t[600]).powi(4) / t[12].powi(4)), 1e-12);

        let odd = mattias_custom(&linspace(0., 1., 1201), 0.5).unwrap();
        assert_eq!(odd.len(), 1200);
    }

    #[test]
    fn mattias_custom_needs_enough_samples() {
        let result = mattias_custom(&linspace(0., 1., 50), 0.5);
        assert!(matches!(result, Err(Error::InvalidSettings(_))));
    }

    #[test]
    fn reference_pulse_layout() {
        let waveform = synthesize(&settings_for(WaveformKind::Sin)).unwrap();
        assert_eq!(waveform.len(), 1213);
        assert_eq!(waveform.samples[0], 0.);
        assert!(waveform.samples.slice(s![1..1201]).iter().any(|v| *v != 0.));
        assert!(waveform.samples.slice(s![1201..]).iter().all(|v| *v == 0.));
        assert!(waveform.samples.iter().all(|v| *v < 150.));
        assert_eq!(waveform.active_duration, 1.);
    }

    #[test]
    fn threshold_bounds_active_curve() {
        for kind in [
            WaveformKind::Sin,
            WaveformKind::Cos,
            WaveformKind::Square,
            WaveformKind::Triangle,
            WaveformKind::MattiasCustom,
        ] {
            let settings = settings_for(kind);
            let waveform = synthesize(&settings).unwrap();
            let active = waveform.samples.slice(s![1..1201]);
            let min = active.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = active.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            // the grid may miss the exact peak, never overshoot it
            assert!(min >= -settings.amplitude() - 1e-12, "{}", kind);
            assert_close(min, -settings.amplitude(), 1e-3);
            assert!(max <= -settings.voltage_threshold() + 1e-12, "{}", kind);
        }
    }

    #[test]
    fn null_wave_is_shift_only() {
        let settings = settings_for(WaveformKind::NullWave);
        let waveform = synthesize(&settings).unwrap();
        assert!(waveform
            .samples
            .slice(s![1..1201])
            .iter()
            .all(|v| *v == -settings.voltage_threshold()));
    }

    #[test]
    fn shape_invariant_for_every_kind() {
        for kind in WaveformKind::ALL {
            let waveform = synthesize(&settings_for(kind)).unwrap();
            assert_eq!(waveform.samples.len(), waveform.time_axis.len());
            assert_eq!(waveform.time_axis[0], 0.);
            assert!(waveform
                .time_axis
                .windows(2)
                .into_iter()
                .all(|w| w[1] >= w[0]));
        }
    }

    #[test]
    fn frequency_scan_layout() {
        // one frequency (10 Hz) at 1.2 kHz: 120 lead-in samples plus a 1 s burst
        let (voltage, time) = frequency_scan(1200., 1., 1., 1., 1).unwrap();
        assert_eq!(voltage.len(), 120 + 1200);
        assert_eq!(time.len(), voltage.len());
        assert!(voltage.iter().take(120).all(|v| *v == -1.));
        assert_close(voltage[120 + 30], -1. - 0.025, 1e-12);
        assert!(time.windows(2).into_iter().all(|w| w[1] >= w[0]));

        let (_, time) = frequency_scan(1200., 1., 1., 2., 2).unwrap();
        // 100 Hz burst first (120 samples), then 10 Hz (1200 samples)
        assert_eq!(time.len(), 120 + 120 + 1200);

        assert!(matches!(
            frequency_scan(1200., 1., 1., 2., 0),
            Err(Error::InvalidSettings(_))
        ));
    }

    #[test]
    fn frequency_scan_is_shifted_and_padded() {
        let params = SettingsParams {
            waveform: WaveformKind::FrequencyScan,
            offset_before: 1.,
            offset_after: 2.,
            duration: 2.,
            ..Default::default()
        };
        let settings = ExperimentSettings::new(params, &RigConfig::default()).unwrap();
        let waveform = synthesize(&settings).unwrap();
        let threshold = settings.voltage_threshold();
        assert_eq!(waveform.samples[0], 0.);
        assert_close(waveform.samples[1], -settings.amplitude() - threshold, 1e-12);
        assert_eq!(waveform.len(), 1 + 120 + 120 + 1200 + 2);
        assert!(waveform.time_axis.windows(2).into_iter().all(|w| w[1] > w[0]));
    }

    #[test]
    fn too_short_pulse_rejected() {
        let params = SettingsParams {
            duration: 1e-4,
            ..Default::default()
        };
        let settings = ExperimentSettings::new(params, &RigConfig::default()).unwrap();
        assert!(matches!(synthesize(&settings), Err(Error::InvalidSettings(_))));
    }
}
