//! FIFO queue of synthesized pulses and the loop that plays, averages and reduces them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::Array1;
use pvcompiler_backend::{
    synthesize, ExperimentSettings, RigConfig, SettingsDict, SynthesizedWaveform, TickTimer,
    WaveformKind,
};

use crate::daq::{self, HardwareChannel};
use crate::error::{Error, Result};
use crate::record::{MeasurementRecord, PcCalibration};
use crate::session::{acquire, AcquisitionRequest};

/// Cooperative stop flag, checked between hardware cycles only.
///
/// A cancel applies to the measurement call in progress, or to the next one if nothing is
/// running, and is consumed when that call returns.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once [`cancel`](Self::cancel) was called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Incremental mean of equally sized buffers.
///
/// Each new buffer enters with weight 1 against the accumulated mean weighted by the number of
/// buffers already folded in.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningAverage {
    mean: Array1<f64>,
    count: usize,
}

impl RunningAverage {
    pub fn new(first: Array1<f64>) -> Self {
        Self {
            mean: first,
            count: 1,
        }
    }

    pub fn push(&mut self, buffer: &Array1<f64>) -> Result<()> {
        if buffer.len() != self.mean.len() {
            return Err(Error::LayoutMismatch {
                expected: self.mean.len(),
                actual: buffer.len(),
            });
        }
        let weight = self.count as f64;
        self.mean
            .zip_mut_with(buffer, |mean, new| *mean = (*new + *mean * weight) / (1. + weight));
        self.count += 1;
        Ok(())
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn into_mean(self) -> Array1<f64> {
        self.mean
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub waveform: SynthesizedWaveform,
    pub settings: ExperimentSettings,
}

pub struct MeasurementAggregator<H: HardwareChannel> {
    hw: H,
    config: RigConfig,
    queue: VecDeque<QueueEntry>,
    cancel: CancelToken,
    pc_calibration: Option<PcCalibration>,
}

impl<H: HardwareChannel> MeasurementAggregator<H> {
    pub fn new(hw: H, config: RigConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            hw,
            config,
            queue: VecDeque::new(),
            cancel: CancelToken::new(),
            pc_calibration: None,
        })
    }

    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Result of the last [`pc_calibration_measurement`](Self::pc_calibration_measurement).
    pub fn pc_calibration(&self) -> Option<PcCalibration> {
        self.pc_calibration
    }

    pub fn reset_device(&mut self) -> Result<()> {
        daq::reset_device(&mut self.hw, &self.config.device_name)
    }

    pub fn add_to_queue(&mut self, waveform: SynthesizedWaveform, settings: ExperimentSettings) {
        log::debug!(
            "Queued {} ({} samples), {} in queue",
            settings.waveform(),
            waveform.len(),
            self.queue.len() + 1
        );
        self.queue.push_back(QueueEntry { waveform, settings });
    }

    /// Synthesizes the pulse described by `settings` and queues it.
    pub fn enqueue(&mut self, settings: ExperimentSettings) -> Result<()> {
        let waveform = synthesize(&settings)?;
        self.add_to_queue(waveform, settings);
        Ok(())
    }

    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    pub fn is_queue_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Queued settings in playback order.
    pub fn settings_as_list(&self) -> Vec<SettingsDict> {
        self.queue.iter().map(|entry| entry.settings.as_dict()).collect()
    }

    fn consume_cancel<T>(&self, result: Result<T>) -> Result<T> {
        if self.cancel.is_cancelled() {
            log::debug!("Cancel request consumed");
            self.cancel.reset();
        }
        result
    }

    /// Plays the head of the queue `averaging` times and returns the reduced record. Once playback
    /// starts the entry is consumed whether or not the measurement succeeds; a cancel pending
    /// beforehand leaves the queue untouched.
    pub fn single_measurement(&mut self) -> Result<MeasurementRecord> {
        let result = self.cancel.check().and_then(|_| self.measure_next());
        self.consume_cancel(result)
    }

    fn measure_next(&mut self) -> Result<MeasurementRecord> {
        let entry = self.queue.pop_front().ok_or(Error::EmptyQueue)?;
        let settings = &entry.settings;
        let averaging = settings.averaging();
        if averaging < 1 {
            return Err(Error::Configuration(format!(
                "Averaging must be at least 1, got {}",
                averaging
            )));
        }
        let mut timer = TickTimer::new();
        let request = AcquisitionRequest {
            waveform: entry.waveform.samples.view(),
            output_channel: settings.channel(),
            total_time: entry.waveform.total_time(),
            input_voltage_range: self.config.input_voltage_range,
            output_voltage_range: self.config.output_voltage_range,
            input_sample_rate: settings.sample_rate(),
            output_sample_rate: settings.sample_rate(),
        };

        let first = acquire(&mut self.hw, &self.config, request.clone())?;
        let channel_count = first.channel_count;
        let mut time = first.elapsed_time;
        let mut average = RunningAverage::new(first.raw_buffer);
        for _ in 1..averaging {
            self.cancel.check()?;
            let next = acquire(&mut self.hw, &self.config, request.clone())?;
            average.push(&next.raw_buffer)?;
            time = next.elapsed_time;
        }
        timer.tick_print("averaged acquisition");

        MeasurementRecord::from_blocked(time.view(), average.mean().view(), channel_count)
    }

    /// Drains the queue, handing each record to `on_record` with its position in the series as it
    /// completes. Stops at the first failure; records already handed out stay valid.
    pub fn series_measurement_with<F>(&mut self, on_record: F) -> Result<usize>
    where
        F: FnMut(usize, MeasurementRecord),
    {
        let result = self.drain_queue(on_record);
        self.consume_cancel(result)
    }

    fn drain_queue<F>(&mut self, mut on_record: F) -> Result<usize>
    where
        F: FnMut(usize, MeasurementRecord),
    {
        let total = self.queue.len();
        let mut timer = TickTimer::new();
        let mut done = 0;
        while !self.queue.is_empty() {
            self.cancel.check()?;
            let record = self.measure_next()?;
            log::info!(
                "Measurement {}/{} done: {} rows",
                done + 1,
                total,
                record.rows()
            );
            on_record(done, record);
            done += 1;
        }
        log::info!(
            "Series finished: {} measurement(s) in {:.1} ms",
            done,
            timer.tick()
        );
        Ok(done)
    }

    /// Like [`series_measurement`](Self::series_measurement) but pushes into `records`, which keeps
    /// every completed record if the series fails part way.
    pub fn series_measurement_into(&mut self, records: &mut Vec<MeasurementRecord>) -> Result<()> {
        self.series_measurement_with(|_, record| records.push(record))
            .map(|_| ())
    }

    pub fn series_measurement(&mut self) -> Result<Vec<MeasurementRecord>> {
        let mut records = Vec::with_capacity(self.queue.len());
        self.series_measurement_into(&mut records)?;
        Ok(records)
    }

    /// Plays a dark pulse with the timing of `settings` ahead of anything already queued and
    /// derives the PC baseline from it.
    pub fn pc_calibration_measurement(
        &mut self,
        settings: &ExperimentSettings,
    ) -> Result<(MeasurementRecord, PcCalibration)> {
        let result = self.cancel.check().and_then(|_| self.calibrate(settings));
        self.consume_cancel(result)
    }

    fn calibrate(
        &mut self,
        settings: &ExperimentSettings,
    ) -> Result<(MeasurementRecord, PcCalibration)> {
        let mut dark = settings.clone();
        dark.set_waveform(WaveformKind::NullWave);
        let waveform = synthesize(&dark)?;
        self.queue.push_front(QueueEntry {
            waveform,
            settings: dark,
        });
        let record = self.measure_next()?;
        let calibration = PcCalibration::from_record(&record).ok_or_else(|| {
            Error::Configuration("Calibration record has no samples".to_string())
        })?;
        log::info!(
            "PC calibration: mean {:.6} V, std {:.6} V",
            calibration.mean,
            calibration.std
        );
        self.pc_calibration = Some(calibration);
        Ok((record, calibration))
    }
}

#[cfg(test)]
mod test {
    use ndarray::{arr1, Array1};
    use pvcompiler_backend::{ExperimentSettings, RigConfig, SettingsParams, WaveformKind};

    use crate::aggregator::*;
    use crate::error::Error;
    use crate::record::InputChannel;
    use crate::sim::{SimOp, SimulatedDaq};

    fn assert_close(a: f64, b: f64, tol: f64) {
        assert!((a - b).abs() <= tol, "{} != {} (tol {})", a, b, tol);
    }

    /// 10 ms Cos pulse at 1 kHz without padding: 10 samples per channel.
    fn short_settings(config: &RigConfig, averaging: usize) -> ExperimentSettings {
        ExperimentSettings::new(
            SettingsParams {
                waveform: WaveformKind::Cos,
                duration: 0.01,
                offset_before: 0.,
                offset_after: 0.,
                sample_rate: 1000.,
                averaging,
                ..SettingsParams::default()
            },
            config,
        )
        .unwrap()
    }

    fn aggregator() -> MeasurementAggregator<SimulatedDaq> {
        MeasurementAggregator::new(SimulatedDaq::default(), RigConfig::default()).unwrap()
    }

    #[test]
    fn running_average_weights() {
        let mut average = RunningAverage::new(arr1(&[1., 2.]));
        average.push(&arr1(&[3., 4.])).unwrap();
        assert_eq!(average.mean(), &arr1(&[2., 3.]));
        average.push(&arr1(&[8., 9.])).unwrap();
        assert_eq!(average.count(), 3);
        assert_eq!(average.mean(), &arr1(&[4., 5.]));
        assert!(matches!(
            average.push(&arr1(&[1.])),
            Err(Error::LayoutMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn empty_queue() {
        let mut agg = aggregator();
        assert!(agg.is_queue_empty());
        assert!(matches!(agg.single_measurement(), Err(Error::EmptyQueue)));
        assert!(agg.series_measurement().unwrap().is_empty());
        assert!(agg.hardware().calls().is_empty());
    }

    #[test]
    fn averaging_over_scripted_reads() {
        for n in [1usize, 2, 5] {
            let mut agg = aggregator();
            let settings = short_settings(agg.config(), n);
            agg.enqueue(settings).unwrap();
            let mut expected = Array1::zeros(30);
            for i in 0..n {
                let buffer = Array1::from_iter((0..30).map(|j| (i * 30 + j) as f64 * 0.1));
                expected = expected + &buffer / n as f64;
                agg.hardware_mut().push_read(buffer.to_vec());
            }
            let record = agg.single_measurement().unwrap();
            assert_eq!(record.rows(), 10);
            let ops = agg.hardware().calls().iter().filter(|(op, _)| *op == SimOp::Read);
            assert_eq!(ops.count(), n);
            for (col, chan) in InputChannel::ALL.iter().enumerate() {
                for row in 0..10 {
                    assert_close(record.channel(*chan)[row], expected[col * 10 + row], 1e-9);
                }
            }
            assert_eq!(agg.hardware().open_tasks(), 0);
        }
    }

    #[test]
    fn loop_back_lands_in_blocked_columns() {
        let mut agg = aggregator();
        let settings = short_settings(agg.config(), 1);
        agg.enqueue(settings).unwrap();
        let record = agg.single_measurement().unwrap();

        assert_eq!(record.rows(), 10);
        assert_eq!(record.time()[0], 0.);
        assert_close(record.time()[9], 0.01, 1e-12);
        let reference = record.channel(InputChannel::Reference);
        let pc = record.channel(InputChannel::Pc);
        let pl = record.channel(InputChannel::Pl);
        for row in 0..10 {
            assert_eq!(pc[row], reference[row] * 0.5);
            assert_eq!(pl[row], reference[row] * 0.25);
        }
        assert!(reference.iter().take(9).all(|v| *v < 0.));
        assert_eq!(reference[9], 0.);
    }

    #[test]
    fn queue_is_fifo_and_consumed_on_failure() {
        let mut agg = aggregator();
        let config = agg.config().clone();
        let first = short_settings(&config, 1);
        let mut second = short_settings(&config, 1);
        second.set_waveform(WaveformKind::Square);
        agg.enqueue(first).unwrap();
        agg.enqueue(second).unwrap();
        assert_eq!(agg.queue_len(), 2);
        let listed = agg.settings_as_list();
        assert_eq!(listed[0]["waveform"], "Cos");
        assert_eq!(listed[1]["waveform"], "Square");

        agg.hardware_mut().fail_next(SimOp::Start, -200479);
        assert!(matches!(
            agg.single_measurement(),
            Err(Error::Hardware { code: -200479, .. })
        ));
        assert_eq!(agg.queue_len(), 1);
        assert_eq!(agg.settings_as_list()[0]["waveform"], "Square");
        assert_eq!(agg.hardware().open_tasks(), 0);

        agg.clear_queue();
        assert!(agg.is_queue_empty());
    }

    #[test]
    fn series_runs_in_queue_order() {
        let mut agg = aggregator();
        let config = agg.config().clone();
        for _ in 0..3 {
            agg.enqueue(short_settings(&config, 1)).unwrap();
        }
        agg.hardware_mut().push_read(vec![1.; 30]);
        agg.hardware_mut().push_read(vec![2.; 30]);
        agg.hardware_mut().push_read(vec![3.; 30]);
        let records = agg.series_measurement().unwrap();
        assert_eq!(records.len(), 3);
        for (i, record) in records.iter().enumerate() {
            assert!(record.channel(InputChannel::Pl).iter().all(|v| *v == (i + 1) as f64));
        }

        for _ in 0..3 {
            agg.enqueue(short_settings(&config, 1)).unwrap();
        }
        let mut partial = Vec::new();
        agg.hardware_mut().fail_next(SimOp::Read, -200279);
        agg.hardware_mut().push_read(vec![5.; 30]);
        // the failed entry is dropped, the scripted buffer is left for the next read
        assert!(agg.single_measurement().is_err());
        agg.series_measurement_into(&mut partial).unwrap();
        assert_eq!(partial.len(), 2);
        assert!(partial[0].channel(InputChannel::Reference).iter().all(|v| *v == 5.));
    }

    #[test]
    fn series_failure_is_not_swallowed() {
        let mut agg = aggregator();
        let config = agg.config().clone();
        agg.enqueue(short_settings(&config, 1)).unwrap();
        agg.enqueue(short_settings(&config, 2)).unwrap();
        agg.enqueue(short_settings(&config, 1)).unwrap();
        let mut records = Vec::new();
        agg.hardware_mut().push_read(vec![1.; 30]);
        agg.hardware_mut().push_read(vec![1.; 30]);
        // the second cycle of the second measurement comes back short
        agg.hardware_mut().push_read(vec![1.; 29]);
        let err = agg.series_measurement_into(&mut records).unwrap_err();
        assert!(matches!(
            err,
            Error::LayoutMismatch {
                expected: 30,
                actual: 27
            }
        ));
        assert_eq!(records.len(), 1);
        assert_eq!(agg.queue_len(), 1);
        assert_eq!(agg.hardware().open_tasks(), 0);
    }

    #[test]
    fn calibration_plays_dark_pulse_first() {
        let mut agg = aggregator();
        let config = agg.config().clone();
        agg.enqueue(short_settings(&config, 1)).unwrap();
        let mut blocked = vec![0.; 30];
        for (i, v) in blocked[10..20].iter_mut().enumerate() {
            *v = if i % 2 == 0 { 1. } else { 3. };
        }
        agg.hardware_mut().push_read(blocked);

        let (record, calibration) = agg
            .pc_calibration_measurement(&short_settings(&config, 1))
            .unwrap();
        assert_eq!(record.rows(), 10);
        assert_close(calibration.mean, 2., 1e-12);
        assert_close(calibration.std, 1., 1e-12);
        assert_eq!(agg.pc_calibration(), Some(calibration));
        // the queued pulse is still there
        assert_eq!(agg.queue_len(), 1);
        assert_eq!(agg.settings_as_list()[0]["waveform"], "Cos");
    }

    #[test]
    fn dark_pulse_loop_back_is_zero() {
        let mut agg = aggregator();
        let config = agg.config().clone();
        let mut settings = short_settings(&config, 1);
        settings.set_voltage_threshold(0.);
        let (record, calibration) = agg.pc_calibration_measurement(&settings).unwrap();
        assert!(record.channel(InputChannel::Pc).iter().all(|v| *v == 0.));
        assert_eq!(calibration.mean, 0.);
        assert_eq!(calibration.std, 0.);
    }

    #[test]
    fn cancel_between_averaging_cycles() {
        let mut agg = aggregator();
        let config = agg.config().clone();
        agg.enqueue(short_settings(&config, 3)).unwrap();
        agg.enqueue(short_settings(&config, 1)).unwrap();
        let token = agg.cancel_token();
        token.cancel();
        assert!(matches!(agg.measure_next(), Err(Error::Cancelled)));
        assert_eq!(agg.queue_len(), 1);
        assert_eq!(agg.hardware().open_tasks(), 0);
        let reads = agg.hardware().calls().iter().filter(|(op, _)| *op == SimOp::Read);
        assert_eq!(reads.count(), 1);
    }

    #[test]
    fn pending_cancel_stops_the_next_call_once() {
        let mut agg = aggregator();
        let config = agg.config().clone();
        agg.enqueue(short_settings(&config, 1)).unwrap();
        agg.enqueue(short_settings(&config, 1)).unwrap();
        let token = agg.cancel_token();

        token.cancel();
        assert!(matches!(agg.single_measurement(), Err(Error::Cancelled)));
        assert!(!token.is_cancelled());
        assert_eq!(agg.queue_len(), 2);
        assert!(agg.hardware().calls().is_empty());

        token.cancel();
        assert!(matches!(agg.series_measurement(), Err(Error::Cancelled)));
        assert!(!token.is_cancelled());
        assert_eq!(agg.queue_len(), 2);

        token.cancel();
        assert!(matches!(
            agg.pc_calibration_measurement(&short_settings(&config, 1)),
            Err(Error::Cancelled)
        ));
        assert_eq!(agg.queue_len(), 2);
        assert_eq!(agg.pc_calibration(), None);

        assert_eq!(agg.series_measurement().unwrap().len(), 2);
    }
}
