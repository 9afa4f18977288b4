use pvcompiler_backend::{ExperimentSettings, RigConfig, SettingsParams, TickTimer, WaveformKind};
use pvexpctrl_backend::{HardwareChannel, InputChannel, MeasurementAggregator, Result};

fn run<H: HardwareChannel>(hw: H, config: RigConfig) -> Result<()> {
    let mut aggregator = MeasurementAggregator::new(hw, config)?;
    aggregator.reset_device()?;

    let reference = ExperimentSettings::reference(aggregator.config())?;
    let (_, calibration) = aggregator.pc_calibration_measurement(&reference)?;
    let summary = serde_json::to_string_pretty(&calibration.as_dict())
        .map_err(pvcompiler_backend::Error::from)?;
    println!("{}", summary);

    for waveform in [
        WaveformKind::Sin,
        WaveformKind::Cos,
        WaveformKind::Square,
        WaveformKind::Triangle,
    ] {
        let params = SettingsParams {
            waveform,
            averaging: 2,
            ..Default::default()
        };
        let settings = ExperimentSettings::new(params, aggregator.config())?;
        aggregator.enqueue(settings)?;
    }

    let mut timer = TickTimer::new();
    let records = aggregator.series_measurement()?;
    timer.tick_print("series");
    for (i, record) in records.iter().enumerate() {
        let peak = |chan: InputChannel| {
            record
                .channel(chan)
                .iter()
                .cloned()
                .fold(0f64, |acc, v| acc.max(v.abs()))
        };
        log::info!(
            "#{}: {} rows, peak |Reference| {:.4} V, |PC| {:.4} V, |PL| {:.4} V",
            i,
            record.rows(),
            peak(InputChannel::Reference),
            peak(InputChannel::Pc),
            peak(InputChannel::Pl)
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => RigConfig::from_json_file(path)?,
        None => RigConfig::default(),
    };

    #[cfg(feature = "nidaqmx")]
    return run(pvexpctrl_backend::NiDaq::new(), config);

    #[cfg(not(feature = "nidaqmx"))]
    run(pvexpctrl_backend::SimulatedDaq::new(config.channel_count), config)
}
