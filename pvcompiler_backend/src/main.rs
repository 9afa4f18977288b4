use pvcompiler_backend::*;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => RigConfig::from_json_file(path)?,
        None => RigConfig::default(),
    };

    let mut timer = TickTimer::new();
    for kind in WaveformKind::ALL {
        let params = SettingsParams {
            waveform: kind,
            ..Default::default()
        };
        let settings = ExperimentSettings::new(params, &config)?;
        let waveform = synthesize(&settings)?;
        let min = waveform.samples.iter().cloned().fold(f64::INFINITY, f64::min);
        log::info!(
            "{}: {} samples over {:.4} s, min {:.4} V, threshold {:.4} V",
            kind,
            waveform.len(),
            waveform.total_time(),
            min,
            settings.voltage_threshold()
        );
        timer.tick_print(&format!("{} synthesis", kind));
    }

    let reference = ExperimentSettings::reference(&config)?;
    println!("{}", serde_json::to_string_pretty(&reference.metadata())?);
    Ok(())
}
