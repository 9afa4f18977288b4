use pvcompiler_backend::*;

fn settings(kind: WaveformKind, channel: OutputChannel, amplitude: f64) -> ExperimentSettings {
    let params = SettingsParams {
        waveform: kind,
        channel,
        amplitude,
        ..Default::default()
    };
    ExperimentSettings::new(params, &RigConfig::default()).unwrap()
}

#[test]
fn settings_file_round_trip() {
    let config = RigConfig::default();
    let queue = vec![
        settings(WaveformKind::Cos, OutputChannel::High, 0.5),
        settings(WaveformKind::Triangle, OutputChannel::Low, 15.),
        ExperimentSettings::new(
            SettingsParams {
                waveform: WaveformKind::FrequencyScan,
                duration: 3.,
                offset_before: 1.,
                offset_after: 3.,
                sample_rate: 5e3,
                averaging: 4,
                binning: 2,
                ..Default::default()
            },
            &config,
        )
        .unwrap(),
    ];

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.json");
    save_settings_list(&path, &queue).unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    // keys are written sorted
    let averaging = contents.find("\"averaging\"").unwrap();
    let waveform = contents.find("\"waveform\"").unwrap();
    assert!(averaging < waveform);

    let loaded = load_settings_list(&path, &config).unwrap();
    assert_eq!(loaded, queue);
    assert_eq!(loaded[1].amplitude(), 10.);
}

#[test]
fn loading_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = load_settings_list(dir.path().join("absent.json"), &RigConfig::default());
    assert!(matches!(result, Err(Error::Io(_))));
}

#[test]
fn rig_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rig.json");
    let mut config = RigConfig::default();
    config.device_name = "Dev1".to_string();
    config.max_input_sample_rate = 2e3;
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    let loaded = RigConfig::from_json_file(&path).unwrap();
    assert_eq!(loaded, config);

    let params = SettingsParams {
        sample_rate: 1e4,
        ..Default::default()
    };
    let settings = ExperimentSettings::new(params, &loaded).unwrap();
    assert_eq!(settings.sample_rate(), 2e3);
    let waveform = synthesize(&settings).unwrap();
    // 2 + 2000 + 20 samples at 2 kHz
    assert_eq!(waveform.len(), 2022);
}

#[test]
fn every_kind_synthesizes_on_both_channels() {
    for channel in OutputChannel::ALL {
        for kind in WaveformKind::ALL {
            let settings = settings(kind, channel, 1.);
            let waveform = synthesize(&settings).unwrap();
            assert_eq!(waveform.kind, kind);
            assert_eq!(waveform.samples.len(), waveform.time_axis.len());
            let expected_total = settings.offset_before() / 1000.
                + settings.offset_after() / 1000.
                + waveform.active_duration;
            assert!((waveform.total_time() - expected_total).abs() < 1e-12);
            // padding is always silent
            assert_eq!(waveform.samples[0], 0.);
            assert_eq!(waveform.samples[waveform.len() - 1], 0.);
            // frequency-scan bursts ride 2.5% of the amplitude on top of the baseline
            let floor = -1.025 * settings.amplitude() - settings.voltage_threshold();
            assert!(waveform.samples.iter().all(|v| *v <= 0. && *v >= floor - 1e-12));
        }
    }
}
