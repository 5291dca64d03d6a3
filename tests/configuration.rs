//! Loading and validating measurement files from disk.

use semi_daq::config::{ConnectionConfig, MeasurementKind, Settings};
use semi_daq::error::DaqError;
use semi_daq::measurement::{create_measurement, SweepPlan};
use std::path::PathBuf;
use tempfile::TempDir;

fn shipped(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("config")
        .join(name)
}

#[test]
fn test_shipped_configurations_validate() {
    for (file, kind) in [
        ("single_cv.toml", MeasurementKind::SingleCv),
        ("scan_cv.toml", MeasurementKind::ScanCv),
        ("single_iv.toml", MeasurementKind::SingleIv),
    ] {
        let settings = Settings::load_from(shipped(file)).unwrap();
        assert_eq!(settings.measurement.kind, kind, "{}", file);
        create_measurement(kind).check(&settings).unwrap();
    }
}

#[test]
fn test_voltage_file_resolved_next_to_config() {
    let settings = Settings::load_from(shipped("single_cv.toml")).unwrap();
    let voltages = settings.voltages().unwrap();
    assert_eq!(voltages.first(), Some(&0.0));
    assert_eq!(voltages.last(), Some(&-200.0));
    assert_eq!(voltages.len(), 20);
}

#[test]
fn test_malformed_voltage_file_names_line() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("bad.txt"), "0 -5\n-10 minus15\n").unwrap();
    let config = dir.path().join("iv.toml");
    std::fs::write(
        &config,
        r#"
        [measurement]
        kind = "single_iv"
        [power_supply]
        connection = { kind = "mock" }
        [sweep]
        voltage_file = "bad.txt"
        "#,
    )
    .unwrap();

    let settings = Settings::load_from(&config).unwrap();
    match settings.validate().unwrap_err() {
        DaqError::SweepList { line, message, .. } => {
            assert_eq!(line, 2);
            assert!(message.contains("minus15"));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_missing_file_is_reported() {
    let err = Settings::load_from("/nonexistent/run.toml").unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
fn test_scan_without_switch_card_rejected() {
    let mut settings = Settings::load_from(shipped("scan_cv.toml")).unwrap();
    settings.switch_card = None;
    let err = settings.validate().unwrap_err();
    assert!(err.to_string().contains("[switch_card]"));
}

#[test]
fn test_mock_flag_replaces_every_connection() {
    let settings = Settings::load_from(shipped("scan_cv.toml"))
        .unwrap()
        .with_mock_instruments();
    assert_eq!(settings.power_supply.unwrap().connection, ConnectionConfig::Mock);
    assert_eq!(settings.lcr_meter.unwrap().connection, ConnectionConfig::Mock);
    assert_eq!(settings.switch_card.unwrap().connection, ConnectionConfig::Mock);
}

fn single_cv() -> Settings {
    Settings::load_from(shipped("single_cv.toml")).unwrap()
}

fn rejected(settings: &Settings, field: &str) {
    match settings.validate() {
        Err(DaqError::Configuration(message)) => {
            assert!(message.contains(field), "{}: {}", field, message)
        }
        other => panic!("{} accepted: {:?}", field, other),
    }
}

#[test]
fn test_out_of_range_delays_rejected() {
    let cases: [(&str, fn(&mut Settings)); 8] = [
        ("voltage_delay_s", |s| s.sweep.voltage_delay_s = f64::INFINITY),
        ("frequency_delay_s", |s| s.sweep.frequency_delay_s = f64::NAN),
        ("channel_delay_s", |s| s.sweep.channel_delay_s = -1.0),
        ("ramp_delay_s", |s| s.sweep.ramp_delay_s = 1e20),
        ("settle_delay_s", |s| s.sweep.settle_delay_s = f64::NEG_INFINITY),
        ("dwell_time_s", |s| s.sweep.dwell_time_s = f64::NAN),
        ("sample_interval_s", |s| s.sweep.sample_interval_s = f64::INFINITY),
        ("total_duration_s", |s| s.sweep.total_duration_s = Some(1e30)),
    ];
    for (field, apply) in cases {
        let mut settings = single_cv();
        apply(&mut settings);
        rejected(&settings, field);
    }
}

#[test]
fn test_infinite_delay_from_toml_fails_plan_without_panic() {
    let settings = Settings::from_toml_str(
        r#"
        [measurement]
        kind = "single_iv"
        [power_supply]
        connection = { kind = "mock" }
        [sweep]
        voltages = [0, -5]
        voltage_delay_s = inf
        "#,
    )
    .unwrap();

    rejected(&settings, "voltage_delay_s");
    assert!(SweepPlan::from_settings(&settings).is_err());
}

#[test]
fn test_ramp_step_below_minimum_rejected() {
    for step in [1e-300, 0.001, f64::INFINITY, f64::NAN] {
        let mut settings = single_cv();
        settings.sweep.ramp_step_v = step;
        rejected(&settings, "ramp_step_v");
    }

    let mut settings = single_cv();
    settings.sweep.ramp_step_v = 0.01;
    settings.validate().unwrap();
}

#[test]
fn test_non_finite_inline_voltages_rejected() {
    for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let mut settings = single_cv();
        settings.sweep.voltage_file = None;
        settings.sweep.voltages = Some(vec![0.0, bad]);
        rejected(&settings, "sweep.voltages");
    }
}

#[test]
fn test_lcr_frequency_and_amplitude_must_be_positive() {
    for frequency in [0.0, -1000.0, f64::NAN, f64::INFINITY] {
        let mut settings = single_cv();
        settings.lcr_meter.as_mut().unwrap().frequency = frequency;
        rejected(&settings, "lcr_meter.frequency");
    }
    for amplitude in [0.0, -0.5, f64::NAN] {
        let mut settings = single_cv();
        settings.lcr_meter.as_mut().unwrap().ac_voltage = amplitude;
        rejected(&settings, "lcr_meter.ac_voltage");
    }

    let mut settings = single_cv();
    settings.sweep.frequencies = vec![1000.0, f64::INFINITY];
    rejected(&settings, "sweep.frequencies");
}
