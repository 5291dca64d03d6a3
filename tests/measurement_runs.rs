//! End-to-end runs of each measurement kind against mock instruments.
//!
//! Every test goes through `run_measurement`, the same path the CLI takes, and then checks the
//! files left in the run directory.

use semi_daq::config::Settings;
use semi_daq::data::storage::{read_header, read_table};
use semi_daq::data::RunDirectory;
use semi_daq::hardware::mock::{MockInstruments, MockLcrMeter, MockPowerSupply, MockSwitchCard};
use semi_daq::measurement::{create_measurement, run_measurement, CancelToken, MeasurementContext};
use semi_daq::metadata::{RunMetadata, RunStatus};
use tempfile::TempDir;

const SINGLE_IV: &str = r#"
    [measurement]
    kind = "single_iv"
    sample_id = "W3_D01"

    [power_supply]
    connection = { kind = "mock" }
    current_limit = 0.001
    voltage_limit = 1000

    [sweep]
    voltages = [0, 10, -10]
    samples_per_point = 1
    voltage_delay_s = 0
    ramp_delay_s = 0
    settle_delay_s = 0
"#;

const SINGLE_CV: &str = r#"
    [measurement]
    kind = "single_cv"
    sample_id = "W3_D02"

    [power_supply]
    connection = { kind = "mock" }

    [lcr_meter]
    connection = { kind = "mock" }
    frequency = 10000

    [sweep]
    voltages = [0, -5, -10, -15]
    frequencies = [1000, 10000, 100000]
    samples_per_point = 3
    voltage_delay_s = 0
    frequency_delay_s = 0
    ramp_delay_s = 0
    settle_delay_s = 0
"#;

const SCAN_CV: &str = r#"
    [measurement]
    kind = "scan_cv"
    sample_id = "W3_D03"

    [power_supply]
    connection = { kind = "mock" }

    [lcr_meter]
    connection = { kind = "mock" }
    frequency = 10000

    [switch_card]
    connection = { kind = "mock" }

    [sweep]
    voltages = [-1, -2]
    cells = [4, 5, 6]
    voltage_delay_s = 0
    channel_delay_s = 0
    dwell_time_s = 0
    sample_interval_s = 0.01
    ramp_delay_s = 0
    settle_delay_s = 0
"#;

fn context(toml: &str, output: &TempDir) -> MeasurementContext {
    let mut settings = Settings::from_toml_str(toml).unwrap();
    settings.storage.output_dir = output.path().to_path_buf();
    let run = RunDirectory::create(output.path(), &settings.measurement.sample_id).unwrap();
    MeasurementContext::new(settings, run, CancelToken::new())
}

fn metadata(ctx: &MeasurementContext) -> RunMetadata {
    RunMetadata::read(&ctx.run.file("metadata.json")).unwrap()
}

#[tokio::test]
async fn test_constant_readings_give_zero_error_column() {
    let output = TempDir::new().unwrap();
    let ctx = context(SINGLE_IV, &output);
    let supply = MockPowerSupply::new().with_current(1.0);
    let mut instruments = MockInstruments::new().with_power_supply(supply);
    let mut measurement = create_measurement(ctx.settings.measurement.kind);

    let report = run_measurement(measurement.as_mut(), &ctx, &mut instruments)
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.rows, 3);

    let rows = read_table(&ctx.run.file("iv.dat")).unwrap();
    assert_eq!(rows.len(), 3);
    let nominal: Vec<f64> = rows.iter().map(|r| r[0]).collect();
    assert_eq!(nominal, vec![0.0, 10.0, -10.0]);
    assert!(rows.iter().all(|r| r[2] == 1.0));
    assert!(rows.iter().all(|r| r[3] == 0.0));

    assert!(ctx.run.file("iv_W3_D01.svg").is_file());
    let meta = metadata(&ctx);
    assert_eq!(meta.status, RunStatus::Completed);
    assert_eq!(meta.rows, 3);
    assert_eq!(meta.data_file.as_deref(), Some("iv.dat"));
    assert_eq!(meta.run_id, ctx.run_id);
}

#[tokio::test]
async fn test_cancel_at_second_point_tears_down_once() {
    let output = TempDir::new().unwrap();
    let ctx = context(
        &SINGLE_IV.replace("voltages = [0, 10, -10]", "voltages = [-10, -20, -30, -40, -50]"),
        &output,
    );
    let token = ctx.cancel.clone();
    let supply = MockPowerSupply::new().on_ramp(move |target| {
        if target == -20.0 {
            token.cancel("keyboard interrupt");
        }
    });
    let log = supply.log();
    let mut instruments = MockInstruments::new().with_power_supply(supply);
    let mut measurement = create_measurement(ctx.settings.measurement.kind);

    let report = run_measurement(measurement.as_mut(), &ctx, &mut instruments)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.rows, 1);
    assert_eq!(log.count("ramp 0"), 1);
    assert_eq!(log.count("output off"), 1);
    assert!(log.position("ramp 0").unwrap() < log.position("output off").unwrap());
    assert_eq!(log.count("ramp -30"), 0);

    assert_eq!(read_table(&ctx.run.file("iv.dat")).unwrap().len(), 1);
    assert_eq!(metadata(&ctx).status, RunStatus::Cancelled);
}

#[tokio::test]
async fn test_instrument_failure_saves_rows_and_reports_error() {
    let output = TempDir::new().unwrap();
    let ctx = context(SINGLE_IV, &output);
    // One voltage and one current read per point: fails during the second point
    let supply = MockPowerSupply::new().fail_after_reads(3);
    let log = supply.log();
    let mut instruments = MockInstruments::new().with_power_supply(supply);
    let mut measurement = create_measurement(ctx.settings.measurement.kind);

    let err = run_measurement(measurement.as_mut(), &ctx, &mut instruments)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("Measurement at 10 V failed"));
    assert_eq!(log.count("ramp 0"), 1);
    assert_eq!(log.count("output off"), 1);
    assert_eq!(read_table(&ctx.run.file("iv.dat")).unwrap().len(), 1);

    let meta = metadata(&ctx);
    assert_eq!(meta.status, RunStatus::Failed);
    assert!(meta.error.unwrap().contains("simulated read failure"));
}

#[tokio::test]
async fn test_voltage_beyond_supply_limit_never_enables_output() {
    let output = TempDir::new().unwrap();
    let ctx = context(
        &SINGLE_IV
            .replace("voltage_limit = 1000", "voltage_limit = 5000")
            .replace("voltages = [0, 10, -10]", "voltages = [0, -2000]"),
        &output,
    );
    let supply = MockPowerSupply::new();
    let log = supply.log();
    let mut instruments = MockInstruments::new().with_power_supply(supply);
    let mut measurement = create_measurement(ctx.settings.measurement.kind);

    let err = run_measurement(measurement.as_mut(), &ctx, &mut instruments)
        .await
        .unwrap_err();

    assert!(format!("{:#}", err).contains("-2000"));
    assert_eq!(log.count("output on"), 0);
    assert_eq!(log.count("output off"), 1);
    assert_eq!(metadata(&ctx).rows, 0);
}

#[tokio::test]
async fn test_single_cv_row_per_voltage_and_frequency() {
    let output = TempDir::new().unwrap();
    let ctx = context(SINGLE_CV, &output);
    let meter = MockLcrMeter::new().with_device(250e-12, 5e8);
    let lcr_log = meter.log();
    let mut instruments = MockInstruments::new()
        .with_power_supply(MockPowerSupply::new())
        .with_lcr_meter(meter);
    let mut measurement = create_measurement(ctx.settings.measurement.kind);

    let report = run_measurement(measurement.as_mut(), &ctx, &mut instruments)
        .await
        .unwrap();

    assert_eq!(report.rows, 4 * 3);
    let rows = read_table(&ctx.run.file("cv.dat")).unwrap();
    assert_eq!(rows.len(), 12);
    assert!(rows.iter().all(|r| r.len() == 8));
    let frequencies: Vec<f64> = rows.iter().take(3).map(|r| r[2]).collect();
    assert_eq!(frequencies, vec![1000.0, 10000.0, 100000.0]);
    assert!(rows.iter().all(|r| (r[3] - 250e-12).abs() < 1e-15));
    assert_eq!(lcr_log.count("measure"), 12 * 3);
    assert_eq!(lcr_log.count("function CPRP"), 1);

    let header = read_header(&ctx.run.file("cv.dat")).unwrap();
    assert_eq!(header[0], "Single C-V measurement W3_D02");
    assert!(header.iter().any(|l| l.starts_with("LCR function:")));
    assert!(header.iter().any(|l| l.starts_with("Samples per point:")));

    assert!(ctx.run.file("cv_W3_D02.svg").is_file());
    assert!(ctx.run.file("iv_total_current_W3_D02.svg").is_file());
}

#[tokio::test]
async fn test_scan_cv_visits_every_cell() {
    let output = TempDir::new().unwrap();
    let ctx = context(SCAN_CV, &output);
    let switch = MockSwitchCard::new();
    let switch_log = switch.log();
    let mut instruments = MockInstruments::new()
        .with_power_supply(MockPowerSupply::new())
        .with_lcr_meter(MockLcrMeter::new().with_device(100e-12, 1e9))
        .with_switch_card(switch);
    let mut measurement = create_measurement(ctx.settings.measurement.kind);

    let report = run_measurement(measurement.as_mut(), &ctx, &mut instruments)
        .await
        .unwrap();

    assert_eq!(report.rows, 2 * 3);
    let rows = read_table(&ctx.run.file("cv_scan.dat")).unwrap();
    let channels: Vec<f64> = rows.iter().map(|r| r[3]).collect();
    assert_eq!(channels, vec![4.0, 5.0, 6.0, 4.0, 5.0, 6.0]);
    assert!(rows.iter().all(|r| (r[6] - 100.0).abs() < 1e-3));
    assert_eq!(switch_log.position("reboot"), Some(0));

    let header = read_header(&ctx.run.file("cv_scan.dat")).unwrap();
    for label in [
        "Probe card temperature:",
        "Matrix temperature:",
        "Probe card humidity:",
        "Matrix humidity:",
    ] {
        assert!(header.iter().any(|l| l.starts_with(label)), "{}", label);
    }
    assert!(!header.iter().any(|l| l.starts_with("Samples per point:")));

    let meta = metadata(&ctx);
    assert_eq!(meta.environment.len(), 4);
    assert_eq!(meta.environment["probecard_temperature_c"], 23.0);
    assert_eq!(meta.environment["matrix_temperature_c"], 24.5);
    assert_eq!(meta.environment["matrix_humidity_pct"], 38.0);
    assert_eq!(meta.plots.len(), 4);
    assert!(ctx.run.file("1c2v_channel_4_W3_D03.svg").is_file());
}

#[tokio::test]
async fn test_invalid_lcr_mode_fails_before_opening_instruments() {
    let output = TempDir::new().unwrap();
    let ctx = context(
        &SCAN_CV.replace("frequency = 10000", "frequency = 10000\nmode = \"CPRP\""),
        &output,
    );
    let supply = MockPowerSupply::new();
    let log = supply.log();
    let mut instruments = MockInstruments::new().with_power_supply(supply);
    let mut measurement = create_measurement(ctx.settings.measurement.kind);

    let err = run_measurement(measurement.as_mut(), &ctx, &mut instruments)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("RX"));
    assert!(log.commands().is_empty());
    assert_eq!(metadata(&ctx).status, RunStatus::Failed);
}
