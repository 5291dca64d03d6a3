//! Measurement Framework
//!
//! Every measurement follows the same lifecycle, driven by [`run_measurement`]:
//!
//! ```text
//! initialise()  resolve parameters; no instrument is touched
//!      │
//! execute()     open instruments → configure → sweep → teardown → save data
//!      │
//! finalise()    render plots; always runs, even when execute failed
//!      │
//! metadata.json written with the outcome
//! ```
//!
//! The measurement kinds ([`single_cv`], [`scan_cv`], [`single_iv`]) only differ in the
//! instruments they open and in what they measure at each bias voltage. They implement
//! [`SweepKind`]; [`BiasSweep`] turns any of them into a [`Measurement`].

pub mod cancel;
pub mod scan_cv;
pub mod single_cv;
pub mod single_iv;
pub mod stats;
pub mod sweep;

pub use cancel::CancelToken;
pub use sweep::{run_sweep, teardown, PointMeasurement, SweepOutcome, SweepPlan, SweepStatus};

use crate::config::{LcrMeterConfig, MeasurementKind, PowerSupplyConfig, Settings};
use crate::data::plot::{render_plot, PlotSpec};
use crate::data::storage::{write_table, FileHeader, TableRow};
use crate::data::{sanitize, RunDirectory};
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{ImpedanceMeter, LcrFunction, PowerSource};
use crate::hardware::InstrumentFactory;
use crate::metadata::{RunMetadata, RunStatus};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use sweep::{configure_power_source, SupplyLimits};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Everything a run needs besides its instruments.
pub struct MeasurementContext {
    /// Validated settings
    pub settings: Settings,
    /// Where the run's files go
    pub run: RunDirectory,
    /// Unique id of the run
    pub run_id: Uuid,
    /// Operator cancellation
    pub cancel: CancelToken,
}

impl MeasurementContext {
    /// Context for a new run
    pub fn new(settings: Settings, run: RunDirectory, cancel: CancelToken) -> Self {
        Self {
            settings,
            run,
            run_id: Uuid::new_v4(),
            cancel,
        }
    }

    /// Sample id as used in file names
    pub fn file_id(&self) -> String {
        sanitize(&self.settings.measurement.sample_id)
    }
}

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// How the run ended
    pub status: RunStatus,
    /// Rows saved
    pub rows: usize,
    /// Data file, if one was written
    pub data_file: Option<PathBuf>,
    /// Plots written
    pub plots: Vec<PathBuf>,
    /// Readings taken once per run
    pub environment: HashMap<String, f64>,
    /// Error that ended the run
    pub error: Option<String>,
    /// Teardown failures
    pub shutdown_error: Option<String>,
}

impl RunReport {
    /// Report of a run that produced nothing
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            rows: 0,
            data_file: None,
            plots: Vec::new(),
            environment: HashMap::new(),
            error: Some(error.into()),
            shutdown_error: None,
        }
    }

    /// `Err` if the run failed or the supply could not be shut down cleanly.
    ///
    /// A cancelled run is not an error.
    pub fn into_result(self) -> Result<Self> {
        if let Some(shutdown) = &self.shutdown_error {
            return Err(anyhow!(
                "{}; power supply shutdown failed: {}",
                self.error.as_deref().unwrap_or("run finished"),
                shutdown
            ));
        }
        if self.status == RunStatus::Failed {
            return Err(anyhow!(
                "{}",
                self.error.as_deref().unwrap_or("measurement failed")
            ));
        }
        Ok(self)
    }
}

/// Lifecycle of a measurement.
#[async_trait]
pub trait Measurement: Send {
    /// Which measurement this is
    fn kind(&self) -> MeasurementKind;

    /// Reject settings this measurement cannot run with.
    fn check(&self, settings: &Settings) -> AppResult<()>;

    /// Resolve the sweep from the settings. Touches no hardware.
    fn initialise(&mut self, ctx: &MeasurementContext) -> AppResult<()>;

    /// Open instruments, sweep, tear down and save the data.
    ///
    /// Returns `Err` only when nothing was measured, e.g. the supply could not be opened.
    async fn execute(
        &mut self,
        ctx: &MeasurementContext,
        instruments: &mut dyn InstrumentFactory,
    ) -> Result<RunReport>;

    /// Render plots into the run directory.
    async fn finalise(&mut self, ctx: &MeasurementContext, report: &mut RunReport) -> Result<()>;
}

/// Run `measurement` through its whole lifecycle and write `metadata.json`.
///
/// `finalise` always runs once `initialise` succeeded. Returns `Err` when the run failed,
/// after the data gathered so far has been saved.
pub async fn run_measurement(
    measurement: &mut dyn Measurement,
    ctx: &MeasurementContext,
    instruments: &mut dyn InstrumentFactory,
) -> Result<RunReport> {
    let mut metadata = RunMetadata::start(
        ctx.run_id,
        ctx.run.name(),
        ctx.run.started_at().with_timezone(&Utc),
        &ctx.settings,
    );
    info!(
        "Starting {} measurement of '{}' (run {})",
        measurement.kind(),
        ctx.settings.measurement.sample_id,
        ctx.run_id
    );

    if let Err(e) = measurement.initialise(ctx) {
        metadata.finish(RunStatus::Failed, Some(e.to_string()));
        write_metadata(ctx, &metadata);
        return Err(e.into());
    }

    let mut report = match measurement.execute(ctx, instruments).await {
        Ok(report) => report,
        Err(e) => {
            error!("Measurement failed: {:#}", e);
            RunReport::failed(format!("{:#}", e))
        }
    };

    // Always finalise, regardless of execute result
    if let Err(e) = measurement.finalise(ctx, &mut report).await {
        warn!("Finalise failed: {:#}", e);
    }

    let relative = |path: &PathBuf| {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    metadata.rows = report.rows;
    metadata.data_file = report.data_file.as_ref().map(relative);
    metadata.plots = report.plots.iter().map(relative).collect();
    metadata.environment = report.environment.clone();
    let error = match (&report.error, &report.shutdown_error) {
        (Some(e), Some(s)) => Some(format!("{}; shutdown: {}", e, s)),
        (Some(e), None) => Some(e.clone()),
        (None, Some(s)) => Some(format!("shutdown: {}", s)),
        (None, None) => None,
    };
    metadata.finish(report.status, error);
    write_metadata(ctx, &metadata);

    info!(
        "Run {} {}: {} rows in {}",
        ctx.run.name(),
        report.status,
        report.rows,
        ctx.run.path().display()
    );
    report.into_result()
}

fn write_metadata(ctx: &MeasurementContext, metadata: &RunMetadata) {
    if let Err(e) = metadata.write(&ctx.run.file("metadata.json")) {
        warn!("Could not write run metadata: {}", e);
    }
}

/// The measurement for `kind`.
pub fn create_measurement(kind: MeasurementKind) -> Box<dyn Measurement> {
    match kind {
        MeasurementKind::SingleCv => Box::new(BiasSweep::new(single_cv::SingleCv::default())),
        MeasurementKind::ScanCv => Box::new(BiasSweep::new(scan_cv::ScanCv::default())),
        MeasurementKind::SingleIv => Box::new(BiasSweep::new(single_iv::SingleIv)),
    }
}

/// Data of one plot.
#[derive(Debug, Clone, PartialEq)]
pub struct PlotData {
    /// File name inside the run directory
    pub file_name: String,
    /// Caption
    pub title: String,
    /// Horizontal axis label
    pub x_label: &'static str,
    /// Vertical axis label
    pub y_label: &'static str,
    /// Horizontal values
    pub x: Vec<f64>,
    /// Vertical values
    pub y: Vec<f64>,
    /// Error bar half-widths
    pub errors: Option<Vec<f64>>,
}

/// What a kind-specific setup hands to the sweep.
pub struct Prepared<P> {
    /// Measures each bias point
    pub point: P,
    /// Data file header
    pub header: FileHeader,
    /// Readings taken once per run
    pub environment: HashMap<String, f64>,
}

/// LCR meter state read back after configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LcrSettings {
    /// AC level in V
    pub ac_voltage: f64,
    /// Test frequency in Hz
    pub frequency: f64,
    /// Measurement function
    pub function: LcrFunction,
}

/// The configured LCR function, or `default` when none is set.
pub fn lcr_function(config: &LcrMeterConfig, default: LcrFunction) -> AppResult<LcrFunction> {
    match &config.mode {
        Some(mode) => mode
            .parse()
            .map_err(|e: anyhow::Error| DaqError::Configuration(format!("lcr_meter.mode: {}", e))),
        None => Ok(default),
    }
}

/// Reset the LCR meter and apply the AC signal and function.
pub async fn configure_lcr_meter(
    meter: &mut dyn ImpedanceMeter,
    config: &LcrMeterConfig,
    function: LcrFunction,
) -> Result<LcrSettings> {
    meter.reset().await?;
    meter.set_ac_voltage(config.ac_voltage).await?;
    meter.set_frequency(config.frequency).await?;
    meter.set_function(function).await?;

    let settings = LcrSettings {
        ac_voltage: meter.ac_voltage().await?,
        frequency: meter.frequency().await?,
        function,
    };
    info!(
        "LCR meter: {} at {:.2E} V, {:.2E} Hz",
        function, settings.ac_voltage, settings.frequency
    );
    Ok(settings)
}

/// A measurement kind built on the bias sweep.
#[async_trait]
pub trait SweepKind: Send {
    /// One data file row
    type Row: TableRow + Send + Sync + 'static;
    /// Point measurement producing the rows
    type Point: PointMeasurement<Row = Self::Row> + 'static;

    /// Kind tag
    const KIND: MeasurementKind;
    /// First header line, followed by the sample id
    const TITLE: &'static str;
    /// Data file name inside the run directory
    const DATA_FILE: &'static str;
    /// Whether each point averages `sweep.samples_per_point` readings
    const AVERAGES_SAMPLES: bool = true;

    /// Check kind-specific settings.
    fn check(&self, _settings: &Settings) -> AppResult<()> {
        Ok(())
    }

    /// Open and configure the other instruments. The supply output is already on.
    async fn prepare(
        &mut self,
        ctx: &MeasurementContext,
        instruments: &mut dyn InstrumentFactory,
        header: FileHeader,
    ) -> Result<Prepared<Self::Point>>;

    /// Plots of the saved rows.
    fn plots(&self, rows: &[Self::Row], file_id: &str) -> Vec<PlotData>;
}

/// Any [`SweepKind`] run as a [`Measurement`].
pub struct BiasSweep<K: SweepKind> {
    kind: K,
    plan: Option<SweepPlan>,
    rows: Vec<K::Row>,
}

impl<K: SweepKind> BiasSweep<K> {
    /// Wrap a measurement kind
    pub fn new(kind: K) -> Self {
        Self {
            kind,
            plan: None,
            rows: Vec::new(),
        }
    }

    /// Rows of the last execution
    pub fn rows(&self) -> &[K::Row] {
        &self.rows
    }

    async fn setup(
        &mut self,
        ctx: &MeasurementContext,
        instruments: &mut dyn InstrumentFactory,
        power: &mut dyn PowerSource,
        supply: &PowerSupplyConfig,
        plan: &SweepPlan,
    ) -> Result<Prepared<K::Point>> {
        let limits = configure_power_source(power, supply, &plan.voltages)
            .await
            .context("Configuring the power supply failed")?;
        let header = supply_header::<K>(ctx, &limits, plan);
        self.kind.prepare(ctx, instruments, header).await
    }
}

fn supply_header<K: SweepKind>(
    ctx: &MeasurementContext,
    limits: &SupplyLimits,
    plan: &SweepPlan,
) -> FileHeader {
    let header = FileHeader::new(format!("{} {}", K::TITLE, ctx.settings.measurement.sample_id))
        .text("Run", &ctx.run_id.to_string())
        .text("Started", &ctx.run.started_at().to_rfc3339())
        .setting("Power supply voltage limit", limits.voltage, "V")
        .setting("Power supply current limit", limits.current, "A")
        .setting("Voltage delay", plan.voltage_delay.as_secs_f64(), "s")
        .setting("Ramp step", plan.ramp.step, "V");
    if K::AVERAGES_SAMPLES {
        let samples = ctx.settings.sweep.samples_per_point;
        header.setting("Samples per point", samples as f64, "")
    } else {
        header
    }
}

#[async_trait]
impl<K: SweepKind + 'static> Measurement for BiasSweep<K> {
    fn kind(&self) -> MeasurementKind {
        K::KIND
    }

    fn check(&self, settings: &Settings) -> AppResult<()> {
        settings.validate()?;
        self.kind.check(settings)
    }

    fn initialise(&mut self, ctx: &MeasurementContext) -> AppResult<()> {
        self.check(&ctx.settings)?;
        let plan = SweepPlan::from_settings(&ctx.settings)?;
        info!(
            "{} voltages from {} V to {} V",
            plan.voltages.len(),
            plan.voltages.first().copied().unwrap_or_default(),
            plan.voltages.last().copied().unwrap_or_default()
        );
        self.plan = Some(plan);
        self.rows.clear();
        Ok(())
    }

    async fn execute(
        &mut self,
        ctx: &MeasurementContext,
        instruments: &mut dyn InstrumentFactory,
    ) -> Result<RunReport> {
        let plan = self
            .plan
            .clone()
            .ok_or_else(|| anyhow!("Measurement executed before initialise"))?;
        let supply = ctx
            .settings
            .power_supply
            .as_ref()
            .ok_or_else(|| anyhow!("No power supply configured"))?;

        let mut power = instruments
            .power_source(supply)
            .await
            .context("Opening the power supply failed")?;

        let mut header = None;
        let mut environment = HashMap::new();
        let outcome = match self
            .setup(ctx, instruments, power.as_mut(), supply, &plan)
            .await
        {
            Ok(prepared) => {
                header = Some(prepared.header);
                environment = prepared.environment;
                let mut point = prepared.point;
                run_sweep(power.as_mut(), &plan, &mut point, &ctx.cancel).await
            }
            Err(e) => {
                error!("Setup failed: {:#}", e);
                SweepOutcome::failed(e)
            }
        };

        let shutdown = teardown(power.as_mut(), &plan.ramp, plan.settle_delay).await;

        let (mut status, mut error) = match outcome.status {
            SweepStatus::Completed => (RunStatus::Completed, None),
            SweepStatus::Cancelled => (RunStatus::Cancelled, None),
            SweepStatus::Failed(e) => (RunStatus::Failed, Some(format!("{:#}", e))),
        };

        let header = header.unwrap_or_else(|| {
            FileHeader::new(format!("{} {}", K::TITLE, ctx.settings.measurement.sample_id))
        });
        let path = ctx.run.file(K::DATA_FILE);
        let data_file = match write_table(&path, &header, &outcome.rows) {
            Ok(()) => Some(path),
            Err(e) => {
                error!("Saving data failed: {}", e);
                status = RunStatus::Failed;
                error.get_or_insert_with(|| e.to_string());
                None
            }
        };

        self.rows = outcome.rows;
        Ok(RunReport {
            status,
            rows: self.rows.len(),
            data_file,
            plots: Vec::new(),
            environment,
            error,
            shutdown_error: shutdown.err().map(|e| e.to_string()),
        })
    }

    async fn finalise(&mut self, ctx: &MeasurementContext, report: &mut RunReport) -> Result<()> {
        if self.rows.is_empty() {
            info!("No data, no plots");
            return Ok(());
        }

        for plot in self.kind.plots(&self.rows, &ctx.file_id()) {
            let path = ctx.run.file(&plot.file_name);
            let spec = PlotSpec {
                title: &plot.title,
                x_label: plot.x_label,
                y_label: plot.y_label,
            };
            match render_plot(&path, &spec, &plot.x, &plot.y, plot.errors.as_deref()) {
                Ok(()) => report.plots.push(path),
                Err(e) => warn!("Plot {} not written: {}", plot.file_name, e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;

    fn lcr(mode: Option<&str>) -> LcrMeterConfig {
        LcrMeterConfig {
            connection: ConnectionConfig::Mock,
            ac_voltage: 0.5,
            frequency: 1e4,
            mode: mode.map(str::to_string),
        }
    }

    #[test]
    fn test_cancelled_run_is_not_an_error() {
        let report = RunReport {
            status: RunStatus::Cancelled,
            ..RunReport::failed("unused")
        };
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_failed_run_and_shutdown_failure_are_errors() {
        let err = RunReport::failed("LCR timeout").into_result().unwrap_err();
        assert_eq!(err.to_string(), "LCR timeout");

        let report = RunReport {
            status: RunStatus::Completed,
            error: None,
            shutdown_error: Some("output off: timeout".to_string()),
            ..RunReport::failed("")
        };
        let err = report.into_result().unwrap_err();
        assert!(err.to_string().contains("shutdown failed: output off: timeout"));
    }

    #[test]
    fn test_lcr_function_from_config() {
        assert_eq!(
            lcr_function(&lcr(None), LcrFunction::Rx).unwrap(),
            LcrFunction::Rx
        );
        assert_eq!(
            lcr_function(&lcr(Some("cprp")), LcrFunction::Rx).unwrap(),
            LcrFunction::CpRp
        );
        assert!(lcr_function(&lcr(Some("LQ")), LcrFunction::Rx).is_err());
    }

    #[tokio::test]
    async fn test_configure_lcr_meter_reads_back() {
        let mut meter = crate::hardware::mock::MockLcrMeter::new();
        let log = meter.log();

        let settings = configure_lcr_meter(&mut meter, &lcr(None), LcrFunction::Rx)
            .await
            .unwrap();

        assert_eq!(settings.ac_voltage, 0.5);
        assert_eq!(settings.frequency, 1e4);
        assert_eq!(
            log.commands(),
            vec!["reset", "ac_voltage 0.5", "frequency 10000", "function RX"]
        );
    }
}
