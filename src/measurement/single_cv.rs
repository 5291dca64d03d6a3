//! C-V curve of a single structure.
//!
//! At every bias voltage the LCR meter visits each configured frequency. Per frequency the
//! frequency is read back, the supply current and voltage are read once and the LCR meter is
//! sampled `samples_per_point` times in the parallel model (Cp, Rp).

use super::stats::aggregate;
use super::{
    configure_lcr_meter, lcr_function, MeasurementContext, PlotData, Prepared, SweepKind,
};
use crate::config::{MeasurementKind, Settings};
use crate::data::storage::{FileHeader, TableRow};
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{ImpedanceMeter, LcrFunction, PowerSource};
use crate::hardware::InstrumentFactory;
use crate::measurement::cancel::CancelToken;
use crate::measurement::sweep::PointMeasurement;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// One C-V point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CvRow {
    /// Requested bias in V
    pub nominal_voltage: f64,
    /// Bias read back from the supply in V
    pub measured_voltage: f64,
    /// LCR frequency read back from the meter in Hz
    pub frequency: f64,
    /// Mean parallel capacitance in F
    pub cp: f64,
    /// Population standard deviation of Cp in F
    pub cp_err: f64,
    /// Mean parallel resistance in Ohm
    pub rp: f64,
    /// Population standard deviation of Rp in Ohm
    pub rp_err: f64,
    /// Supply current in A
    pub total_current: f64,
}

impl TableRow for CvRow {
    const COLUMNS: &'static [&'static str] = &[
        "Nominal Voltage [V]",
        "Measured Voltage [V]",
        "Frequency [Hz]",
        "Capacitance [F]",
        "Capacitance Error [F]",
        "Resistance [Ohm]",
        "Resistance Error [Ohm]",
        "Total Current [A]",
    ];

    fn values(&self) -> Vec<f64> {
        vec![
            self.nominal_voltage,
            self.measured_voltage,
            self.frequency,
            self.cp,
            self.cp_err,
            self.rp,
            self.rp_err,
            self.total_current,
        ]
    }
}

/// Visits every frequency at the current bias.
pub struct CvPoint {
    meter: Box<dyn ImpedanceMeter>,
    frequencies: Vec<f64>,
    frequency_delay: Duration,
    samples: usize,
}

impl CvPoint {
    /// Point measuring with `meter`
    pub fn new(
        meter: Box<dyn ImpedanceMeter>,
        frequencies: Vec<f64>,
        frequency_delay: Duration,
        samples: usize,
    ) -> Self {
        Self {
            meter,
            frequencies,
            frequency_delay,
            samples: samples.max(1),
        }
    }
}

#[async_trait]
impl PointMeasurement for CvPoint {
    type Row = CvRow;

    async fn measure(
        &mut self,
        power: &mut dyn PowerSource,
        nominal_voltage: f64,
        cancel: &CancelToken,
        rows: &mut Vec<CvRow>,
    ) -> Result<()> {
        for &target in &self.frequencies {
            self.meter
                .set_frequency(target)
                .await
                .with_context(|| format!("Setting {} Hz failed", target))?;
            if !cancel.sleep(self.frequency_delay).await {
                return Ok(());
            }

            let frequency = self.meter.frequency().await?;
            let total_current = power.read_current().await?;
            let measured_voltage = power.read_voltage().await?;

            let mut cp = Vec::with_capacity(self.samples);
            let mut rp = Vec::with_capacity(self.samples);
            for _ in 0..self.samples {
                let (c, r) = self.meter.measure().await?;
                cp.push(c);
                rp.push(r);
            }
            let cp = aggregate(&cp).ok_or_else(|| anyhow!("No LCR readings"))?;
            let rp = aggregate(&rp).ok_or_else(|| anyhow!("No LCR readings"))?;
            debug!(
                "{} V, {} Hz: Cp {:.5E} F, Rp {:.5E} Ohm, I {:.5E} A",
                measured_voltage, frequency, cp.mean, rp.mean, total_current
            );

            rows.push(CvRow {
                nominal_voltage,
                measured_voltage,
                frequency,
                cp: cp.mean,
                cp_err: cp.std_dev,
                rp: rp.mean,
                rp_err: rp.std_dev,
                total_current,
            });
        }
        Ok(())
    }
}

/// Single C-V measurement
#[derive(Debug, Default)]
pub struct SingleCv;

#[async_trait]
impl SweepKind for SingleCv {
    type Row = CvRow;
    type Point = CvPoint;

    const KIND: MeasurementKind = MeasurementKind::SingleCv;
    const TITLE: &'static str = "Single C-V measurement";
    const DATA_FILE: &'static str = "cv.dat";

    fn check(&self, settings: &Settings) -> AppResult<()> {
        let lcr = settings
            .lcr_meter
            .as_ref()
            .ok_or_else(|| DaqError::Configuration("No [lcr_meter] section".to_string()))?;
        match lcr_function(lcr, LcrFunction::CpRp)? {
            LcrFunction::CpRp => Ok(()),
            other => Err(DaqError::Configuration(format!(
                "single_cv records Cp and Rp; lcr_meter.mode must be CPRP, got {}",
                other
            ))),
        }
    }

    async fn prepare(
        &mut self,
        ctx: &MeasurementContext,
        instruments: &mut dyn InstrumentFactory,
        header: FileHeader,
    ) -> Result<Prepared<CvPoint>> {
        let settings = &ctx.settings;
        let config = settings
            .lcr_meter
            .as_ref()
            .ok_or_else(|| anyhow!("No LCR meter configured"))?;

        let mut meter = instruments
            .impedance_meter(config)
            .await
            .context("Opening the LCR meter failed")?;
        let lcr = configure_lcr_meter(meter.as_mut(), config, LcrFunction::CpRp)
            .await
            .context("Configuring the LCR meter failed")?;

        let frequencies = settings.frequencies();
        let mut header = header
            .setting("LCR AC voltage", lcr.ac_voltage, "V")
            .text("LCR function", lcr.function.as_str())
            .setting(
                "Frequency delay",
                settings.sweep.frequency_delay_s,
                "s",
            );
        for frequency in &frequencies {
            header = header.setting("Frequency", *frequency, "Hz");
        }

        Ok(Prepared {
            point: CvPoint::new(
                meter,
                frequencies,
                settings.sweep.frequency_delay()?,
                settings.sweep.samples_per_point,
            ),
            header,
            environment: HashMap::new(),
        })
    }

    fn plots(&self, rows: &[CvRow], file_id: &str) -> Vec<PlotData> {
        vec![
            PlotData {
                file_name: format!("cv_{}.svg", file_id),
                title: format!("C-V {}", file_id),
                x_label: "Voltage [V]",
                y_label: "Capacitance [F]",
                x: rows.iter().map(|r| r.measured_voltage).collect(),
                y: rows.iter().map(|r| r.cp).collect(),
                errors: Some(rows.iter().map(|r| r.cp_err).collect()),
            },
            PlotData {
                file_name: format!("iv_total_current_{}.svg", file_id),
                title: format!("Total current {}", file_id),
                x_label: "Voltage [V]",
                y_label: "Current [A]",
                x: rows.iter().map(|r| r.measured_voltage).collect(),
                y: rows.iter().map(|r| r.total_current).collect(),
                errors: None,
            },
        ]
    }
}
