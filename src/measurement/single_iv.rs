//! I-V curve of a single structure.
//!
//! Only the power supply is used. At every bias voltage the measured voltage is read once and
//! the current `samples_per_point` times.

use super::stats::aggregate;
use super::{MeasurementContext, PlotData, Prepared, SweepKind};
use crate::config::MeasurementKind;
use crate::data::storage::{FileHeader, TableRow};
use crate::hardware::capabilities::PowerSource;
use crate::hardware::InstrumentFactory;
use crate::measurement::cancel::CancelToken;
use crate::measurement::sweep::PointMeasurement;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

/// One I-V point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IvRow {
    /// Requested bias in V
    pub nominal_voltage: f64,
    /// Bias read back from the supply in V
    pub measured_voltage: f64,
    /// Mean current in A
    pub current: f64,
    /// Population standard deviation of the current in A
    pub current_err: f64,
}

impl TableRow for IvRow {
    const COLUMNS: &'static [&'static str] = &[
        "Nominal Voltage [V]",
        "Measured Voltage [V]",
        "Current [A]",
        "Current Error [A]",
    ];

    fn values(&self) -> Vec<f64> {
        vec![
            self.nominal_voltage,
            self.measured_voltage,
            self.current,
            self.current_err,
        ]
    }
}

/// Samples the supply current at each bias.
pub struct IvPoint {
    samples: usize,
}

impl IvPoint {
    /// Point taking `samples` current readings
    pub fn new(samples: usize) -> Self {
        Self {
            samples: samples.max(1),
        }
    }
}

#[async_trait]
impl PointMeasurement for IvPoint {
    type Row = IvRow;

    async fn measure(
        &mut self,
        power: &mut dyn PowerSource,
        nominal_voltage: f64,
        _cancel: &CancelToken,
        rows: &mut Vec<IvRow>,
    ) -> Result<()> {
        let measured_voltage = power.read_voltage().await?;
        let mut currents = Vec::with_capacity(self.samples);
        for _ in 0..self.samples {
            currents.push(power.read_current().await?);
        }
        let current = aggregate(&currents).ok_or_else(|| anyhow!("No current readings"))?;
        debug!(
            "{} V: {:.5E} A +- {:.5E}",
            measured_voltage, current.mean, current.std_dev
        );

        rows.push(IvRow {
            nominal_voltage,
            measured_voltage,
            current: current.mean,
            current_err: current.std_dev,
        });
        Ok(())
    }
}

/// I-V measurement
#[derive(Debug, Default)]
pub struct SingleIv;

#[async_trait]
impl SweepKind for SingleIv {
    type Row = IvRow;
    type Point = IvPoint;

    const KIND: MeasurementKind = MeasurementKind::SingleIv;
    const TITLE: &'static str = "Single I-V measurement";
    const DATA_FILE: &'static str = "iv.dat";

    async fn prepare(
        &mut self,
        ctx: &MeasurementContext,
        _instruments: &mut dyn InstrumentFactory,
        header: FileHeader,
    ) -> Result<Prepared<IvPoint>> {
        Ok(Prepared {
            point: IvPoint::new(ctx.settings.sweep.samples_per_point),
            header,
            environment: HashMap::new(),
        })
    }

    fn plots(&self, rows: &[IvRow], file_id: &str) -> Vec<PlotData> {
        vec![PlotData {
            file_name: format!("iv_{}.svg", file_id),
            title: format!("I-V {}", file_id),
            x_label: "Voltage [V]",
            y_label: "Current [A]",
            x: rows.iter().map(|r| r.measured_voltage).collect(),
            y: rows.iter().map(|r| r.current).collect(),
            errors: Some(rows.iter().map(|r| r.current_err).collect()),
        }]
    }
}
