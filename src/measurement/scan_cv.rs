//! C-V of several cells through the switch matrix.
//!
//! The voltage list is repeated until `total_duration_s` has passed. At every bias voltage each
//! cell is switched in and sampled every `sample_interval_s` for `dwell_time_s`, reading R and X
//! from the LCR meter:
//!
//! ```text
//! C [pF] = -1e12 / (2 pi f X)
//! ```
//!
//! with `f` the frequency read back from the meter during setup.

use super::stats::capacitance_pf;
use super::{
    configure_lcr_meter, lcr_function, MeasurementContext, PlotData, Prepared, SweepKind,
};
use crate::config::{MeasurementKind, Settings};
use crate::data::storage::{FileHeader, TableRow};
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{ChannelSwitch, ImpedanceMeter, LcrFunction, PowerSource};
use crate::hardware::InstrumentFactory;
use crate::measurement::cancel::CancelToken;
use crate::measurement::sweep::PointMeasurement;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// One scan sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanRow {
    /// Requested bias in V
    pub nominal_voltage: f64,
    /// Bias read back from the supply in V
    pub measured_voltage: f64,
    /// Seconds since the channel was switched in
    pub time: f64,
    /// Switch matrix channel
    pub channel: u32,
    /// Resistance in Ohm
    pub resistance: f64,
    /// Reactance in Ohm
    pub reactance: f64,
    /// Capacitance in pF
    pub capacitance_pf: f64,
    /// Supply current in A
    pub total_current: f64,
}

impl TableRow for ScanRow {
    const COLUMNS: &'static [&'static str] = &[
        "Nominal Voltage [V]",
        "Measured Voltage [V]",
        "Time [s]",
        "Channel",
        "Resistance [Ohm]",
        "Reactance [Ohm]",
        "Capacitance [pF]",
        "Total Current [A]",
    ];

    fn values(&self) -> Vec<f64> {
        vec![
            self.nominal_voltage,
            self.measured_voltage,
            self.time,
            f64::from(self.channel),
            self.resistance,
            self.reactance,
            self.capacitance_pf,
            self.total_current,
        ]
    }
}

/// Timing of the per-cell sampling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dwell {
    /// Wait after switching a channel
    pub channel_delay: Duration,
    /// Sampling time per cell; zero takes a single sample
    pub dwell_time: Duration,
    /// Interval between samples
    pub sample_interval: Duration,
}

/// Steps through the cells at the current bias.
pub struct ScanPoint {
    meter: Box<dyn ImpedanceMeter>,
    switch: Box<dyn ChannelSwitch>,
    cells: Vec<u32>,
    frequency: f64,
    dwell: Dwell,
}

impl ScanPoint {
    /// Point scanning `cells`; `frequency` is the LCR test frequency in Hz
    pub fn new(
        meter: Box<dyn ImpedanceMeter>,
        switch: Box<dyn ChannelSwitch>,
        cells: Vec<u32>,
        frequency: f64,
        dwell: Dwell,
    ) -> Self {
        Self {
            meter,
            switch,
            cells,
            frequency,
            dwell,
        }
    }
}

#[async_trait]
impl PointMeasurement for ScanPoint {
    type Row = ScanRow;

    async fn measure(
        &mut self,
        power: &mut dyn PowerSource,
        nominal_voltage: f64,
        cancel: &CancelToken,
        rows: &mut Vec<ScanRow>,
    ) -> Result<()> {
        for &channel in &self.cells {
            self.switch
                .open_channel(channel)
                .await
                .with_context(|| format!("Switching to channel {} failed", channel))?;
            if !cancel.sleep(self.dwell.channel_delay).await {
                return Ok(());
            }

            let opened = Instant::now();
            loop {
                let measured_voltage = power.read_voltage().await?;
                let total_current = power.read_current().await?;
                let (resistance, reactance) = self.meter.measure().await?;
                let capacitance_pf = capacitance_pf(self.frequency, reactance);
                let time = opened.elapsed().as_secs_f64();
                debug!(
                    "Channel {} at {} V, {:.1} s: C {:.5E} pF",
                    channel, measured_voltage, time, capacitance_pf
                );
                rows.push(ScanRow {
                    nominal_voltage,
                    measured_voltage,
                    time,
                    channel,
                    resistance,
                    reactance,
                    capacitance_pf,
                    total_current,
                });

                if opened.elapsed() >= self.dwell.dwell_time {
                    break;
                }
                if !cancel.sleep(self.dwell.sample_interval).await {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

/// Scanning C-V measurement
#[derive(Debug, Default)]
pub struct ScanCv {
    cells: Vec<u32>,
}

impl ScanCv {
    /// Channel shown in the per-channel plots
    pub fn representative_channel(cells: &[u32]) -> Option<u32> {
        cells.get(cells.len() / 10).copied()
    }
}

#[async_trait]
impl SweepKind for ScanCv {
    type Row = ScanRow;
    type Point = ScanPoint;

    const KIND: MeasurementKind = MeasurementKind::ScanCv;
    const TITLE: &'static str = "Scanning C-V measurement";
    const DATA_FILE: &'static str = "cv_scan.dat";
    const AVERAGES_SAMPLES: bool = false;

    fn check(&self, settings: &Settings) -> AppResult<()> {
        let lcr = settings
            .lcr_meter
            .as_ref()
            .ok_or_else(|| DaqError::Configuration("No [lcr_meter] section".to_string()))?;
        match lcr_function(lcr, LcrFunction::Rx)? {
            LcrFunction::Rx => Ok(()),
            other => Err(DaqError::Configuration(format!(
                "scan_cv derives C from the reactance; lcr_meter.mode must be RX, got {}",
                other
            ))),
        }
    }

    async fn prepare(
        &mut self,
        ctx: &MeasurementContext,
        instruments: &mut dyn InstrumentFactory,
        header: FileHeader,
    ) -> Result<Prepared<ScanPoint>> {
        let settings = &ctx.settings;
        let switch_config = settings
            .switch_card
            .as_ref()
            .ok_or_else(|| anyhow!("No switch card configured"))?;
        let lcr_config = settings
            .lcr_meter
            .as_ref()
            .ok_or_else(|| anyhow!("No LCR meter configured"))?;

        let mut switch = instruments
            .channel_switch(switch_config)
            .await
            .context("Opening the switch card failed")?;
        switch.reboot().await?;
        switch
            .set_measurement_type(&switch_config.measurement_type)
            .await?;
        switch.set_display_mode(&switch_config.display_mode).await?;
        let measurement_type = switch.measurement_type().await?;
        let display_mode = switch.display_mode().await?;

        let probecard_temperature = switch.probecard_temperature().await?;
        let matrix_temperature = switch.matrix_temperature().await?;
        let probecard_humidity = switch.probecard_humidity().await?;
        let matrix_humidity = switch.matrix_humidity().await?;
        info!(
            "Switch card: {} routing, display {}; probe card {:.1} C, matrix {:.1} C",
            measurement_type, display_mode, probecard_temperature, matrix_temperature
        );
        let environment = HashMap::from([
            ("probecard_temperature_c".to_string(), probecard_temperature),
            ("matrix_temperature_c".to_string(), matrix_temperature),
            ("probecard_humidity_pct".to_string(), probecard_humidity),
            ("matrix_humidity_pct".to_string(), matrix_humidity),
        ]);

        let mut meter = instruments
            .impedance_meter(lcr_config)
            .await
            .context("Opening the LCR meter failed")?;
        let lcr = configure_lcr_meter(meter.as_mut(), lcr_config, LcrFunction::Rx)
            .await
            .context("Configuring the LCR meter failed")?;

        let sweep = &settings.sweep;
        let header = header
            .setting("LCR AC voltage", lcr.ac_voltage, "V")
            .setting("LCR frequency", lcr.frequency, "Hz")
            .text("LCR function", lcr.function.as_str())
            .text("Switch measurement type", &measurement_type)
            .text("Switch display mode", &display_mode)
            .setting("Probe card temperature", probecard_temperature, "C")
            .setting("Matrix temperature", matrix_temperature, "C")
            .setting("Probe card humidity", probecard_humidity, "%")
            .setting("Matrix humidity", matrix_humidity, "%")
            .setting("Channel delay", sweep.channel_delay_s, "s")
            .setting("Dwell time", sweep.dwell_time_s, "s")
            .setting("Sample interval", sweep.sample_interval_s, "s")
            .setting(
                "Total duration",
                sweep.total_duration_s.unwrap_or_default(),
                "s",
            )
            .text(
                "Cells",
                &sweep
                    .cells
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            );

        self.cells = sweep.cells.clone();
        Ok(Prepared {
            point: ScanPoint::new(
                meter,
                switch,
                sweep.cells.clone(),
                lcr.frequency,
                Dwell {
                    channel_delay: sweep.channel_delay()?,
                    dwell_time: sweep.dwell_time()?,
                    sample_interval: sweep.sample_interval()?,
                },
            ),
            header,
            environment,
        })
    }

    fn plots(&self, rows: &[ScanRow], file_id: &str) -> Vec<PlotData> {
        let mut plots = vec![
            PlotData {
                file_name: format!("cv_all_channels_{}.svg", file_id),
                title: format!("C-V all channels {}", file_id),
                x_label: "Voltage [V]",
                y_label: "Capacitance [pF]",
                x: rows.iter().map(|r| r.measured_voltage).collect(),
                y: rows.iter().map(|r| r.capacitance_pf).collect(),
                errors: None,
            },
            PlotData {
                file_name: format!("iv_all_channels_{}.svg", file_id),
                title: format!("Total current all channels {}", file_id),
                x_label: "Voltage [V]",
                y_label: "Current [A]",
                x: rows.iter().map(|r| r.measured_voltage).collect(),
                y: rows.iter().map(|r| r.total_current).collect(),
                errors: None,
            },
        ];

        if self.cells.len() > 2 {
            if let Some(channel) = Self::representative_channel(&self.cells) {
                let selected: Vec<&ScanRow> =
                    rows.iter().filter(|r| r.channel == channel).collect();
                plots.push(PlotData {
                    file_name: format!("cv_channel_{}_{}.svg", channel, file_id),
                    title: format!("C-V channel {} {}", channel, file_id),
                    x_label: "Voltage [V]",
                    y_label: "Capacitance [pF]",
                    x: selected.iter().map(|r| r.measured_voltage).collect(),
                    y: selected.iter().map(|r| r.capacitance_pf).collect(),
                    errors: None,
                });
                plots.push(PlotData {
                    file_name: format!("1c2v_channel_{}_{}.svg", channel, file_id),
                    title: format!("1/C^2 channel {} {}", channel, file_id),
                    x_label: "Voltage [V]",
                    y_label: "1/C^2 [1/F^2]",
                    x: selected.iter().map(|r| r.measured_voltage).collect(),
                    y: selected
                        .iter()
                        .map(|r| (r.capacitance_pf * 1e-12).powi(-2))
                        .collect(),
                    errors: None,
                });
            }
        }
        plots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockLcrMeter, MockPowerSupply, MockSwitchCard};

    fn dwell() -> Dwell {
        Dwell {
            channel_delay: Duration::ZERO,
            dwell_time: Duration::ZERO,
            sample_interval: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_one_sample_per_cell_without_dwell() {
        let switch = MockSwitchCard::new();
        let switch_log = switch.log();
        let reactance = -1.0 / (2.0 * std::f64::consts::PI * 1e4 * 100e-12);
        let meter = MockLcrMeter::new().with_readings([(10.0, reactance); 3]);
        let mut point = ScanPoint::new(
            Box::new(meter),
            Box::new(switch),
            vec![3, 7, 11],
            1e4,
            dwell(),
        );
        let mut supply = MockPowerSupply::new();
        supply.set_output(true).await.unwrap();
        let mut rows = Vec::new();

        point
            .measure(&mut supply, -5.0, &CancelToken::new(), &mut rows)
            .await
            .unwrap();

        assert_eq!(rows.iter().map(|r| r.channel).collect::<Vec<_>>(), vec![3, 7, 11]);
        assert!((rows[0].capacitance_pf - 100.0).abs() < 1e-9);
        assert_eq!(rows[0].resistance, 10.0);
        assert_eq!(
            switch_log.commands(),
            vec!["channel 3", "channel 7", "channel 11"]
        );
    }

    #[tokio::test]
    async fn test_dwell_takes_repeated_samples() {
        let mut point = ScanPoint::new(
            Box::new(MockLcrMeter::new()),
            Box::new(MockSwitchCard::new()),
            vec![1],
            1e3,
            Dwell {
                dwell_time: Duration::from_millis(30),
                sample_interval: Duration::from_millis(5),
                ..dwell()
            },
        );
        let mut supply = MockPowerSupply::new();
        let mut rows = Vec::new();

        point
            .measure(&mut supply, 0.0, &CancelToken::new(), &mut rows)
            .await
            .unwrap();

        assert!(rows.len() >= 2);
        assert!(rows.windows(2).all(|w| w[0].time <= w[1].time));
    }

    #[test]
    fn test_representative_channel() {
        assert_eq!(ScanCv::representative_channel(&[5, 6, 7]), Some(5));
        let cells: Vec<u32> = (1..=24).collect();
        assert_eq!(ScanCv::representative_channel(&cells), Some(3));
        assert_eq!(ScanCv::representative_channel(&[]), None);
    }

    #[test]
    fn test_channel_plots_only_for_more_than_two_cells() {
        let row = ScanRow {
            nominal_voltage: -1.0,
            measured_voltage: -1.0,
            time: 0.0,
            channel: 1,
            resistance: 0.0,
            reactance: -1.0,
            capacitance_pf: 100.0,
            total_current: 0.0,
        };

        let two = ScanCv { cells: vec![1, 2] };
        assert_eq!(two.plots(&[row], "W1").len(), 2);

        let three = ScanCv {
            cells: vec![1, 2, 3],
        };
        let names: Vec<_> = three
            .plots(&[row], "W1")
            .into_iter()
            .map(|p| p.file_name)
            .collect();
        assert_eq!(
            names,
            vec![
                "cv_all_channels_W1.svg",
                "iv_all_channels_W1.svg",
                "cv_channel_1_W1.svg",
                "1c2v_channel_1_W1.svg",
            ]
        );
    }
}
