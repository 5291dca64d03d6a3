//! Bias sweep engine
//!
//! Every measurement is the same loop around a different point measurement:
//!
//! ```text
//! for each voltage in the list (repeated until the total duration, for scans):
//!     ramp the supply to the voltage
//!     wait the voltage delay
//!     measure the point (frequencies, cells, samples ...)
//! ```
//!
//! The loop never returns early with an error. Cancellation and instrument failures end it with
//! a [`SweepStatus`], and the rows gathered so far are handed back so they can still be saved.
//! [`teardown`] must run afterwards in every case.

use crate::config::{PowerSupplyConfig, Settings};
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{PowerSource, RampProfile, SenseFunction, SourceFunction};
use crate::measurement::cancel::CancelToken;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Voltage schedule of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    /// Bias voltages, visited in order
    pub voltages: Vec<f64>,
    /// Wait after reaching each voltage
    pub voltage_delay: Duration,
    /// How voltage changes are stepped
    pub ramp: RampProfile,
    /// Wait at 0 V before the output goes off
    pub settle_delay: Duration,
    /// Repeat the voltage list until this much time has passed
    pub repeat_for: Option<Duration>,
}

impl SweepPlan {
    /// Plan from validated settings
    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        let sweep = &settings.sweep;
        Ok(Self {
            voltages: settings.voltages()?,
            voltage_delay: sweep.voltage_delay()?,
            ramp: RampProfile {
                step: sweep.ramp_step_v,
                delay: sweep.ramp_delay()?,
            },
            settle_delay: sweep.settle_delay()?,
            repeat_for: sweep.total_duration()?,
        })
    }
}

/// What is measured at each bias voltage.
#[async_trait]
pub trait PointMeasurement: Send {
    /// One data file row
    type Row: Send;

    /// Measure at the current bias, appending to `rows`.
    ///
    /// Implementations return `Ok(())` early once `cancel` is triggered; rows already appended
    /// are kept.
    async fn measure(
        &mut self,
        power: &mut dyn PowerSource,
        nominal_voltage: f64,
        cancel: &CancelToken,
        rows: &mut Vec<Self::Row>,
    ) -> Result<()>;
}

/// How a sweep ended.
#[derive(Debug)]
pub enum SweepStatus {
    /// Every voltage was measured
    Completed,
    /// The operator stopped the sweep
    Cancelled,
    /// An instrument failed
    Failed(anyhow::Error),
}

impl SweepStatus {
    /// Whether the sweep ran to the end
    pub fn is_completed(&self) -> bool {
        matches!(self, SweepStatus::Completed)
    }
}

/// Rows gathered by a sweep and how it ended.
#[derive(Debug)]
pub struct SweepOutcome<R> {
    /// Rows in measurement order
    pub rows: Vec<R>,
    /// End state
    pub status: SweepStatus,
    /// Passes over the voltage list started
    pub passes: usize,
}

impl<R> SweepOutcome<R> {
    /// Outcome of a sweep that failed before measuring anything
    pub fn failed(error: anyhow::Error) -> Self {
        Self {
            rows: Vec::new(),
            status: SweepStatus::Failed(error),
            passes: 0,
        }
    }
}

/// Bring the supply into a known state and switch the output on at 0 V.
///
/// Fails before enabling the output if a voltage in `voltages` exceeds the instrument's own
/// protection limit.
pub async fn configure_power_source(
    power: &mut dyn PowerSource,
    config: &PowerSupplyConfig,
    voltages: &[f64],
) -> Result<SupplyLimits> {
    power.reset().await?;
    power.set_source(SourceFunction::Voltage).await?;
    power.set_sense(SenseFunction::Current).await?;
    power.set_current_limit(config.current_limit).await?;
    power.set_voltage(0.0).await?;
    power.set_terminal(config.terminal).await?;
    if let Some(nplc) = config.nplc {
        power.set_nplc(nplc).await?;
    }

    let limits = SupplyLimits {
        voltage: power.voltage_limit().await?,
        current: power.current_limit().await?,
    };
    if let Some(v) = voltages.iter().find(|v| v.abs() > limits.voltage) {
        bail!(
            "Sweep voltage {} V exceeds the supply protection limit of {} V",
            v,
            limits.voltage
        );
    }

    power.set_output(true).await?;
    info!(
        "Power supply on: voltage limit {:.2E} V, current limit {:.2E} A",
        limits.voltage, limits.current
    );
    Ok(limits)
}

/// Protection limits read back from the supply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupplyLimits {
    /// Voltage limit in V
    pub voltage: f64,
    /// Current compliance in A
    pub current: f64,
}

/// Visit every voltage of `plan`, calling `point` at each.
pub async fn run_sweep<P: PointMeasurement + ?Sized>(
    power: &mut dyn PowerSource,
    plan: &SweepPlan,
    point: &mut P,
    cancel: &CancelToken,
) -> SweepOutcome<P::Row> {
    let started = Instant::now();
    let mut rows = Vec::new();
    let mut passes = 0;

    let status = loop {
        passes += 1;
        match sweep_pass(power, plan, point, cancel, &mut rows).await {
            Ok(true) => {}
            Ok(false) => break SweepStatus::Cancelled,
            Err(e) => break SweepStatus::Failed(e),
        }
        match plan.repeat_for {
            Some(total) if started.elapsed() < total => {
                info!(
                    "Pass {} finished after {:.0} s, repeating",
                    passes,
                    started.elapsed().as_secs_f64()
                );
            }
            _ => break SweepStatus::Completed,
        }
    };

    match &status {
        SweepStatus::Completed => info!("Sweep completed: {} rows", rows.len()),
        SweepStatus::Cancelled => error!(
            "Operator cancellation ({}) after {} rows. Ramping down voltage and shutting down.",
            cancel.reason().unwrap_or_else(|| "unknown".to_string()),
            rows.len()
        ),
        SweepStatus::Failed(e) => error!("Sweep aborted after {} rows: {:#}", rows.len(), e),
    }

    SweepOutcome {
        rows,
        status,
        passes,
    }
}

/// One pass over the voltage list. `Ok(false)` when cancelled.
async fn sweep_pass<P: PointMeasurement + ?Sized>(
    power: &mut dyn PowerSource,
    plan: &SweepPlan,
    point: &mut P,
    cancel: &CancelToken,
    rows: &mut Vec<P::Row>,
) -> Result<bool> {
    let total = plan.voltages.len();
    for (index, &voltage) in plan.voltages.iter().enumerate() {
        if cancel.is_cancelled() {
            return Ok(false);
        }

        info!("Voltage {}/{}: {} V", index + 1, total, voltage);
        power
            .ramp_voltage(voltage, &plan.ramp)
            .await
            .with_context(|| format!("Ramping to {} V failed", voltage))?;
        if !cancel.sleep(plan.voltage_delay).await {
            return Ok(false);
        }

        point
            .measure(power, voltage, cancel, rows)
            .await
            .with_context(|| format!("Measurement at {} V failed", voltage))?;
        if cancel.is_cancelled() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Ramp to 0 V, set 0 V, settle, switch the output off and reset the supply.
///
/// Each step is attempted once, even after an earlier one failed; the failures are collected.
/// The explicit 0 V setpoint is sent even when the ramp had nothing to do. The settle wait is
/// skipped when either failed.
pub async fn teardown(
    power: &mut dyn PowerSource,
    ramp: &RampProfile,
    settle_delay: Duration,
) -> AppResult<()> {
    let mut failures = Vec::new();

    info!("Ramping down to 0 V");
    if let Err(e) = power.ramp_voltage(0.0, ramp).await {
        error!("Ramp to 0 V failed: {:#}", e);
        failures.push(format!("ramp to zero: {:#}", e));
    }

    if let Err(e) = power.set_voltage(0.0).await {
        error!("Setting 0 V failed: {:#}", e);
        failures.push(format!("zero voltage: {:#}", e));
    }

    if failures.is_empty() && !settle_delay.is_zero() {
        info!("Settling for {:.0} s", settle_delay.as_secs_f64());
        tokio::time::sleep(settle_delay).await;
    }

    if let Err(e) = power.set_output(false).await {
        error!("Switching the output off failed: {:#}", e);
        failures.push(format!("output off: {:#}", e));
    }

    if let Err(e) = power.reset().await {
        warn!("Supply reset failed: {:#}", e);
        failures.push(format!("reset: {:#}", e));
    }

    if failures.is_empty() {
        info!("Power supply off");
        Ok(())
    } else {
        Err(DaqError::ShutdownFailed(failures))
    }
}
