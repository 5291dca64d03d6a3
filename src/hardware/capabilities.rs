//! Instrument Capabilities
//!
//! Each bench instrument plays one role in a measurement, and each role is a small trait:
//!
//! - `PowerSource` - bias supply / source meter (sets a voltage, reads voltage and current)
//! - `ImpedanceMeter` - LCR meter (AC test signal, returns a primary/secondary pair)
//! - `ChannelSwitch` - switch matrix routing one cell of the wafer to the instruments
//!
//! Measurement code only talks to these traits, so the real drivers and the simulated
//! instruments in [`crate::hardware::mock`] are interchangeable.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Takes `&mut self`: a run owns each instrument exclusively, nothing is shared
//! - Uses anyhow::Result for errors
//! - Changes physical hardware state on almost every call

use crate::config::Terminal;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What the source meter drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFunction {
    /// Source a voltage
    Voltage,
    /// Source a current
    Current,
}

/// What the source meter measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenseFunction {
    /// Measure voltage
    Voltage,
    /// Measure current
    Current,
    /// Measure resistance
    Resistance,
}

/// How a voltage change is spread out over time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampProfile {
    /// Largest voltage change per step, in V
    pub step: f64,
    /// Wait after each step
    pub delay: Duration,
}

impl Default for RampProfile {
    fn default() -> Self {
        Self {
            step: 5.0,
            delay: Duration::from_millis(100),
        }
    }
}

/// Most setpoints a single ramp is split into.
pub const MAX_RAMP_STEPS: usize = 100_000;

/// Intermediate setpoints from `from` to `to`, at most `step` apart, ending exactly at `to`.
///
/// Returns an empty list when already at the target. A step too small for the span is widened
/// so the ramp never exceeds [`MAX_RAMP_STEPS`] setpoints.
pub fn ramp_steps(from: f64, to: f64, step: f64) -> Vec<f64> {
    let span = to - from;
    if span == 0.0 {
        return Vec::new();
    }
    let step = step.abs();
    if !(step > 0.0) || !span.is_finite() {
        return vec![to];
    }

    let exact = (span.abs() / step).ceil();
    let (count, step) = if exact > MAX_RAMP_STEPS as f64 {
        (MAX_RAMP_STEPS, span.abs() / MAX_RAMP_STEPS as f64)
    } else {
        (exact as usize, step)
    };
    let direction = span.signum();
    let mut steps: Vec<f64> = (1..count)
        .map(|i| from + direction * step * i as f64)
        .collect();
    steps.push(to);
    steps
}

/// Capability: Bias Supply
///
/// Source meters used to bias the device under test.
///
/// # Contract
/// - Voltages in V, currents in A
/// - `set_voltage` jumps directly; use `ramp_voltage` whenever the output may be on
/// - `read_*` trigger a fresh measurement
#[async_trait]
pub trait PowerSource: Send {
    /// Return the instrument to its power-on defaults
    async fn reset(&mut self) -> Result<()>;

    /// Select the source function
    async fn set_source(&mut self, function: SourceFunction) -> Result<()>;

    /// Select the sense function
    async fn set_sense(&mut self, function: SenseFunction) -> Result<()>;

    /// Set the current compliance in A
    async fn set_current_limit(&mut self, amps: f64) -> Result<()>;

    /// Set the output voltage immediately
    async fn set_voltage(&mut self, volts: f64) -> Result<()>;

    /// Select front or rear terminals
    async fn set_terminal(&mut self, terminal: Terminal) -> Result<()>;

    /// Set the integration time in power line cycles
    async fn set_nplc(&mut self, nplc: f64) -> Result<()>;

    /// Enable or disable the output
    async fn set_output(&mut self, enabled: bool) -> Result<()>;

    /// Voltage protection limit in V
    async fn voltage_limit(&mut self) -> Result<f64>;

    /// Current compliance in A
    async fn current_limit(&mut self) -> Result<f64>;

    /// Programmed voltage in V
    async fn voltage_setpoint(&mut self) -> Result<f64>;

    /// Measure the output voltage in V
    async fn read_voltage(&mut self) -> Result<f64>;

    /// Measure the output current in A
    async fn read_current(&mut self) -> Result<f64>;

    /// Move the output to `target` in steps of at most `ramp.step`
    async fn ramp_voltage(&mut self, target: f64, ramp: &RampProfile) -> Result<()> {
        let start = self.voltage_setpoint().await?;
        for setpoint in ramp_steps(start, target, ramp.step) {
            self.set_voltage(setpoint).await?;
            if !ramp.delay.is_zero() {
                tokio::time::sleep(ramp.delay).await;
            }
        }
        Ok(())
    }
}

/// Measurement functions of an LCR meter.
///
/// The first quantity of each pair is the primary reading, the second the secondary one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LcrFunction {
    /// Parallel capacitance, parallel resistance
    CpRp,
    /// Parallel capacitance, dissipation factor
    CpD,
    /// Series capacitance, series resistance
    CsRs,
    /// Series capacitance, dissipation factor
    CsD,
    /// Resistance, reactance
    Rx,
    /// Impedance magnitude, phase in degrees
    Ztd,
}

impl LcrFunction {
    /// Mnemonic used on the bus
    pub fn as_str(&self) -> &'static str {
        match self {
            LcrFunction::CpRp => "CPRP",
            LcrFunction::CpD => "CPD",
            LcrFunction::CsRs => "CSRS",
            LcrFunction::CsD => "CSD",
            LcrFunction::Rx => "RX",
            LcrFunction::Ztd => "ZTD",
        }
    }
}

impl fmt::Display for LcrFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LcrFunction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "CPRP" => Ok(LcrFunction::CpRp),
            "CPD" => Ok(LcrFunction::CpD),
            "CSRS" => Ok(LcrFunction::CsRs),
            "CSD" => Ok(LcrFunction::CsD),
            "RX" => Ok(LcrFunction::Rx),
            "ZTD" => Ok(LcrFunction::Ztd),
            other => Err(anyhow!("Unknown LCR function '{}'", other)),
        }
    }
}

/// Capability: Impedance Measurement
///
/// LCR meters measuring the device under test with a small AC signal on top of the bias.
#[async_trait]
pub trait ImpedanceMeter: Send {
    /// Return the instrument to its power-on defaults
    async fn reset(&mut self) -> Result<()>;

    /// AC test signal amplitude in V
    async fn set_ac_voltage(&mut self, volts: f64) -> Result<()>;

    /// AC test signal frequency in Hz
    async fn set_frequency(&mut self, hertz: f64) -> Result<()>;

    /// Measurement function
    async fn set_function(&mut self, function: LcrFunction) -> Result<()>;

    /// Programmed AC amplitude in V
    async fn ac_voltage(&mut self) -> Result<f64>;

    /// Programmed frequency in Hz
    async fn frequency(&mut self) -> Result<f64>;

    /// Trigger one measurement and return (primary, secondary)
    async fn measure(&mut self) -> Result<(f64, f64)>;
}

/// Capability: Channel Switching
///
/// Switch matrices that connect one cell of a segmented sensor to the instruments at a time.
#[async_trait]
pub trait ChannelSwitch: Send {
    /// Restart the controller
    async fn reboot(&mut self) -> Result<()>;

    /// Route the matrix for "CV" or "IV" measurements
    async fn set_measurement_type(&mut self, kind: &str) -> Result<()>;

    /// Switch the front display on or off
    async fn set_display_mode(&mut self, mode: &str) -> Result<()>;

    /// Current routing
    async fn measurement_type(&mut self) -> Result<String>;

    /// Current display mode
    async fn display_mode(&mut self) -> Result<String>;

    /// Probe card temperature in °C
    async fn probecard_temperature(&mut self) -> Result<f64>;

    /// Switch matrix temperature in °C
    async fn matrix_temperature(&mut self) -> Result<f64>;

    /// Probe card relative humidity in %
    async fn probecard_humidity(&mut self) -> Result<f64>;

    /// Switch matrix relative humidity in %
    async fn matrix_humidity(&mut self) -> Result<f64>;

    /// Connect `channel` to the instruments
    async fn open_channel(&mut self, channel: u32) -> Result<()>;
}

/// Parse a numeric reply, tolerating surrounding whitespace and a leading `+`.
pub(crate) fn parse_number(reply: &str, what: &str) -> Result<f64> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        bail!("Empty reply for {}", what);
    }
    trimmed
        .trim_start_matches('+')
        .parse::<f64>()
        .map_err(|_| anyhow!("Failed to parse {} from reply '{}'", what, trimmed))
}
