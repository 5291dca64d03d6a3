//! Keithley 2410 SourceMeter Driver
//!
//! Reference: Keithley Series 2400 SourceMeter User's Manual
//!
//! Protocol Overview:
//! - Format: SCPI over GPIB (or RS-232)
//! - Terminator: LF (\n)
//! - Readings: `:READ?` returns the elements selected with `:FORM:ELEM`, comma separated
//!
//! The driver selects `VOLT,CURR` as reading elements whenever the instrument is reset, so every
//! `:READ?` reply is a `voltage,current` pair.
//!
//! # Example Usage
//!
//! ```no_run
//! use semi_daq::hardware::keithley_2410::Keithley2410;
//! use semi_daq::hardware::capabilities::{PowerSource, RampProfile};
//! use semi_daq::hardware::mock::MockTransport;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut smu = Keithley2410::new(Box::new(MockTransport::new("smu")));
//!     smu.reset().await?;
//!     smu.set_current_limit(5e-4).await?;
//!     smu.set_output(true).await?;
//!     smu.ramp_voltage(-100.0, &RampProfile::default()).await?;
//!     Ok(())
//! }
//! ```

use crate::config::Terminal;
use crate::hardware::capabilities::{parse_number, PowerSource, SenseFunction, SourceFunction};
use crate::hardware::transport::{identify, Transport};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;

/// Driver for the Keithley 2410 high-voltage SourceMeter
pub struct Keithley2410 {
    transport: Box<dyn Transport>,
}

impl Keithley2410 {
    /// Wrap an open transport
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Wrap an open transport and log the instrument identification
    pub async fn connect(transport: Box<dyn Transport>) -> Result<Self> {
        let mut driver = Self::new(transport);
        identify(driver.transport.as_mut()).await?;
        Ok(driver)
    }

    async fn send(&mut self, command: &str) -> Result<()> {
        self.transport
            .write(command)
            .await
            .with_context(|| format!("Keithley 2410 command '{}' failed", command))
    }

    async fn query_number(&mut self, command: &str, what: &str) -> Result<f64> {
        let reply = self
            .transport
            .query(command)
            .await
            .with_context(|| format!("Keithley 2410 query '{}' failed", command))?;
        parse_number(&reply, what)
    }

    async fn read_pair(&mut self) -> Result<(f64, f64)> {
        let reply = self
            .transport
            .query(":READ?")
            .await
            .context("Keithley 2410 reading failed")?;
        parse_reading(&reply)
    }
}

/// Parse a `voltage,current` reading.
fn parse_reading(reply: &str) -> Result<(f64, f64)> {
    let mut fields = reply.trim().split(',');
    let voltage = fields
        .next()
        .ok_or_else(|| anyhow!("Empty Keithley 2410 reading"))?;
    let current = fields
        .next()
        .ok_or_else(|| anyhow!("Keithley 2410 reading '{}' has no current", reply.trim()))?;
    Ok((
        parse_number(voltage, "voltage")?,
        parse_number(current, "current")?,
    ))
}

fn format_value(value: f64) -> String {
    format!("{:E}", value)
}

#[async_trait]
impl PowerSource for Keithley2410 {
    async fn reset(&mut self) -> Result<()> {
        self.send("*RST").await?;
        self.send(":FORM:ELEM VOLT,CURR").await
    }

    async fn set_source(&mut self, function: SourceFunction) -> Result<()> {
        let name = match function {
            SourceFunction::Voltage => "VOLT",
            SourceFunction::Current => "CURR",
        };
        self.send(&format!(":SOUR:FUNC {}", name)).await
    }

    async fn set_sense(&mut self, function: SenseFunction) -> Result<()> {
        let name = match function {
            SenseFunction::Voltage => "VOLT",
            SenseFunction::Current => "CURR",
            SenseFunction::Resistance => "RES",
        };
        self.send(&format!(":SENS:FUNC '{}'", name)).await
    }

    async fn set_current_limit(&mut self, amps: f64) -> Result<()> {
        self.send(&format!(":SENS:CURR:PROT {}", format_value(amps)))
            .await
    }

    async fn set_voltage(&mut self, volts: f64) -> Result<()> {
        self.send(&format!(":SOUR:VOLT:LEV {}", format_value(volts)))
            .await
    }

    async fn set_terminal(&mut self, terminal: Terminal) -> Result<()> {
        let name = match terminal {
            Terminal::Front => "FRON",
            Terminal::Rear => "REAR",
        };
        self.send(&format!(":ROUT:TERM {}", name)).await
    }

    async fn set_nplc(&mut self, nplc: f64) -> Result<()> {
        self.send(&format!(":SENS:CURR:NPLC {}", format_value(nplc)))
            .await
    }

    async fn set_output(&mut self, enabled: bool) -> Result<()> {
        self.send(if enabled { ":OUTP ON" } else { ":OUTP OFF" })
            .await
    }

    async fn voltage_limit(&mut self) -> Result<f64> {
        self.query_number(":SOUR:VOLT:PROT:LEV?", "voltage limit")
            .await
    }

    async fn current_limit(&mut self) -> Result<f64> {
        self.query_number(":SENS:CURR:PROT?", "current limit").await
    }

    async fn voltage_setpoint(&mut self) -> Result<f64> {
        self.query_number(":SOUR:VOLT:LEV?", "voltage setpoint")
            .await
    }

    async fn read_voltage(&mut self) -> Result<f64> {
        Ok(self.read_pair().await?.0)
    }

    async fn read_current(&mut self) -> Result<f64> {
        Ok(self.read_pair().await?.1)
    }
}
