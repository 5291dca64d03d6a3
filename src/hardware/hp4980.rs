//! Keysight (HP) E4980A Precision LCR Meter Driver
//!
//! Protocol: SCPI over GPIB, LF terminated.
//!
//! The meter is put on bus triggering after a reset; `*TRG` then performs one measurement and
//! returns `primary,secondary,status`. A status of 0 is a normal measurement, -1 means no data,
//! positive values flag a bridge or source problem for that reading.

use crate::hardware::capabilities::{parse_number, ImpedanceMeter, LcrFunction};
use crate::hardware::transport::{identify, Transport};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tracing::warn;

/// Driver for the E4980A LCR meter
pub struct Hp4980 {
    transport: Box<dyn Transport>,
}

impl Hp4980 {
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
            .with_context(|| format!("E4980A command '{}' failed", command))
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        self.transport
            .query(command)
            .await
            .with_context(|| format!("E4980A query '{}' failed", command))
    }
}

/// Parse a `primary,secondary,status` measurement.
fn parse_measurement(reply: &str) -> Result<(f64, f64)> {
    let fields: Vec<&str> = reply.trim().split(',').collect();
    if fields.len() < 2 {
        bail!("Malformed E4980A measurement '{}'", reply.trim());
    }
    let primary = parse_number(fields[0], "primary parameter")?;
    let secondary = parse_number(fields[1], "secondary parameter")?;

    if let Some(status) = fields.get(2) {
        let status = parse_number(status, "measurement status")? as i32;
        match status {
            0 => {}
            -1 => return Err(anyhow!("E4980A returned no measurement data")),
            code => warn!("E4980A measurement status {} (reading kept)", code),
        }
    }

    Ok((primary, secondary))
}

#[async_trait]
impl ImpedanceMeter for Hp4980 {
    async fn reset(&mut self) -> Result<()> {
        self.send("*RST").await?;
        self.send(":FORM:DATA ASC").await?;
        self.send(":TRIG:SOUR BUS").await
    }

    async fn set_ac_voltage(&mut self, volts: f64) -> Result<()> {
        self.send(&format!(":VOLT:LEV {:E}", volts)).await
    }

    async fn set_frequency(&mut self, hertz: f64) -> Result<()> {
        self.send(&format!(":FREQ:CW {:E}", hertz)).await
    }

    async fn set_function(&mut self, function: LcrFunction) -> Result<()> {
        self.send(&format!(":FUNC:IMP:TYPE {}", function.as_str()))
            .await
    }

    async fn ac_voltage(&mut self) -> Result<f64> {
        let reply = self.query(":VOLT:LEV?").await?;
        parse_number(&reply, "AC voltage")
    }

    async fn frequency(&mut self) -> Result<f64> {
        let reply = self.query(":FREQ:CW?").await?;
        parse_number(&reply, "frequency")
    }

    async fn measure(&mut self) -> Result<(f64, f64)> {
        let reply = self.query("*TRG").await?;
        parse_measurement(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockTransport;

    #[test]
    fn test_parse_measurement() {
        let (cp, rp) = parse_measurement("+1.23456E-10,+4.50000E+06,+0").unwrap();
        assert_eq!(cp, 1.23456e-10);
        assert_eq!(rp, 4.5e6);

        // Overload status keeps the reading
        assert!(parse_measurement("+1.0E-10,+1.0E+06,+3").is_ok());
        assert!(parse_measurement("+9.9E+37,+9.9E+37,-1").is_err());
        assert!(parse_measurement("garbage").is_err());
    }

    #[tokio::test]
    async fn test_configuration_commands() {
        let transport = MockTransport::new("lcr")
            .with_reply(":FREQ:CW?", "+1.00000E+04")
            .with_reply(":VOLT:LEV?", "+1.00000E+00");
        let log = transport.log();
        let mut lcr = Hp4980::new(Box::new(transport));

        lcr.reset().await.unwrap();
        lcr.set_ac_voltage(1.0).await.unwrap();
        lcr.set_frequency(10_000.0).await.unwrap();
        lcr.set_function(LcrFunction::CpRp).await.unwrap();
        assert_eq!(lcr.frequency().await.unwrap(), 10_000.0);
        assert_eq!(lcr.ac_voltage().await.unwrap(), 1.0);

        assert_eq!(
            log.commands(),
            vec![
                "*RST",
                ":FORM:DATA ASC",
                ":TRIG:SOUR BUS",
                ":VOLT:LEV 1E0",
                ":FREQ:CW 1E4",
                ":FUNC:IMP:TYPE CPRP",
                ":FREQ:CW?",
                ":VOLT:LEV?",
            ]
        );
    }

    #[tokio::test]
    async fn test_measure_triggers_once_per_reading() {
        let transport = MockTransport::new("lcr")
            .queue_reply("*TRG", "+1.0E-10,+2.0E+06,+0")
            .queue_reply("*TRG", "+1.1E-10,+2.1E+06,+0");
        let log = transport.log();
        let mut lcr = Hp4980::new(Box::new(transport));

        assert_eq!(lcr.measure().await.unwrap(), (1.0e-10, 2.0e6));
        assert_eq!(lcr.measure().await.unwrap(), (1.1e-10, 2.1e6));
        assert_eq!(log.count("*TRG"), 2);
    }
}
