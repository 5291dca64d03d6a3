//! Switch Matrix Controller Driver
//!
//! Protocol Overview:
//! - Format: plain ASCII over a serial port, LF terminated (not SCPI)
//! - Settings: `SET:<NAME> <value>` (no reply)
//! - Queries: `GET:<NAME> ?` (one reply line)
//!
//! | Setting | Command |
//! |---------|---------|
//! | Measurement routing | `SET:MEAS_TYPE CV` / `GET:MEAS_TYPE ?` |
//! | Front display | `SET:DISPLAY_MODE OFF` / `GET:DISPLAY_MODE ?` |
//! | Active channel | `SET:CHANNEL 12` / `GET:CHANNEL ?` |
//! | Environment | `GET:TEMP PC ?`, `GET:TEMP SC ?`, `GET:HUMID PC ?`, `GET:HUMID SC ?` |
//!
//! `PC` is the probe card sensor, `SC` the sensor on the switch card itself.

use crate::hardware::capabilities::{parse_number, ChannelSwitch};
use crate::hardware::transport::{identify, Transport};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::debug;

/// Routings the matrix knows.
pub const MEASUREMENT_TYPES: [&str; 2] = ["CV", "IV"];

/// Display modes the controller knows.
pub const DISPLAY_MODES: [&str; 2] = ["ON", "OFF"];

/// Driver for the switch matrix controller
pub struct SwitchCard {
    transport: Box<dyn Transport>,
}

impl SwitchCard {
    /// Wrap an open transport
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Wrap an open transport and log the controller identification
    pub async fn connect(transport: Box<dyn Transport>) -> Result<Self> {
        let mut driver = Self::new(transport);
        identify(driver.transport.as_mut()).await?;
        Ok(driver)
    }

    async fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let command = format!("SET:{} {}", name, value);
        self.transport
            .write(&command)
            .await
            .with_context(|| format!("Switch card command '{}' failed", command))
    }

    async fn get(&mut self, name: &str) -> Result<String> {
        let command = format!("GET:{} ?", name);
        let reply = self
            .transport
            .query(&command)
            .await
            .with_context(|| format!("Switch card query '{}' failed", command))?;
        Ok(reply.trim().to_string())
    }
}

fn normalized(value: &str, allowed: &[&str], what: &str) -> Result<String> {
    let upper = value.trim().to_uppercase();
    if !allowed.contains(&upper.as_str()) {
        bail!(
            "Unknown switch card {} '{}', expected one of: {}",
            what,
            value,
            allowed.join(", ")
        );
    }
    Ok(upper)
}

#[async_trait]
impl ChannelSwitch for SwitchCard {
    async fn reboot(&mut self) -> Result<()> {
        self.transport
            .write("*RST")
            .await
            .context("Switch card reboot failed")?;
        // The controller answers again once it is back up.
        identify(self.transport.as_mut()).await?;
        Ok(())
    }

    async fn set_measurement_type(&mut self, kind: &str) -> Result<()> {
        let kind = normalized(kind, &MEASUREMENT_TYPES, "measurement type")?;
        self.set("MEAS_TYPE", &kind).await
    }

    async fn set_display_mode(&mut self, mode: &str) -> Result<()> {
        let mode = normalized(mode, &DISPLAY_MODES, "display mode")?;
        self.set("DISPLAY_MODE", &mode).await
    }

    async fn measurement_type(&mut self) -> Result<String> {
        self.get("MEAS_TYPE").await
    }

    async fn display_mode(&mut self) -> Result<String> {
        self.get("DISPLAY_MODE").await
    }

    async fn probecard_temperature(&mut self) -> Result<f64> {
        let reply = self.get("TEMP PC").await?;
        parse_number(&reply, "probe card temperature")
    }

    async fn matrix_temperature(&mut self) -> Result<f64> {
        let reply = self.get("TEMP SC").await?;
        parse_number(&reply, "switch card temperature")
    }

    async fn probecard_humidity(&mut self) -> Result<f64> {
        let reply = self.get("HUMID PC").await?;
        parse_number(&reply, "probe card humidity")
    }

    async fn matrix_humidity(&mut self) -> Result<f64> {
        let reply = self.get("HUMID SC").await?;
        parse_number(&reply, "switch card humidity")
    }

    async fn open_channel(&mut self, channel: u32) -> Result<()> {
        self.set("CHANNEL", &channel.to_string()).await?;
        let reply = self.get("CHANNEL").await?;
        let active = parse_number(&reply, "active channel")?;
        if active as u32 != channel {
            bail!(
                "Switch card reports channel {} after selecting {}",
                reply,
                channel
            );
        }
        debug!("Switch card channel {} open", channel);
        Ok(())
    }
}
