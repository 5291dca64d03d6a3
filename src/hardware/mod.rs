//! Bench instruments
//!
//! Capability traits ([`capabilities`]), the transports that carry their commands
//! ([`transport`]), the drivers for the instruments on the probe station and simulated
//! stand-ins ([`mock`]).
//!
//! Measurements never construct drivers themselves; they ask an [`InstrumentFactory`] for each
//! role they need. [`BenchInstruments`] builds real drivers from the configured connections
//! (or mocks for `kind = "mock"` connections), tests hand in pre-built mocks instead.

pub mod capabilities;
pub mod hp4980;
pub mod keithley_2410;
pub mod mock;
pub mod switch_card;
pub mod transport;

use crate::config::{ConnectionConfig, LcrMeterConfig, PowerSupplyConfig, SwitchCardConfig};
use anyhow::Result;
use async_trait::async_trait;
use capabilities::{ChannelSwitch, ImpedanceMeter, PowerSource};
use transport::{PortPool, Transport};
use tracing::info;

#[cfg(any(feature = "instrument_serial", feature = "instrument_visa"))]
use std::time::Duration;

/// Hands out the instruments a measurement asks for.
#[async_trait]
pub trait InstrumentFactory: Send {
    /// Bias supply
    async fn power_source(&mut self, config: &PowerSupplyConfig) -> Result<Box<dyn PowerSource>>;

    /// LCR meter
    async fn impedance_meter(&mut self, config: &LcrMeterConfig)
        -> Result<Box<dyn ImpedanceMeter>>;

    /// Switch matrix
    async fn channel_switch(&mut self, config: &SwitchCardConfig)
        -> Result<Box<dyn ChannelSwitch>>;
}

/// Instruments on the probe station, opened from their configured connections.
///
/// Serial lines stay open for as long as the factory lives, so a Prologix controller serving
/// both the supply and the LCR meter is opened once.
#[derive(Default)]
pub struct BenchInstruments {
    ports: PortPool,
}

impl BenchInstruments {
    /// Factory with no open ports
    pub fn new() -> Self {
        Self::default()
    }

    async fn transport(
        &mut self,
        connection: &ConnectionConfig,
        role: &str,
    ) -> Result<Box<dyn Transport>> {
        info!("Opening {} on {:?}", role, connection);
        match connection {
            #[cfg(feature = "instrument_serial")]
            ConnectionConfig::Serial {
                port,
                baud_rate,
                timeout_ms,
            } => {
                let line = self.ports.serial_line(port, *baud_rate)?;
                Ok(Box::new(transport::SerialTransport::new(
                    line,
                    port.clone(),
                    Duration::from_millis(*timeout_ms),
                )))
            }
            #[cfg(feature = "instrument_serial")]
            ConnectionConfig::Prologix {
                port,
                address,
                timeout_ms,
            } => {
                let line = self.ports.prologix_line(port).await?;
                Ok(Box::new(transport::PrologixTransport::new(
                    line,
                    port.clone(),
                    *address,
                    Duration::from_millis(*timeout_ms),
                )))
            }
            #[cfg(not(feature = "instrument_serial"))]
            ConnectionConfig::Serial { .. } | ConnectionConfig::Prologix { .. } => Err(
                crate::error::DaqError::FeatureNotEnabled("instrument_serial".to_string()).into(),
            ),
            #[cfg(feature = "instrument_visa")]
            ConnectionConfig::Visa {
                address,
                board,
                timeout_ms,
            } => Ok(Box::new(transport::VisaTransport::open(
                *board,
                *address,
                Duration::from_millis(*timeout_ms),
            )?)),
            #[cfg(not(feature = "instrument_visa"))]
            ConnectionConfig::Visa { .. } => Err(crate::error::DaqError::FeatureNotEnabled(
                "instrument_visa".to_string(),
            )
            .into()),
            ConnectionConfig::Mock => Err(crate::error::DaqError::Instrument(format!(
                "The simulated {} has no transport",
                role
            ))
            .into()),
        }
    }

    /// Number of serial lines currently open
    pub fn open_ports(&self) -> usize {
        self.ports.len()
    }
}

#[async_trait]
impl InstrumentFactory for BenchInstruments {
    async fn power_source(&mut self, config: &PowerSupplyConfig) -> Result<Box<dyn PowerSource>> {
        if config.connection == ConnectionConfig::Mock {
            info!("Using simulated power supply");
            return Ok(Box::new(mock::MockPowerSupply::simulated()));
        }
        let transport = self.transport(&config.connection, "power supply").await?;
        Ok(Box::new(keithley_2410::Keithley2410::connect(transport).await?))
    }

    async fn impedance_meter(
        &mut self,
        config: &LcrMeterConfig,
    ) -> Result<Box<dyn ImpedanceMeter>> {
        if config.connection == ConnectionConfig::Mock {
            info!("Using simulated LCR meter");
            return Ok(Box::new(mock::MockLcrMeter::simulated()));
        }
        let transport = self.transport(&config.connection, "LCR meter").await?;
        Ok(Box::new(hp4980::Hp4980::connect(transport).await?))
    }

    async fn channel_switch(
        &mut self,
        config: &SwitchCardConfig,
    ) -> Result<Box<dyn ChannelSwitch>> {
        if config.connection == ConnectionConfig::Mock {
            info!("Using simulated switch card");
            return Ok(Box::new(mock::MockSwitchCard::new()));
        }
        let transport = self.transport(&config.connection, "switch card").await?;
        Ok(Box::new(switch_card::SwitchCard::connect(transport).await?))
    }
}

/// Serial ports present on this machine.
#[cfg(feature = "instrument_serial")]
pub fn available_ports() -> Result<Vec<String>> {
    Ok(tokio_serial::available_ports()?
        .into_iter()
        .map(|p| p.port_name)
        .collect())
}

/// Serial ports present on this machine.
#[cfg(not(feature = "instrument_serial"))]
pub fn available_ports() -> Result<Vec<String>> {
    Err(crate::error::DaqError::FeatureNotEnabled("instrument_serial".to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Terminal;

    fn supply(connection: ConnectionConfig) -> PowerSupplyConfig {
        PowerSupplyConfig {
            connection,
            current_limit: 5e-4,
            voltage_limit: 500.0,
            terminal: Terminal::Rear,
            nplc: None,
        }
    }

    #[tokio::test]
    async fn test_mock_connection_yields_simulated_supply() {
        let mut bench = BenchInstruments::new();
        let mut source = bench
            .power_source(&supply(ConnectionConfig::Mock))
            .await
            .unwrap();
        source.set_output(true).await.unwrap();
        source.set_voltage(-10.0).await.unwrap();
        assert_eq!(source.read_voltage().await.unwrap(), -10.0);
        assert_eq!(bench.open_ports(), 0);
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_visa_without_feature_is_reported() {
        let mut bench = BenchInstruments::new();
        let err = bench
            .power_source(&supply(ConnectionConfig::Visa {
                address: 24,
                board: 0,
                timeout_ms: 1000,
            }))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("instrument_visa"));
    }
}
