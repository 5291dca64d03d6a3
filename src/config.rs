//! Measurement configuration using Figment
//!
//! Every run is described by one TOML file. Configuration is loaded from:
//! 1. the TOML file given on the command line (base configuration)
//! 2. environment variables prefixed with `SEMI_DAQ_`, nested keys separated by `__`
//!    (e.g. `SEMI_DAQ_SWEEP__SAMPLES_PER_POINT=3`)
//!
//! Addresses, compliance limits, delays and the sample count per point all live here; nothing
//! about a run is hardcoded in the measurement code.
//!
//! # Example
//! ```toml
//! [application]
//! name = "probe station"
//! log_level = "info"
//!
//! [storage]
//! output_dir = "data"
//!
//! [measurement]
//! kind = "single_cv"
//! sample_id = "W12_D04"
//!
//! [power_supply]
//! connection = { kind = "prologix", port = "/dev/ttyUSB0", address = 24 }
//! current_limit = 0.0005
//! voltage_limit = 500
//!
//! [lcr_meter]
//! connection = { kind = "prologix", port = "/dev/ttyUSB0", address = 17 }
//! ac_voltage = 1.0
//! frequency = 50000
//! mode = "CPRP"
//!
//! [sweep]
//! voltage_file = "voltagesCV6Inch128Neg.txt"
//! frequencies = [500, 1000, 10000, 100000]
//! voltage_delay_s = 20
//! ```

pub mod sweep_list;

pub use sweep_list::{load_sweep_list, parse_sweep_list};

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level measurement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Output location
    #[serde(default)]
    pub storage: StorageConfig,
    /// Which measurement to run and on what
    pub measurement: MeasurementConfig,
    /// Bias supply (required by every measurement kind)
    pub power_supply: Option<PowerSupplyConfig>,
    /// LCR meter (C-V measurements)
    pub lcr_meter: Option<LcrMeterConfig>,
    /// Switch matrix (scanning measurements)
    pub switch_card: Option<SwitchCardConfig>,
    /// Sweep parameters
    pub sweep: SweepConfig,
    /// Directory of the file the settings were loaded from; relative sweep list paths are
    /// resolved against it.
    #[serde(skip)]
    pub source_dir: Option<PathBuf>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Runs are written to `<output_dir>/<run id>/`
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

/// Measurement kinds available from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    /// C-V curve of a single structure, optionally over several frequencies
    SingleCv,
    /// C-V of several cells through the switch matrix, repeated over time
    ScanCv,
    /// I-V curve of a single structure
    SingleIv,
}

impl MeasurementKind {
    /// Whether the kind uses the LCR meter.
    pub fn needs_lcr_meter(&self) -> bool {
        matches!(self, MeasurementKind::SingleCv | MeasurementKind::ScanCv)
    }

    /// Whether the kind uses the switch card.
    pub fn needs_switch_card(&self) -> bool {
        matches!(self, MeasurementKind::ScanCv)
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementKind::SingleCv => write!(f, "single_cv"),
            MeasurementKind::ScanCv => write!(f, "scan_cv"),
            MeasurementKind::SingleIv => write!(f, "single_iv"),
        }
    }
}

/// Which measurement to run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementConfig {
    /// Measurement kind
    pub kind: MeasurementKind,
    /// Identifier of the device under test, used in file names and plot titles
    #[serde(default = "default_sample_id")]
    pub sample_id: String,
}

/// How to reach an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionConfig {
    /// Instrument attached directly to a serial port
    Serial {
        /// Serial port path (e.g. "/dev/ttyUSB0", "COM3")
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    /// GPIB instrument behind a Prologix-style GPIB-USB controller
    Prologix {
        /// Serial port of the controller
        port: String,
        /// GPIB primary address (0-30)
        address: u8,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    /// GPIB instrument through the system VISA library (`GPIB<board>::<address>::INSTR`)
    Visa {
        /// GPIB primary address (0-30)
        address: u8,
        #[serde(default)]
        board: u8,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    /// Simulated instrument
    Mock,
}

impl ConnectionConfig {
    /// The GPIB address, when the connection goes over GPIB.
    pub fn gpib_address(&self) -> Option<u8> {
        match self {
            ConnectionConfig::Prologix { address, .. } | ConnectionConfig::Visa { address, .. } => {
                Some(*address)
            }
            _ => None,
        }
    }
}

/// Output terminals of the source meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Terminal {
    /// Front panel
    Front,
    /// Rear panel
    Rear,
}

/// Bias supply settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerSupplyConfig {
    /// Connection
    pub connection: ConnectionConfig,
    /// Current compliance in A
    #[serde(default = "default_current_limit")]
    pub current_limit: f64,
    /// Largest |voltage| the sweep may request, in V
    #[serde(default = "default_voltage_limit")]
    pub voltage_limit: f64,
    /// Output terminals
    #[serde(default = "default_terminal")]
    pub terminal: Terminal,
    /// Integration time in power line cycles (instrument default when unset)
    #[serde(default)]
    pub nplc: Option<f64>,
}

/// LCR meter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LcrMeterConfig {
    /// Connection
    pub connection: ConnectionConfig,
    /// AC test signal amplitude in V
    #[serde(default = "default_ac_voltage")]
    pub ac_voltage: f64,
    /// AC test signal frequency in Hz
    #[serde(default = "default_frequency")]
    pub frequency: f64,
    /// Measurement function, e.g. "CPRP" or "RX" (kind-specific default when unset)
    #[serde(default)]
    pub mode: Option<String>,
}

/// Switch matrix settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCardConfig {
    /// Connection
    pub connection: ConnectionConfig,
    /// Measurement type routed by the matrix ("CV" or "IV")
    #[serde(default = "default_switch_measurement_type")]
    pub measurement_type: String,
    /// Front display mode
    #[serde(default = "default_switch_display_mode")]
    pub display_mode: String,
}

/// Sweep parameters
///
/// Delays are in seconds. `voltages` and `voltage_file` are mutually exclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Literal voltage list
    #[serde(default)]
    pub voltages: Option<Vec<f64>>,
    /// Plain-text voltage list file
    #[serde(default)]
    pub voltage_file: Option<PathBuf>,
    /// LCR frequencies per voltage (single C-V); the LCR frequency when empty
    #[serde(default)]
    pub frequencies: Vec<f64>,
    /// Switch matrix cells per voltage (scan C-V)
    #[serde(default)]
    pub cells: Vec<u32>,
    /// Readings averaged per point
    #[serde(default = "default_samples_per_point")]
    pub samples_per_point: usize,
    /// Wait after reaching a voltage
    #[serde(default = "default_voltage_delay")]
    pub voltage_delay_s: f64,
    /// Wait after changing the LCR frequency
    #[serde(default = "default_frequency_delay")]
    pub frequency_delay_s: f64,
    /// Wait after switching a channel
    #[serde(default = "default_channel_delay")]
    pub channel_delay_s: f64,
    /// Voltage step while ramping, in V
    #[serde(default = "default_ramp_step")]
    pub ramp_step_v: f64,
    /// Wait between ramp steps
    #[serde(default = "default_ramp_delay")]
    pub ramp_delay_s: f64,
    /// Wait at 0 V before the output is switched off
    #[serde(default = "default_settle_delay")]
    pub settle_delay_s: f64,
    /// Time spent sampling each cell (scan C-V)
    #[serde(default = "default_dwell_time")]
    pub dwell_time_s: f64,
    /// Interval between samples while dwelling (scan C-V)
    #[serde(default = "default_sample_interval")]
    pub sample_interval_s: f64,
    /// Keep repeating the voltage list until this much time has passed (scan C-V);
    /// a single pass when unset
    #[serde(default)]
    pub total_duration_s: Option<f64>,
}

impl SweepConfig {
    /// Wait after reaching a voltage.
    pub fn voltage_delay(&self) -> AppResult<Duration> {
        seconds("voltage_delay_s", self.voltage_delay_s)
    }

    /// Wait after changing the LCR frequency.
    pub fn frequency_delay(&self) -> AppResult<Duration> {
        seconds("frequency_delay_s", self.frequency_delay_s)
    }

    /// Wait after switching a channel.
    pub fn channel_delay(&self) -> AppResult<Duration> {
        seconds("channel_delay_s", self.channel_delay_s)
    }

    /// Wait between ramp steps.
    pub fn ramp_delay(&self) -> AppResult<Duration> {
        seconds("ramp_delay_s", self.ramp_delay_s)
    }

    /// Wait at 0 V before the output is switched off.
    pub fn settle_delay(&self) -> AppResult<Duration> {
        seconds("settle_delay_s", self.settle_delay_s)
    }

    /// Time spent sampling each cell.
    pub fn dwell_time(&self) -> AppResult<Duration> {
        seconds("dwell_time_s", self.dwell_time_s)
    }

    /// Interval between dwell samples.
    pub fn sample_interval(&self) -> AppResult<Duration> {
        seconds("sample_interval_s", self.sample_interval_s)
    }

    /// Total scan duration, if any.
    pub fn total_duration(&self) -> AppResult<Option<Duration>> {
        self.total_duration_s
            .map(|value| seconds("total_duration_s", value))
            .transpose()
    }

    fn check_durations(&self) -> AppResult<()> {
        self.voltage_delay()?;
        self.frequency_delay()?;
        self.channel_delay()?;
        self.ramp_delay()?;
        self.settle_delay()?;
        self.dwell_time()?;
        self.sample_interval()?;
        self.total_duration()?;
        Ok(())
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            voltages: None,
            voltage_file: None,
            frequencies: Vec::new(),
            cells: Vec::new(),
            samples_per_point: default_samples_per_point(),
            voltage_delay_s: default_voltage_delay(),
            frequency_delay_s: default_frequency_delay(),
            channel_delay_s: default_channel_delay(),
            ramp_step_v: default_ramp_step(),
            ramp_delay_s: default_ramp_delay(),
            settle_delay_s: default_settle_delay(),
            dwell_time_s: default_dwell_time(),
            sample_interval_s: default_sample_interval(),
            total_duration_s: None,
        }
    }
}

/// Smallest voltage change per ramp step.
pub const MIN_RAMP_STEP_V: f64 = 0.01;

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

/// Longest wait any sweep setting may ask for, one year.
const MAX_DURATION_S: f64 = 365.0 * 24.0 * 3600.0;

fn seconds(field: &str, value: f64) -> AppResult<Duration> {
    if !(0.0..=MAX_DURATION_S).contains(&value) {
        return Err(DaqError::Configuration(format!(
            "sweep.{} must be between 0 and {} s, got {}",
            field, MAX_DURATION_S, value
        )));
    }
    Duration::try_from_secs_f64(value).map_err(|e| {
        DaqError::Configuration(format!("sweep.{} = {} is not a duration: {}", field, value, e))
    })
}

// Default value functions
fn default_app_name() -> String {
    "semi-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_sample_id() -> String {
    "sample".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_current_limit() -> f64 {
    0.0005
}

fn default_voltage_limit() -> f64 {
    500.0
}

fn default_terminal() -> Terminal {
    Terminal::Rear
}

fn default_ac_voltage() -> f64 {
    1.0
}

fn default_frequency() -> f64 {
    10_000.0
}

fn default_switch_measurement_type() -> String {
    "CV".to_string()
}

fn default_switch_display_mode() -> String {
    "OFF".to_string()
}

fn default_samples_per_point() -> usize {
    5
}

fn default_voltage_delay() -> f64 {
    1.0
}

fn default_frequency_delay() -> f64 {
    1.0
}

fn default_channel_delay() -> f64 {
    0.1
}

fn default_ramp_step() -> f64 {
    5.0
}

fn default_ramp_delay() -> f64 {
    0.1
}

fn default_settle_delay() -> f64 {
    15.0
}

fn default_dwell_time() -> f64 {
    60.0
}

fn default_sample_interval() -> f64 {
    1.0
}

impl Settings {
    /// Load settings from a TOML file and `SEMI_DAQ_` environment variables
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(DaqError::Configuration(format!(
                "Configuration file '{}' not found",
                path.display()
            )));
        }

        let mut settings: Settings = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SEMI_DAQ_").split("__"))
            .extract()?;
        settings.source_dir = path.parent().map(Path::to_path_buf);
        Ok(settings)
    }

    /// Parse settings from TOML text, without environment overrides
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        Ok(Figment::new().merge(Toml::string(text)).extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let kind = self.measurement.kind;
        let supply = self.power_supply.as_ref().ok_or_else(|| {
            DaqError::Configuration(format!("Measurement '{}' needs a [power_supply] section", kind))
        })?;
        if kind.needs_lcr_meter() && self.lcr_meter.is_none() {
            return Err(DaqError::Configuration(format!(
                "Measurement '{}' needs a [lcr_meter] section",
                kind
            )));
        }
        if kind.needs_switch_card() {
            if self.switch_card.is_none() {
                return Err(DaqError::Configuration(format!(
                    "Measurement '{}' needs a [switch_card] section",
                    kind
                )));
            }
            if self.sweep.cells.is_empty() {
                return Err(DaqError::Configuration(
                    "sweep.cells must list at least one cell".to_string(),
                ));
            }
        }

        if !(supply.current_limit > 0.0) {
            return Err(DaqError::Configuration(format!(
                "power_supply.current_limit must be positive, got {}",
                supply.current_limit
            )));
        }

        for connection in self.connections() {
            if let Some(address) = connection.gpib_address() {
                if address > 30 {
                    return Err(DaqError::Configuration(format!(
                        "GPIB address must be 0-30, got {}",
                        address
                    )));
                }
            }
        }

        let sweep = &self.sweep;
        if sweep.voltages.is_some() && sweep.voltage_file.is_some() {
            return Err(DaqError::Configuration(
                "sweep.voltages and sweep.voltage_file are mutually exclusive".to_string(),
            ));
        }
        if sweep.samples_per_point == 0 {
            return Err(DaqError::Configuration(
                "sweep.samples_per_point must be at least 1".to_string(),
            ));
        }
        if !(sweep.ramp_step_v >= MIN_RAMP_STEP_V && sweep.ramp_step_v.is_finite()) {
            return Err(DaqError::Configuration(format!(
                "sweep.ramp_step_v must be at least {} V, got {}",
                MIN_RAMP_STEP_V, sweep.ramp_step_v
            )));
        }
        if let Some(f) = sweep.frequencies.iter().find(|f| !is_positive(**f)) {
            return Err(DaqError::Configuration(format!(
                "sweep.frequencies must be positive, got {}",
                f
            )));
        }
        sweep.check_durations()?;

        if let Some(lcr) = &self.lcr_meter {
            if !is_positive(lcr.frequency) {
                return Err(DaqError::Configuration(format!(
                    "lcr_meter.frequency must be positive, got {}",
                    lcr.frequency
                )));
            }
            if !is_positive(lcr.ac_voltage) {
                return Err(DaqError::Configuration(format!(
                    "lcr_meter.ac_voltage must be positive, got {}",
                    lcr.ac_voltage
                )));
            }
        }
        if kind == MeasurementKind::ScanCv && !(sweep.sample_interval_s > 0.0) {
            return Err(DaqError::Configuration(
                "sweep.sample_interval_s must be positive for scan_cv".to_string(),
            ));
        }

        let voltages = self.voltages()?;
        if let Some(v) = voltages.iter().find(|v| !v.is_finite()) {
            return Err(DaqError::Configuration(format!(
                "sweep.voltages must be finite, got {}",
                v
            )));
        }
        if let Some(v) = voltages.iter().find(|v| v.abs() > supply.voltage_limit) {
            return Err(DaqError::Configuration(format!(
                "Sweep voltage {} V exceeds power_supply.voltage_limit {} V",
                v, supply.voltage_limit
            )));
        }

        Ok(())
    }

    /// Resolve the sweep voltages, reading the voltage file if one is configured
    pub fn voltages(&self) -> AppResult<Vec<f64>> {
        match (&self.sweep.voltages, &self.sweep.voltage_file) {
            (Some(list), None) if !list.is_empty() => Ok(list.clone()),
            (Some(_), None) => Err(DaqError::Configuration(
                "sweep.voltages is empty".to_string(),
            )),
            (None, Some(file)) => {
                let path = match (&self.source_dir, file.is_relative()) {
                    (Some(dir), true) => dir.join(file),
                    _ => file.clone(),
                };
                load_sweep_list(&path)
            }
            (None, None) => Err(DaqError::Configuration(
                "Either sweep.voltages or sweep.voltage_file must be set".to_string(),
            )),
            (Some(_), Some(_)) => Err(DaqError::Configuration(
                "sweep.voltages and sweep.voltage_file are mutually exclusive".to_string(),
            )),
        }
    }

    /// LCR frequencies to visit at every voltage
    pub fn frequencies(&self) -> Vec<f64> {
        if !self.sweep.frequencies.is_empty() {
            return self.sweep.frequencies.clone();
        }
        self.lcr_meter
            .as_ref()
            .map(|lcr| vec![lcr.frequency])
            .unwrap_or_default()
    }

    /// Replace every instrument connection with the simulated one
    pub fn with_mock_instruments(mut self) -> Self {
        if let Some(supply) = self.power_supply.as_mut() {
            supply.connection = ConnectionConfig::Mock;
        }
        if let Some(lcr) = self.lcr_meter.as_mut() {
            lcr.connection = ConnectionConfig::Mock;
        }
        if let Some(switch) = self.switch_card.as_mut() {
            switch.connection = ConnectionConfig::Mock;
        }
        self
    }

    fn connections(&self) -> impl Iterator<Item = &ConnectionConfig> {
        self.power_supply
            .iter()
            .map(|c| &c.connection)
            .chain(self.lcr_meter.iter().map(|c| &c.connection))
            .chain(self.switch_card.iter().map(|c| &c.connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE_CV: &str = r#"
        [measurement]
        kind = "single_cv"
        sample_id = "W12"

        [power_supply]
        connection = { kind = "prologix", port = "/dev/ttyUSB0", address = 24 }
        current_limit = 0.0005
        voltage_limit = 500

        [lcr_meter]
        connection = { kind = "visa", address = 17 }
        frequency = 50000

        [sweep]
        voltages = [0, -25, -50]
        frequencies = [500, 1000]
    "#;

    #[test]
    fn test_parse_single_cv() {
        let settings = Settings::from_toml_str(SINGLE_CV).unwrap();
        assert_eq!(settings.measurement.kind, MeasurementKind::SingleCv);
        assert_eq!(settings.application.log_level, "info");
        assert_eq!(settings.sweep.samples_per_point, 5);
        assert_eq!(
            settings.power_supply.as_ref().unwrap().connection,
            ConnectionConfig::Prologix {
                port: "/dev/ttyUSB0".to_string(),
                address: 24,
                timeout_ms: 2000,
            }
        );
        assert!(settings.validate().is_ok());
        assert_eq!(settings.frequencies(), vec![500.0, 1000.0]);
    }

    #[test]
    fn test_frequencies_default_to_lcr_frequency() {
        let text = SINGLE_CV.replace("frequencies = [500, 1000]", "");
        let settings = Settings::from_toml_str(&text).unwrap();
        assert_eq!(settings.frequencies(), vec![50000.0]);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::from_toml_str(SINGLE_CV).unwrap();
        settings.application.log_level = "loud".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_voltage_beyond_limit_rejected() {
        let text = SINGLE_CV.replace("voltages = [0, -25, -50]", "voltages = [0, -600]");
        let settings = Settings::from_toml_str(&text).unwrap();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("-600"));
    }

    #[test]
    fn test_missing_lcr_section_rejected() {
        let text = SINGLE_CV.replace("[lcr_meter]", "[unused]");
        let settings = Settings::from_toml_str(&text).unwrap();
        assert!(settings.lcr_meter.is_none());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_zero_samples_rejected() {
        let mut settings = Settings::from_toml_str(SINGLE_CV).unwrap();
        settings.sweep.samples_per_point = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_mock_override() {
        let settings = Settings::from_toml_str(SINGLE_CV)
            .unwrap()
            .with_mock_instruments();
        assert_eq!(
            settings.power_supply.unwrap().connection,
            ConnectionConfig::Mock
        );
        assert_eq!(settings.lcr_meter.unwrap().connection, ConnectionConfig::Mock);
    }

    #[test]
    fn test_delays_convert_to_durations() {
        let sweep = SweepConfig {
            voltage_delay_s: 2.5,
            ..Default::default()
        };
        assert_eq!(sweep.voltage_delay().unwrap(), Duration::from_millis(2500));
        assert_eq!(sweep.settle_delay().unwrap(), Duration::from_secs(15));
        assert!(sweep.total_duration().unwrap().is_none());
    }
}
