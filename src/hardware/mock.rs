//! Mock Hardware Implementations
//!
//! Provides simulated instruments for testing and for `--mock` runs without a probe station.
//!
//! # Available Mocks
//!
//! - `MockTransport` - scripted line transport, for exercising the drivers' command syntax
//! - `MockPowerSupply` - simulated source meter with an ohmic leakage current
//! - `MockLcrMeter` - simulated LCR meter returning a fixed or scripted impedance
//! - `MockSwitchCard` - simulated switch matrix with fixed environment readings
//! - `MockInstruments` - instrument factory handing out prepared mocks
//!
//! Every mock records what was asked of it in a [`CommandLog`] that tests can keep a handle to
//! after the instrument has been boxed and handed to a measurement.

use crate::config::{LcrMeterConfig, PowerSupplyConfig, SwitchCardConfig, Terminal};
use crate::hardware::capabilities::{
    ChannelSwitch, ImpedanceMeter, LcrFunction, PowerSource, RampProfile, SenseFunction,
    SourceFunction,
};
use crate::hardware::transport::Transport;
use crate::hardware::InstrumentFactory;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Shared record of the commands an instrument received.
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CommandLog {
    /// Empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    pub fn record(&self, entry: impl Into<String>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(entry.into());
    }

    /// Snapshot of all entries, oldest first
    pub fn commands(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// How often `entry` was recorded
    pub fn count(&self, entry: &str) -> usize {
        self.commands().iter().filter(|e| *e == entry).count()
    }

    /// Index of the first occurrence of `entry`
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.commands().iter().position(|e| e == entry)
    }
}

// =============================================================================
// MockTransport - Scripted Line Transport
// =============================================================================

/// Transport answering queries from a script.
///
/// One-shot replies queued with [`MockTransport::queue_reply`] are used first, then the
/// standing reply set with [`MockTransport::with_reply`]. A query with neither is an error.
pub struct MockTransport {
    name: String,
    log: CommandLog,
    standing: HashMap<String, String>,
    queued: HashMap<String, VecDeque<String>>,
}

impl MockTransport {
    /// Transport named `name` in logs
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            log: CommandLog::new(),
            standing: HashMap::new(),
            queued: HashMap::new(),
        }
    }

    /// Always answer `query` with `reply`
    pub fn with_reply(mut self, query: &str, reply: &str) -> Self {
        self.standing.insert(query.to_string(), reply.to_string());
        self
    }

    /// Answer the next `query` with `reply`
    pub fn queue_reply(mut self, query: &str, reply: &str) -> Self {
        self.queued
            .entry(query.to_string())
            .or_default()
            .push_back(reply.to_string());
        self
    }

    /// Handle to the command log
    pub fn log(&self) -> CommandLog {
        self.log.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, command: &str) -> Result<()> {
        self.log.record(command);
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        self.log.record(command);
        if let Some(reply) = self.queued.get_mut(command).and_then(VecDeque::pop_front) {
            return Ok(reply);
        }
        self.standing
            .get(command)
            .cloned()
            .ok_or_else(|| anyhow!("{}: no scripted reply for '{}'", self.name, command))
    }

    fn describe(&self) -> String {
        format!("mock {}", self.name)
    }
}

fn jitter(relative: f64) -> f64 {
    if relative > 0.0 {
        1.0 + rand::thread_rng().gen_range(-relative..relative)
    } else {
        1.0
    }
}

// =============================================================================
// MockPowerSupply - Simulated Source Meter
// =============================================================================

type RampHook = Box<dyn FnMut(f64) + Send>;

/// Simulated source meter
///
/// Ramps complete instantly. The measured current is `leakage * voltage` (A/V) while the
/// output is on, unless a fixed current is set.
///
/// Log entries: `reset`, `output on`, `output off`, `set_voltage <V>`, `ramp <V>`,
/// `current_limit <A>`, `terminal <front|rear>`, `nplc <n>`.
pub struct MockPowerSupply {
    log: CommandLog,
    setpoint: f64,
    output: bool,
    current_limit: f64,
    voltage_limit: f64,
    leakage: f64,
    fixed_current: Option<f64>,
    noise: f64,
    reads_left: Option<usize>,
    on_ramp: Option<RampHook>,
}

impl MockPowerSupply {
    /// Supply at 0 V with output off and a 1 nA/100 V leakage
    pub fn new() -> Self {
        Self {
            log: CommandLog::new(),
            setpoint: 0.0,
            output: false,
            current_limit: 1e-3,
            voltage_limit: 1100.0,
            leakage: 1e-11,
            fixed_current: None,
            noise: 0.0,
            reads_left: None,
            on_ramp: None,
        }
    }

    /// Supply with ~0.5% reading noise, for `--mock` runs
    pub fn simulated() -> Self {
        Self {
            noise: 0.005,
            ..Self::new()
        }
    }

    /// Leakage in A/V
    pub fn with_leakage(mut self, amps_per_volt: f64) -> Self {
        self.leakage = amps_per_volt;
        self
    }

    /// Report `amps` for every current reading, whatever the bias
    pub fn with_current(mut self, amps: f64) -> Self {
        self.fixed_current = Some(amps);
        self
    }

    /// Fail every reading after `count` successful ones
    pub fn fail_after_reads(mut self, count: usize) -> Self {
        self.reads_left = Some(count);
        self
    }

    /// Call `hook` with the target of every ramp, before the ramp is applied
    pub fn on_ramp(mut self, hook: impl FnMut(f64) + Send + 'static) -> Self {
        self.on_ramp = Some(Box::new(hook));
        self
    }

    /// Handle to the command log
    pub fn log(&self) -> CommandLog {
        self.log.clone()
    }

    fn take_read(&mut self) -> Result<()> {
        match self.reads_left.as_mut() {
            Some(0) => bail!("simulated read failure"),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn output_voltage(&self) -> f64 {
        if self.output {
            self.setpoint
        } else {
            0.0
        }
    }
}

impl Default for MockPowerSupply {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PowerSource for MockPowerSupply {
    async fn reset(&mut self) -> Result<()> {
        self.log.record("reset");
        self.setpoint = 0.0;
        self.output = false;
        Ok(())
    }

    async fn set_source(&mut self, function: SourceFunction) -> Result<()> {
        self.log.record(format!("source {:?}", function).to_lowercase());
        Ok(())
    }

    async fn set_sense(&mut self, function: SenseFunction) -> Result<()> {
        self.log.record(format!("sense {:?}", function).to_lowercase());
        Ok(())
    }

    async fn set_current_limit(&mut self, amps: f64) -> Result<()> {
        self.log.record(format!("current_limit {}", amps));
        self.current_limit = amps;
        Ok(())
    }

    async fn set_voltage(&mut self, volts: f64) -> Result<()> {
        self.log.record(format!("set_voltage {}", volts));
        self.setpoint = volts;
        Ok(())
    }

    async fn set_terminal(&mut self, terminal: Terminal) -> Result<()> {
        self.log
            .record(format!("terminal {:?}", terminal).to_lowercase());
        Ok(())
    }

    async fn set_nplc(&mut self, nplc: f64) -> Result<()> {
        self.log.record(format!("nplc {}", nplc));
        Ok(())
    }

    async fn set_output(&mut self, enabled: bool) -> Result<()> {
        self.log
            .record(if enabled { "output on" } else { "output off" });
        self.output = enabled;
        Ok(())
    }

    async fn voltage_limit(&mut self) -> Result<f64> {
        Ok(self.voltage_limit)
    }

    async fn current_limit(&mut self) -> Result<f64> {
        Ok(self.current_limit)
    }

    async fn voltage_setpoint(&mut self) -> Result<f64> {
        Ok(self.setpoint)
    }

    async fn read_voltage(&mut self) -> Result<f64> {
        self.take_read()?;
        Ok(self.output_voltage())
    }

    async fn read_current(&mut self) -> Result<f64> {
        self.take_read()?;
        let current = self
            .fixed_current
            .unwrap_or(self.leakage * self.output_voltage());
        Ok(current * jitter(self.noise))
    }

    async fn ramp_voltage(&mut self, target: f64, _ramp: &RampProfile) -> Result<()> {
        self.log.record(format!("ramp {}", target));
        if let Some(hook) = self.on_ramp.as_mut() {
            hook(target);
        }
        debug!("MockPowerSupply: {} V -> {} V", self.setpoint, target);
        self.setpoint = target;
        Ok(())
    }
}

// =============================================================================
// MockLcrMeter - Simulated LCR Meter
// =============================================================================

/// Simulated LCR meter
///
/// Models a capacitor `capacitance` (F) in parallel with `resistance` (Ohm). Readings are
/// reported in the selected function: (Cp, Rp) for CPRP, (R, X) for RX with
/// `X = -1 / (2 pi f C)`. Scripted readings, when queued, are returned first.
pub struct MockLcrMeter {
    log: CommandLog,
    frequency: f64,
    ac_voltage: f64,
    function: LcrFunction,
    capacitance: f64,
    resistance: f64,
    noise: f64,
    scripted: VecDeque<(f64, f64)>,
}

impl MockLcrMeter {
    /// 100 pF in parallel with 1 GOhm, 1 kHz, 1 V, CPRP
    pub fn new() -> Self {
        Self {
            log: CommandLog::new(),
            frequency: 1_000.0,
            ac_voltage: 1.0,
            function: LcrFunction::CpRp,
            capacitance: 100e-12,
            resistance: 1e9,
            noise: 0.0,
            scripted: VecDeque::new(),
        }
    }

    /// Meter with ~0.5% reading noise, for `--mock` runs
    pub fn simulated() -> Self {
        Self {
            noise: 0.005,
            ..Self::new()
        }
    }

    /// Device under test
    pub fn with_device(mut self, capacitance: f64, resistance: f64) -> Self {
        self.capacitance = capacitance;
        self.resistance = resistance;
        self
    }

    /// Return these readings, in order, before falling back to the model
    pub fn with_readings(mut self, readings: impl IntoIterator<Item = (f64, f64)>) -> Self {
        self.scripted.extend(readings);
        self
    }

    /// Handle to the command log
    pub fn log(&self) -> CommandLog {
        self.log.clone()
    }

    fn model_reading(&self) -> (f64, f64) {
        let c = self.capacitance * jitter(self.noise);
        let reactance = -1.0 / (2.0 * PI * self.frequency * c);
        match self.function {
            LcrFunction::CpRp => (c, self.resistance),
            LcrFunction::CsRs => (c, 0.0),
            LcrFunction::CpD | LcrFunction::CsD => {
                (c, 1.0 / (2.0 * PI * self.frequency * c * self.resistance))
            }
            LcrFunction::Rx => (0.0, reactance),
            LcrFunction::Ztd => (reactance.abs(), -90.0),
        }
    }
}

impl Default for MockLcrMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImpedanceMeter for MockLcrMeter {
    async fn reset(&mut self) -> Result<()> {
        self.log.record("reset");
        Ok(())
    }

    async fn set_ac_voltage(&mut self, volts: f64) -> Result<()> {
        self.log.record(format!("ac_voltage {}", volts));
        self.ac_voltage = volts;
        Ok(())
    }

    async fn set_frequency(&mut self, hertz: f64) -> Result<()> {
        self.log.record(format!("frequency {}", hertz));
        self.frequency = hertz;
        Ok(())
    }

    async fn set_function(&mut self, function: LcrFunction) -> Result<()> {
        self.log.record(format!("function {}", function));
        self.function = function;
        Ok(())
    }

    async fn ac_voltage(&mut self) -> Result<f64> {
        Ok(self.ac_voltage)
    }

    async fn frequency(&mut self) -> Result<f64> {
        Ok(self.frequency)
    }

    async fn measure(&mut self) -> Result<(f64, f64)> {
        self.log.record("measure");
        Ok(self
            .scripted
            .pop_front()
            .unwrap_or_else(|| self.model_reading()))
    }
}

// =============================================================================
// MockSwitchCard - Simulated Switch Matrix
// =============================================================================

/// Simulated switch matrix
///
/// Log entries: `reboot`, `measurement_type <T>`, `display_mode <M>`, `channel <n>`.
pub struct MockSwitchCard {
    log: CommandLog,
    channel: Option<u32>,
    measurement_type: String,
    display_mode: String,
    temperature: f64,
    humidity: f64,
}

impl MockSwitchCard {
    /// Card at 23 °C and 40% RH, routed for C-V
    pub fn new() -> Self {
        Self {
            log: CommandLog::new(),
            channel: None,
            measurement_type: "CV".to_string(),
            display_mode: "ON".to_string(),
            temperature: 23.0,
            humidity: 40.0,
        }
    }

    /// Handle to the command log
    pub fn log(&self) -> CommandLog {
        self.log.clone()
    }

    /// Currently connected channel
    pub fn channel(&self) -> Option<u32> {
        self.channel
    }
}

impl Default for MockSwitchCard {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelSwitch for MockSwitchCard {
    async fn reboot(&mut self) -> Result<()> {
        self.log.record("reboot");
        self.channel = None;
        Ok(())
    }

    async fn set_measurement_type(&mut self, kind: &str) -> Result<()> {
        self.log.record(format!("measurement_type {}", kind));
        self.measurement_type = kind.to_uppercase();
        Ok(())
    }

    async fn set_display_mode(&mut self, mode: &str) -> Result<()> {
        self.log.record(format!("display_mode {}", mode));
        self.display_mode = mode.to_uppercase();
        Ok(())
    }

    async fn measurement_type(&mut self) -> Result<String> {
        Ok(self.measurement_type.clone())
    }

    async fn display_mode(&mut self) -> Result<String> {
        Ok(self.display_mode.clone())
    }

    async fn probecard_temperature(&mut self) -> Result<f64> {
        Ok(self.temperature)
    }

    async fn matrix_temperature(&mut self) -> Result<f64> {
        Ok(self.temperature + 1.5)
    }

    async fn probecard_humidity(&mut self) -> Result<f64> {
        Ok(self.humidity)
    }

    async fn matrix_humidity(&mut self) -> Result<f64> {
        Ok(self.humidity - 2.0)
    }

    async fn open_channel(&mut self, channel: u32) -> Result<()> {
        self.log.record(format!("channel {}", channel));
        self.channel = Some(channel);
        Ok(())
    }
}

// =============================================================================
// MockInstruments - Factory for prepared mocks
// =============================================================================

/// Instrument factory handing out prepared mocks, each at most once.
///
/// Keep the mocks' [`CommandLog`] handles before moving them in to inspect a run afterwards.
#[derive(Default)]
pub struct MockInstruments {
    power: Option<MockPowerSupply>,
    lcr: Option<MockLcrMeter>,
    switch: Option<MockSwitchCard>,
}

impl MockInstruments {
    /// Factory with no instruments
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out `supply` as the power source
    pub fn with_power_supply(mut self, supply: MockPowerSupply) -> Self {
        self.power = Some(supply);
        self
    }

    /// Hand out `meter` as the impedance meter
    pub fn with_lcr_meter(mut self, meter: MockLcrMeter) -> Self {
        self.lcr = Some(meter);
        self
    }

    /// Hand out `switch` as the channel switch
    pub fn with_switch_card(mut self, switch: MockSwitchCard) -> Self {
        self.switch = Some(switch);
        self
    }
}

#[async_trait]
impl InstrumentFactory for MockInstruments {
    async fn power_source(&mut self, _config: &PowerSupplyConfig) -> Result<Box<dyn PowerSource>> {
        let supply = self
            .power
            .take()
            .ok_or_else(|| anyhow!("No mock power supply available"))?;
        Ok(Box::new(supply))
    }

    async fn impedance_meter(
        &mut self,
        _config: &LcrMeterConfig,
    ) -> Result<Box<dyn ImpedanceMeter>> {
        let meter = self
            .lcr
            .take()
            .ok_or_else(|| anyhow!("No mock LCR meter available"))?;
        Ok(Box::new(meter))
    }

    async fn channel_switch(
        &mut self,
        _config: &SwitchCardConfig,
    ) -> Result<Box<dyn ChannelSwitch>> {
        let switch = self
            .switch
            .take()
            .ok_or_else(|| anyhow!("No mock switch card available"))?;
        Ok(Box::new(switch))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
