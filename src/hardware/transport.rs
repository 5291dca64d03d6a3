//! Line-oriented instrument transports
//!
//! Every instrument on the bench speaks a line protocol: a command terminated by LF, and for
//! queries a single reply line. The transports here only move those lines; command syntax lives
//! in the drivers.
//!
//! - [`SerialTransport`] - instrument attached directly to a serial port
//! - [`PrologixTransport`] - GPIB instrument behind a Prologix GPIB-USB controller
//! - `VisaTransport` - GPIB instrument through the system VISA library (`instrument_visa`)
//!
//! Several GPIB instruments usually hang off one Prologix controller. [`PortPool`] hands out one
//! shared line per serial port path; each `PrologixTransport` selects its GPIB address under the
//! line lock before every exchange, so instruments can never answer each other's queries.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Moves command and reply lines to and from one instrument.
#[async_trait]
pub trait Transport: Send {
    /// Send a command that produces no reply
    async fn write(&mut self, command: &str) -> Result<()>;

    /// Send a command and read one reply line (terminator stripped)
    async fn query(&mut self, command: &str) -> Result<String>;

    /// Human-readable location, used in logs and errors
    fn describe(&self) -> String;
}

/// Query `*IDN?` and log the answer.
pub async fn identify(transport: &mut dyn Transport) -> Result<String> {
    let idn = transport
        .query("*IDN?")
        .await
        .with_context(|| format!("No identification from {}", transport.describe()))?;
    info!("Connected to {}: {}", transport.describe(), idn);
    Ok(idn)
}

/// Byte stream an instrument line runs over.
pub trait LineIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> LineIo for T {}

/// One physical line, shared by every transport using it.
pub type SharedLine = Arc<Mutex<BufReader<Box<dyn LineIo>>>>;

/// Wrap a byte stream into a shareable line.
pub fn shared_line(stream: impl LineIo + 'static) -> SharedLine {
    let boxed: Box<dyn LineIo> = Box::new(stream);
    Arc::new(Mutex::new(BufReader::new(boxed)))
}

async fn write_line(
    line: &mut BufReader<Box<dyn LineIo>>,
    text: &str,
    location: &str,
) -> Result<()> {
    let framed = format!("{}\n", text);
    let stream = line.get_mut();
    stream
        .write_all(framed.as_bytes())
        .await
        .with_context(|| format!("Write to {} failed", location))?;
    stream
        .flush()
        .await
        .with_context(|| format!("Flush of {} failed", location))?;
    Ok(())
}

async fn read_line(
    line: &mut BufReader<Box<dyn LineIo>>,
    timeout: Duration,
    location: &str,
) -> Result<String> {
    let mut reply = String::new();
    let read = tokio::time::timeout(timeout, line.read_line(&mut reply))
        .await
        .map_err(|_| anyhow!("Timed out after {:?} waiting for {}", timeout, location))?
        .with_context(|| format!("Read from {} failed", location))?;
    if read == 0 {
        bail!("{} closed the connection", location);
    }
    Ok(reply.trim_end_matches(['\r', '\n']).to_string())
}

/// Instrument attached directly to a serial port.
pub struct SerialTransport {
    line: SharedLine,
    port: String,
    timeout: Duration,
}

impl SerialTransport {
    /// Use an already-open line
    pub fn new(line: SharedLine, port: impl Into<String>, timeout: Duration) -> Self {
        Self {
            line,
            port: port.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write(&mut self, command: &str) -> Result<()> {
        let mut line = self.line.lock().await;
        debug!(port = %self.port, "-> {}", command);
        write_line(&mut line, command, &self.port).await
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        let mut line = self.line.lock().await;
        debug!(port = %self.port, "-> {}", command);
        write_line(&mut line, command, &self.port).await?;
        let reply = read_line(&mut line, self.timeout, &self.port).await?;
        debug!(port = %self.port, "<- {}", reply);
        Ok(reply)
    }

    fn describe(&self) -> String {
        format!("serial port {}", self.port)
    }
}

/// Controller commands sent once when a Prologix line is first opened: controller mode, no
/// automatic read-after-write, assert EOI with the last byte, append LF to GPIB writes.
pub const PROLOGIX_INIT: [&str; 4] = ["++mode 1", "++auto 0", "++eoi 1", "++eos 2"];

/// GPIB instrument behind a Prologix GPIB-USB controller.
pub struct PrologixTransport {
    line: SharedLine,
    port: String,
    address: u8,
    timeout: Duration,
}

impl PrologixTransport {
    /// Address `address` on the controller reachable through `line`
    pub fn new(line: SharedLine, port: impl Into<String>, address: u8, timeout: Duration) -> Self {
        Self {
            line,
            port: port.into(),
            address,
            timeout,
        }
    }

    fn location(&self) -> String {
        format!("GPIB address {} on {}", self.address, self.port)
    }
}

/// Escape bytes the controller would otherwise interpret (CR, LF, ESC, '+').
pub fn prologix_escape(command: &str) -> String {
    let mut escaped = String::with_capacity(command.len());
    for c in command.chars() {
        if matches!(c, '\r' | '\n' | '\x1b' | '+') {
            escaped.push('\x1b');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl Transport for PrologixTransport {
    async fn write(&mut self, command: &str) -> Result<()> {
        let location = self.location();
        let mut line = self.line.lock().await;
        debug!("-> [{}] {}", location, command);
        write_line(&mut line, &format!("++addr {}", self.address), &location).await?;
        write_line(&mut line, &prologix_escape(command), &location).await
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        let location = self.location();
        let mut line = self.line.lock().await;
        debug!("-> [{}] {}", location, command);
        write_line(&mut line, &format!("++addr {}", self.address), &location).await?;
        write_line(&mut line, &prologix_escape(command), &location).await?;
        write_line(&mut line, "++read eoi", &location).await?;
        let reply = read_line(&mut line, self.timeout, &location).await?;
        debug!("<- [{}] {}", location, reply);
        Ok(reply)
    }

    fn describe(&self) -> String {
        self.location()
    }
}

/// Serial lines opened during one run, keyed by port path.
///
/// Owned by the instrument factory of a run and dropped with it, which closes the ports.
#[derive(Default)]
pub struct PortPool {
    lines: HashMap<String, SharedLine>,
}

impl PortPool {
    /// Empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an already-open line under `port`
    pub fn insert(&mut self, port: impl Into<String>, line: SharedLine) {
        self.lines.insert(port.into(), line);
    }

    /// The line registered for `port`, if any
    pub fn get(&self, port: &str) -> Option<SharedLine> {
        self.lines.get(port).cloned()
    }

    /// Number of open lines
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether no line is open
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Line for a directly attached serial instrument, opening the port on first use
    #[cfg(feature = "instrument_serial")]
    pub fn serial_line(&mut self, port: &str, baud_rate: u32) -> Result<SharedLine> {
        if let Some(line) = self.get(port) {
            return Ok(line);
        }
        let line = shared_line(open_serial_port(port, baud_rate)?);
        self.insert(port, line.clone());
        Ok(line)
    }

    /// Line for a Prologix controller, opening and configuring it on first use
    #[cfg(feature = "instrument_serial")]
    pub async fn prologix_line(&mut self, port: &str) -> Result<SharedLine> {
        if let Some(line) = self.get(port) {
            return Ok(line);
        }
        // USB CDC device: the baud rate is ignored by the controller.
        let line = shared_line(open_serial_port(port, 115_200)?);
        configure_prologix(&line, port).await?;
        self.insert(port, line.clone());
        Ok(line)
    }
}

/// Put a freshly opened Prologix controller into controller mode.
pub async fn configure_prologix(line: &SharedLine, port: &str) -> Result<()> {
    let mut guard = line.lock().await;
    for command in PROLOGIX_INIT {
        write_line(&mut guard, command, port).await?;
    }
    info!("Prologix controller on {} configured", port);
    Ok(())
}

#[cfg(feature = "instrument_serial")]
fn open_serial_port(port: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    tokio_serial::new(port, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .with_context(|| format!("Failed to open serial port {}", port))
}

/// GPIB instrument through the system VISA library.
///
/// VISA calls are blocking; on the single-threaded runtime they simply run in place.
#[cfg(feature = "instrument_visa")]
pub struct VisaTransport {
    instrument: visa_rs::Instrument,
    resource: String,
    // Dropping the resource manager closes its sessions.
    _manager: visa_rs::DefaultRM,
}

#[cfg(feature = "instrument_visa")]
impl VisaTransport {
    /// Open `GPIB<board>::<address>::INSTR`
    pub fn open(board: u8, address: u8, timeout: Duration) -> Result<Self> {
        use std::ffi::CString;
        use visa_rs::prelude::*;

        let resource = format!("GPIB{}::{}::INSTR", board, address);
        let manager = DefaultRM::new().map_err(|e| anyhow!("VISA unavailable: {:?}", e))?;
        let name = CString::new(resource.clone()).context("Invalid VISA resource name")?;
        let instrument = manager
            .open(&name.into(), AccessMode::NO_LOCK, timeout)
            .map_err(|e| anyhow!("Failed to open {}: {:?}", resource, e))?;

        Ok(Self {
            instrument,
            resource,
            _manager: manager,
        })
    }
}

#[cfg(feature = "instrument_visa")]
#[async_trait]
impl Transport for VisaTransport {
    async fn write(&mut self, command: &str) -> Result<()> {
        use std::io::Write;

        debug!("-> [{}] {}", self.resource, command);
        (&self.instrument)
            .write_all(format!("{}\n", command).as_bytes())
            .with_context(|| format!("Write to {} failed", self.resource))
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        use std::io::BufRead;

        self.write(command).await?;
        let mut reply = String::new();
        std::io::BufReader::new(&self.instrument)
            .read_line(&mut reply)
            .with_context(|| format!("Read from {} failed", self.resource))?;
        let reply = reply.trim_end_matches(['\r', '\n']).to_string();
        debug!("<- [{}] {}", self.resource, reply);
        Ok(reply)
    }

    fn describe(&self) -> String {
        self.resource.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    #[test]
    fn test_prologix_escape() {
        assert_eq!(prologix_escape(":SOUR:VOLT:LEV -25"), ":SOUR:VOLT:LEV -25");
        assert_eq!(prologix_escape("+1.0"), "\x1b+1.0");
    }

    #[tokio::test]
    async fn test_serial_query_roundtrip() {
        let (host, device) = duplex(256);
        let instrument = tokio::spawn(async move {
            let mut device = BufReader::new(device);
            let mut command = String::new();
            device.read_line(&mut command).await.unwrap();
            assert_eq!(command, "GET:CHANNEL ?\n");
            device.get_mut().write_all(b"7\r\n").await.unwrap();
        });

        let mut transport =
            SerialTransport::new(shared_line(host), "/dev/ttyACM0", Duration::from_secs(1));
        assert_eq!(transport.query("GET:CHANNEL ?").await.unwrap(), "7");
        instrument.await.unwrap();
    }

    #[tokio::test]
    async fn test_serial_query_times_out() {
        let (host, _device) = duplex(256);
        let mut transport =
            SerialTransport::new(shared_line(host), "/dev/ttyACM0", Duration::from_millis(20));
        let err = transport.query("*IDN?").await.unwrap_err();
        assert!(err.to_string().contains("Timed out"));
    }

    #[tokio::test]
    async fn test_prologix_selects_address_before_each_exchange() {
        let (host, device) = duplex(1024);
        let line = shared_line(host);
        let mut supply =
            PrologixTransport::new(line.clone(), "/dev/ttyUSB0", 24, Duration::from_secs(1));
        let mut lcr = PrologixTransport::new(line, "/dev/ttyUSB0", 17, Duration::from_secs(1));

        let instrument = tokio::spawn(async move {
            let mut device = BufReader::new(device);
            let mut received = Vec::new();
            for _ in 0..5 {
                let mut command = String::new();
                device.read_line(&mut command).await.unwrap();
                if command == "++read eoi\n" {
                    device.get_mut().write_all(b"1.0E+04\n").await.unwrap();
                }
                received.push(command.trim_end().to_string());
            }
            received
        });

        supply.write(":OUTP ON").await.unwrap();
        let freq = lcr.query(":FREQ:CW?").await.unwrap();
        assert_eq!(freq, "1.0E+04");
        assert_eq!(lcr.describe(), "GPIB address 17 on /dev/ttyUSB0");

        let received = instrument.await.unwrap();
        assert_eq!(
            received,
            vec!["++addr 24", ":OUTP ON", "++addr 17", ":FREQ:CW?", "++read eoi"]
        );
    }

    #[test]
    fn test_port_pool_reuses_lines() {
        let mut pool = PortPool::new();
        assert!(pool.is_empty());
        let (host, _device) = duplex(64);
        pool.insert("/dev/ttyUSB0", shared_line(host));
        let first = pool.get("/dev/ttyUSB0").unwrap();
        let second = pool.get("/dev/ttyUSB0").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);
        assert!(pool.get("/dev/ttyUSB1").is_none());
    }
}
