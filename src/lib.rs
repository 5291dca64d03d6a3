//! # semi_daq
//!
//! Data acquisition for semiconductor probe-station measurements: bias sweeps with a source
//! meter, capacitance readings with an LCR meter and cell scans through a switch matrix.
//!
//! ## Crate Structure
//!
//! - **`config`**: TOML run configuration loaded with figment. See `config::Settings`.
//! - **`data`**: run directories, tab-delimited data files and SVG plots.
//! - **`error`**: the `DaqError` enum shared across the crate.
//! - **`hardware`**: capability traits (`PowerSource`, `ImpedanceMeter`, `ChannelSwitch`),
//!   transports (serial, Prologix GPIB-USB, VISA), drivers and mocks.
//! - **`logging`**: tracing subscriber setup.
//! - **`measurement`**: the bias sweep engine and the measurement kinds built on it.
//! - **`metadata`**: the `metadata.json` written next to every data set.

pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod measurement;
pub mod metadata;
