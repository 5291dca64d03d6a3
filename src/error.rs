//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the library. Using the
//! `thiserror` crate, it provides a consistent way to report the failures that can occur
//! outside the instrument drivers themselves: configuration loading and validation, sweep list
//! parsing, data storage and plot rendering.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically TOML syntax or type mismatches.
//! - **`Configuration`**: Semantic errors that pass parsing but are logically wrong (an empty
//!   voltage list, a voltage beyond the supply limit, a missing instrument section).
//! - **`SweepList`**: A plain-text sweep list file that cannot be parsed, with the offending
//!   line number.
//! - **`Io`**: Wraps `std::io::Error`.
//! - **`Storage`** / **`Plot`**: Failures writing or reading data files and rendering plots.
//! - **`Instrument`**: A general category for driver-level failures that cross into library code.
//! - **`FeatureNotEnabled`**: The configuration asks for a transport that was not compiled in.
//! - **`ShutdownFailed`**: One or more teardown steps failed; every step is still attempted.
//!
//! Instrument drivers return `anyhow::Result` with context, the same way the measurement code
//! propagates them; `DaqError` converts into `anyhow::Error` through `?`.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors raised outside the instrument drivers.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The configuration could not be read or deserialized
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The configuration parsed but holds an invalid value
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A sweep list file has a bad entry
    #[error("Sweep list {path}:{line}: {message}")]
    SweepList {
        /// File the list was read from
        path: String,
        /// 1-based line of the bad entry
        line: usize,
        /// What is wrong with it
        message: String,
    },

    /// File system failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A data file could not be written or read
    #[error("Storage error: {0}")]
    Storage(String),

    /// A plot could not be rendered
    #[error("Plot error: {0}")]
    Plot(String),

    /// An instrument could not be opened
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// The configured transport was not compiled in
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// One or more teardown steps failed, one message per step
    #[error("Shutdown failed with errors: {}", join_errors(.0))]
    ShutdownFailed(Vec<String>),
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl From<csv::Error> for DaqError {
    fn from(value: csv::Error) -> Self {
        DaqError::Storage(value.to_string())
    }
}

fn join_errors(errors: &[String]) -> String {
    errors.join("; ")
}
