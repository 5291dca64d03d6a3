//! CLI Entry Point for semi-daq
//!
//! Provides command-line interface for:
//! - Running a measurement described by a TOML file
//! - Validating a measurement file without touching hardware
//! - Listing the serial ports instruments can be reached on
//!
//! # Usage
//!
//! Run a measurement:
//! ```bash
//! semi-daq run config/single_cv.toml --sample-id W12_D04
//! ```
//!
//! Dry run against simulated instruments:
//! ```bash
//! semi-daq run config/scan_cv.toml --mock
//! ```
//!
//! Ctrl-C stops the sweep; the supply is ramped down and the data taken so far is saved.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use semi_daq::config::Settings;
use semi_daq::data::RunDirectory;
use semi_daq::hardware::{available_ports, BenchInstruments};
use semi_daq::logging::{self, OutputFormat, TracingConfig};
use semi_daq::measurement::{
    create_measurement, run_measurement, CancelToken, MeasurementContext, SweepPlan,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "semi-daq")]
#[command(about = "Probe-station C-V and I-V measurements", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the measurement described by a configuration file
    Run {
        /// Path to the measurement TOML file
        config: PathBuf,

        /// Override measurement.sample_id
        #[arg(long)]
        sample_id: Option<String>,

        /// Use simulated instruments for every connection
        #[arg(long)]
        mock: bool,

        /// Console log format
        #[arg(long, value_enum, default_value = "compact")]
        log_format: OutputFormat,

        /// Disable ANSI colours in console output
        #[arg(long)]
        no_color: bool,

        /// Log span enter and exit events
        #[arg(long)]
        span_events: bool,
    },

    /// Check a configuration file without opening any instrument
    Validate {
        /// Path to the measurement TOML file
        config: PathBuf,
    },

    /// List serial ports
    Ports,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            sample_id,
            mock,
            log_format,
            no_color,
            span_events,
        } => {
            let logging = LogOptions {
                format: log_format,
                ansi: !no_color,
                span_events,
            };
            run(config, sample_id, mock, logging).await
        }
        Commands::Validate { config } => validate(config),
        Commands::Ports => list_ports(),
    }
}

/// Console logging choices from the command line.
struct LogOptions {
    format: OutputFormat,
    ansi: bool,
    span_events: bool,
}

fn load(path: &Path, sample_id: Option<String>, mock: bool) -> Result<Settings> {
    let mut settings = Settings::load_from(path)
        .with_context(|| format!("Loading '{}' failed", path.display()))?;
    if let Some(id) = sample_id {
        settings.measurement.sample_id = id;
    }
    if mock {
        settings = settings.with_mock_instruments();
    }

    let measurement = create_measurement(settings.measurement.kind);
    measurement
        .check(&settings)
        .with_context(|| format!("Invalid configuration '{}'", path.display()))?;
    Ok(settings)
}

async fn run(
    config: PathBuf,
    sample_id: Option<String>,
    mock: bool,
    log_options: LogOptions,
) -> Result<()> {
    let settings = load(&config, sample_id, mock)?;
    let run = RunDirectory::create(&settings.storage.output_dir, &settings.measurement.sample_id)?;

    let tracing_config = TracingConfig::from_settings(&settings)
        .map_err(|e| anyhow!(e))?
        .with_format(log_options.format)
        .with_ansi(log_options.ansi)
        .with_span_events(log_options.span_events)
        .with_log_file(run.file("measurement.log"));
    logging::init(tracing_config).map_err(|e| anyhow!(e))?;
    if mock {
        tracing::warn!("Running against simulated instruments");
    }

    let cancel = CancelToken::new();
    let ctrl_c = cancel.cancel_on_ctrl_c();

    let mut measurement = create_measurement(settings.measurement.kind);
    let ctx = MeasurementContext::new(settings, run, cancel);
    let mut instruments = BenchInstruments::new();
    let result = run_measurement(measurement.as_mut(), &ctx, &mut instruments).await;
    ctrl_c.abort();

    let report = result?;
    println!(
        "{}: {} rows, {} plots in {}",
        report.status,
        report.rows,
        report.plots.len(),
        ctx.run.path().display()
    );
    Ok(())
}

fn validate(config: PathBuf) -> Result<()> {
    let settings = load(&config, None, false)?;
    let plan = SweepPlan::from_settings(&settings)?;

    println!(
        "{}: {} measurement of '{}'",
        config.display(),
        settings.measurement.kind,
        settings.measurement.sample_id
    );
    println!(
        "  {} voltages, {} V to {} V",
        plan.voltages.len(),
        plan.voltages.first().copied().unwrap_or_default(),
        plan.voltages.last().copied().unwrap_or_default()
    );
    if settings.measurement.kind.needs_lcr_meter() {
        println!("  frequencies: {:?} Hz", settings.frequencies());
    }
    if settings.measurement.kind.needs_switch_card() {
        println!("  cells: {:?}", settings.sweep.cells);
    }
    println!("  output: {}", settings.storage.output_dir.display());
    Ok(())
}

fn list_ports() -> Result<()> {
    let ports = available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}", port);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_flags_parse() {
        let cli = Cli::try_parse_from([
            "semi-daq",
            "run",
            "config/single_iv.toml",
            "--no-color",
            "--span-events",
            "--log-format",
            "json",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                no_color,
                span_events,
                log_format,
                ..
            } => {
                assert!(no_color);
                assert!(span_events);
                assert_eq!(log_format, OutputFormat::Json);
            }
            _ => panic!("expected the run command"),
        }
    }

    #[test]
    fn test_console_flags_default_off() {
        let cli = Cli::try_parse_from(["semi-daq", "run", "config/single_iv.toml"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Run {
                no_color: false,
                span_events: false,
                ..
            }
        ));
    }
}
