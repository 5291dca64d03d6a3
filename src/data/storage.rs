//! Tab-delimited data files.
//!
//! Layout, compatible with `numpy.loadtxt`:
//!
//! ```text
//! # Single C-V measurement W12_D04
//! # Measurement Settings:
//! # Power supply voltage limit:      5.00E+02 V
//! # ...
//! #
//! # Nominal Voltage [V]	Measured Voltage [V]	Frequency [Hz]	...
//! -2.50000E+01	-2.49990E+01	1.00000E+04	...
//! ```
//!
//! Every value is written in `%.5E` notation. Lines starting with `#` are the header.

use crate::error::{AppResult, DaqError};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::info;

/// One row of a data file.
pub trait TableRow {
    /// Column names with units, in row order
    const COLUMNS: &'static [&'static str];

    /// Values in column order
    fn values(&self) -> Vec<f64>;
}

/// Header block of a data file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileHeader {
    lines: Vec<String>,
}

impl FileHeader {
    /// Header starting with `title`
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            lines: vec![title.into(), "Measurement Settings:".to_string()],
        }
    }

    /// Numeric setting, e.g. `Power supply voltage limit:      5.00E+02 V`
    pub fn setting(mut self, label: &str, value: f64, unit: &str) -> Self {
        self.lines.push(format!(
            "{:<33}{:>9} {}",
            format!("{}:", label),
            format_sci(value, 2),
            unit
        ));
        self
    }

    /// Text setting
    pub fn text(mut self, label: &str, value: &str) -> Self {
        self.lines
            .push(format!("{:<33}{}", format!("{}:", label), value));
        self
    }

    /// Header lines without the `# ` prefix
    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

/// Format like C's `%.<precision>E`: two-digit signed exponent (`1.00000E+00`).
pub fn format_sci(value: f64, precision: usize) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    let formatted = format!("{:.*E}", precision, value);
    match formatted.split_once('E') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{}E{}{:02}", mantissa, sign, exponent.abs())
        }
        None => formatted,
    }
}

/// Write `rows` under `header` to `path`, replacing any existing file.
pub fn write_table<R: TableRow>(path: &Path, header: &FileHeader, rows: &[R]) -> AppResult<()> {
    let file = File::create(path).map_err(|e| {
        DaqError::Storage(format!("Failed to create '{}': {}", path.display(), e))
    })?;
    let mut file = BufWriter::new(file);

    for line in header.lines() {
        writeln!(file, "# {}", line)?;
    }
    writeln!(file, "#")?;
    writeln!(file, "# {}", R::COLUMNS.join("\t"))?;

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(file);
    for row in rows {
        writer.write_record(row.values().iter().map(|v| format_sci(*v, 5)))?;
    }
    writer.flush()?;

    info!("Wrote {} rows to {}", rows.len(), path.display());
    Ok(())
}

/// Read the numeric rows of a data file, skipping the header.
pub fn read_table(path: &Path) -> AppResult<Vec<Vec<f64>>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let row = record
            .iter()
            .map(|field| {
                field.parse::<f64>().map_err(|_| {
                    DaqError::Storage(format!(
                        "{}: row {}: invalid number '{}'",
                        path.display(),
                        index + 1,
                        field
                    ))
                })
            })
            .collect::<AppResult<Vec<f64>>>()?;
        rows.push(row);
    }
    Ok(rows)
}

/// Header lines of a data file, without the `# ` prefix.
pub fn read_header(path: &Path) -> AppResult<Vec<String>> {
    let file = BufReader::new(File::open(path)?);
    let mut lines = Vec::new();
    for line in file.lines() {
        let line = line?;
        match line.strip_prefix('#') {
            Some(rest) => lines.push(rest.strip_prefix(' ').unwrap_or(rest).to_string()),
            None => break,
        }
    }
    Ok(lines)
}
