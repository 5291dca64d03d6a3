//! Plain-text sweep list files.
//!
//! A sweep list is a file of numbers (bias voltages or cell indices), separated by whitespace
//! or commas, one or more per line. Everything after `#` on a line is a comment. Files are read
//! once per run and never written by this crate.

use crate::error::{AppResult, DaqError};
use std::path::Path;

/// Load a sweep list from `path`.
///
/// Fails fast on the first token that is not a finite number, naming the line it is on.
pub fn load_sweep_list(path: &Path) -> AppResult<Vec<f64>> {
    let content = std::fs::read_to_string(path).map_err(|e| DaqError::SweepList {
        path: path.display().to_string(),
        line: 0,
        message: e.to_string(),
    })?;
    parse_sweep_list(&content, &path.display().to_string())
}

/// Parse sweep list text. `origin` is only used in error messages.
pub fn parse_sweep_list(content: &str, origin: &str) -> AppResult<Vec<f64>> {
    let mut values = Vec::new();

    for (index, raw_line) in content.lines().enumerate() {
        let line = raw_line.split('#').next().unwrap_or_default();
        for token in line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
        {
            let value: f64 = token.parse().map_err(|_| DaqError::SweepList {
                path: origin.to_string(),
                line: index + 1,
                message: format!("invalid number '{}'", token),
            })?;
            if !value.is_finite() {
                return Err(DaqError::SweepList {
                    path: origin.to_string(),
                    line: index + 1,
                    message: format!("non-finite value '{}'", token),
                });
            }
            values.push(value);
        }
    }

    if values.is_empty() {
        return Err(DaqError::SweepList {
            path: origin.to_string(),
            line: 0,
            message: "contains no values".to_string(),
        });
    }

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parses_one_value_per_line() {
        let values = parse_sweep_list("-25\n-50\n-75\n", "inline").unwrap();
        assert_eq!(values, vec![-25.0, -50.0, -75.0]);
    }

    #[test]
    fn test_accepts_mixed_separators_and_comments() {
        let text = "# CV 6 inch, negative bias\n0, -10 -20\n\n-30 # last\n";
        let values = parse_sweep_list(text, "inline").unwrap();
        assert_eq!(values, vec![0.0, -10.0, -20.0, -30.0]);
    }

    #[test]
    fn test_reports_line_of_bad_token() {
        let err = parse_sweep_list("10\n20\nabc\n", "volts.txt").unwrap_err();
        match err {
            DaqError::SweepList { line, message, .. } => {
                assert_eq!(line, 3);
                assert!(message.contains("abc"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_empty_file() {
        assert!(parse_sweep_list("# nothing here\n", "empty.txt").is_err());
    }

    #[test]
    fn test_rejects_non_finite_values() {
        assert!(parse_sweep_list("10 inf", "inline").is_err());
    }

    #[test]
    fn test_loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "25 50 75").unwrap();
        let values = load_sweep_list(file.path()).unwrap();
        assert_eq!(values, vec![25.0, 50.0, 75.0]);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = load_sweep_list(Path::new("/nonexistent/voltages.txt")).unwrap_err();
        assert!(matches!(err, DaqError::SweepList { line: 0, .. }));
    }
}
