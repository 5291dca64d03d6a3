//! Point statistics.

use std::f64::consts::PI;

/// Mean and spread of the readings taken at one point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregate {
    /// Arithmetic mean
    pub mean: f64,
    /// Population standard deviation (divides by n)
    pub std_dev: f64,
    /// Number of readings
    pub count: usize,
}

/// Mean and population standard deviation; `None` for no readings.
///
/// A single reading has a spread of zero.
pub fn aggregate(samples: &[f64]) -> Option<Aggregate> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    Some(Aggregate {
        mean,
        std_dev: variance.sqrt(),
        count: samples.len(),
    })
}

/// Capacitance in pF from a reactance measured at `frequency`.
///
/// `C = -1 / (2 pi f X)`; a capacitor has negative reactance, so the result is positive.
pub fn capacitance_pf(frequency: f64, reactance: f64) -> f64 {
    -1e12 / (2.0 * PI * frequency * reactance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_has_no_aggregate() {
        assert!(aggregate(&[]).is_none());
    }

    #[test]
    fn test_single_sample_has_zero_spread() {
        let agg = aggregate(&[3.5]).unwrap();
        assert_eq!(agg.mean, 3.5);
        assert_eq!(agg.std_dev, 0.0);
        assert_eq!(agg.count, 1);
    }

    #[test]
    fn test_population_std() {
        let agg = aggregate(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(agg.mean, 5.0);
        assert!((agg.std_dev - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_identical_samples() {
        let agg = aggregate(&[1e-10; 5]).unwrap();
        assert!((agg.mean - 1e-10).abs() < 1e-24);
        assert!(agg.std_dev < 1e-24);
    }

    #[test]
    fn test_capacitance_from_reactance() {
        // 100 pF at 10 kHz
        let x = -1.0 / (2.0 * PI * 1e4 * 100e-12);
        assert!((capacitance_pf(1e4, x) - 100.0).abs() < 1e-9);
    }
}
