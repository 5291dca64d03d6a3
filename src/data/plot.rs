//! SVG scatter plots with error bars.
//!
//! One plot per file: a set of points, optionally with symmetric vertical error bars, joined by
//! a line. Non-finite points are left out.

use crate::error::{AppResult, DaqError};
use plotters::prelude::*;
use std::ops::Range;
use std::path::Path;
use tracing::{info, warn};

/// Labels of one plot.
#[derive(Debug, Clone)]
pub struct PlotSpec<'a> {
    /// Caption above the chart
    pub title: &'a str,
    /// Horizontal axis label
    pub x_label: &'a str,
    /// Vertical axis label
    pub y_label: &'a str,
}

const SIZE: (u32, u32) = (1024, 768);

fn plot_error(e: impl std::fmt::Display) -> DaqError {
    DaqError::Plot(e.to_string())
}

/// Axis range covering `values` with a 5% margin.
fn padded_range(values: impl Iterator<Item = f64>) -> Range<f64> {
    let (min, max) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if !min.is_finite() || !max.is_finite() {
        return 0.0..1.0;
    }
    let span = max - min;
    let pad = if span > 0.0 {
        span * 0.05
    } else if min != 0.0 {
        min.abs() * 0.1
    } else {
        1.0
    };
    (min - pad)..(max + pad)
}

/// Render `y` over `x` to an SVG file.
///
/// `errors` gives the half-width of each point's error bar; missing or shorter slices mean no
/// bar for the remaining points.
pub fn render_plot(
    path: &Path,
    spec: &PlotSpec<'_>,
    x: &[f64],
    y: &[f64],
    errors: Option<&[f64]>,
) -> AppResult<()> {
    let points: Vec<(f64, f64, f64)> = x
        .iter()
        .zip(y)
        .enumerate()
        .map(|(i, (&x, &y))| {
            let err = errors
                .and_then(|e| e.get(i))
                .copied()
                .filter(|e| e.is_finite())
                .unwrap_or(0.0);
            (x, y, err.abs())
        })
        .filter(|(x, y, _)| x.is_finite() && y.is_finite())
        .collect();

    if points.is_empty() {
        warn!("No finite data for plot '{}', skipping", spec.title);
        return Err(DaqError::Plot(format!("no data for '{}'", spec.title)));
    }

    let x_range = padded_range(points.iter().map(|p| p.0));
    let y_range = padded_range(
        points
            .iter()
            .flat_map(|&(_, y, e)| [y - e, y + e].into_iter()),
    );

    let root = SVGBackend::new(path, SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(plot_error)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(spec.title, ("sans-serif", 24))
        .margin(20)
        .x_label_area_size(50)
        .y_label_area_size(90)
        .build_cartesian_2d(x_range, y_range)
        .map_err(plot_error)?;

    chart
        .configure_mesh()
        .x_desc(spec.x_label)
        .y_desc(spec.y_label)
        .x_label_formatter(&|v| format!("{:.3}", v))
        .y_label_formatter(&|v| format!("{:.2e}", v))
        .draw()
        .map_err(plot_error)?;

    chart
        .draw_series(LineSeries::new(
            points.iter().map(|&(x, y, _)| (x, y)),
            BLUE.mix(0.4),
        ))
        .map_err(plot_error)?;

    chart
        .draw_series(
            points
                .iter()
                .filter(|&&(_, _, e)| e > 0.0)
                .map(|&(x, y, e)| ErrorBar::new_vertical(x, y - e, y, y + e, BLUE.filled(), 6)),
        )
        .map_err(plot_error)?;

    chart
        .draw_series(
            points
                .iter()
                .map(|&(x, y, _)| Circle::new((x, y), 3, BLUE.filled())),
        )
        .map_err(plot_error)?;

    root.present().map_err(plot_error)?;
    info!("Plot saved to {}", path.display());
    Ok(())
}
