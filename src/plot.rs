//! SVG rendering of the recorded metrics and of predicted test images.

use crate::error::{Error, Result};
use crate::metrics::MetricsHistory;
use crate::mnist::{HEIGHT, WIDTH};
use std::fmt::{self, Write};
use std::path::Path;

const PANEL_WIDTH: f64 = 420.0;
const PANEL_HEIGHT: f64 = 300.0;
const MARGIN: f64 = 50.0;
const TRAIN_COLOR: &str = "#1f77b4";
const TEST_COLOR: &str = "#ff7f0e";

/// Pixel size of each image cell in the predictions grid.
const CELL_SCALE: usize = 3;
const CELL_TITLE: usize = 16;

struct Series<'a> {
    name: &'a str,
    color: &'a str,
    steps: &'a [usize],
    values: &'a [f64],
}

struct Panel<'a> {
    title: &'a str,
    /// Fixed y range; computed from the data when `None`.
    y_range: Option<(f64, f64)>,
    series: [Series<'a>; 2],
}

/// Two side-by-side panels, loss then accuracy, each with a train and a test curve.
pub fn render_history_svg(history: &MetricsHistory) -> String {
    let mut svg = String::new();
    // writing into a String never fails
    let _ = write_history_svg(&mut svg, history);
    svg
}

fn write_history_svg(svg: &mut String, history: &MetricsHistory) -> fmt::Result {
    let width = 2.0 * (PANEL_WIDTH + 2.0 * MARGIN);
    let height = PANEL_HEIGHT + 2.0 * MARGIN;
    writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" font-family="sans-serif" font-size="12">"#
    )?;
    writeln!(svg, r#"<rect width="100%" height="100%" fill="white"/>"#)?;

    let loss = Panel {
        title: "Loss",
        y_range: None,
        series: [
            Series {
                name: "train",
                color: TRAIN_COLOR,
                steps: &history.train_step,
                values: &history.train_loss,
            },
            Series {
                name: "test",
                color: TEST_COLOR,
                steps: &history.test_step,
                values: &history.test_loss,
            },
        ],
    };
    let accuracy = Panel {
        title: "Accuracy",
        y_range: Some((0.0, 1.0)),
        series: [
            Series {
                name: "train",
                color: TRAIN_COLOR,
                steps: &history.train_step,
                values: &history.train_accuracy,
            },
            Series {
                name: "test",
                color: TEST_COLOR,
                steps: &history.test_step,
                values: &history.test_accuracy,
            },
        ],
    };

    write_panel(svg, &loss, MARGIN, MARGIN)?;
    write_panel(svg, &accuracy, PANEL_WIDTH + 3.0 * MARGIN, MARGIN)?;
    writeln!(svg, "</svg>")
}

fn write_panel(svg: &mut String, panel: &Panel, left: f64, top: f64) -> fmt::Result {
    let bottom = top + PANEL_HEIGHT;
    let right = left + PANEL_WIDTH;

    writeln!(
        svg,
        r#"<text x="{}" y="{}" text-anchor="middle" font-size="14">{}</text>"#,
        left + PANEL_WIDTH / 2.0,
        top - 15.0,
        panel.title
    )?;
    writeln!(
        svg,
        r#"<path d="M{left},{top} L{left},{bottom} L{right},{bottom}" stroke="black" fill="none"/>"#
    )?;

    let steps = panel.series.iter().flat_map(|s| s.steps.iter().copied());
    let (x_min, x_max) = match (steps.clone().min(), steps.max()) {
        (Some(min), Some(max)) => (min as f64, max as f64),
        _ => return Ok(()),
    };
    let (y_min, y_max) = panel.y_range.unwrap_or_else(|| {
        let values = panel.series.iter().flat_map(|s| s.values.iter().copied());
        let max = values.fold(0.0f64, f64::max);
        (0.0, if max > 0.0 { max } else { 1.0 })
    });
    let x_span = if x_max > x_min { x_max - x_min } else { 1.0 };
    let y_span = if y_max > y_min { y_max - y_min } else { 1.0 };
    let project = |step: usize, value: f64| {
        let x = left + (step as f64 - x_min) / x_span * PANEL_WIDTH;
        let y = bottom - (value.clamp(y_min, y_max) - y_min) / y_span * PANEL_HEIGHT;
        (x, y)
    };

    // tick labels at the ends of both axes
    writeln!(
        svg,
        r#"<text x="{}" y="{}" text-anchor="end">{y_max:.2}</text>"#,
        left - 5.0,
        top + 4.0
    )?;
    writeln!(
        svg,
        r#"<text x="{}" y="{}" text-anchor="end">{y_min:.2}</text>"#,
        left - 5.0,
        bottom + 4.0
    )?;
    writeln!(
        svg,
        r#"<text x="{left}" y="{}" text-anchor="middle">{x_min}</text>"#,
        bottom + 18.0
    )?;
    writeln!(
        svg,
        r#"<text x="{right}" y="{}" text-anchor="middle">{x_max}</text>"#,
        bottom + 18.0
    )?;

    for (i, series) in panel.series.iter().enumerate() {
        let points: Vec<String> = series
            .steps
            .iter()
            .zip(series.values)
            .map(|(step, value)| {
                let (x, y) = project(*step, *value);
                format!("{x:.1},{y:.1}")
            })
            .collect();
        if !points.is_empty() {
            writeln!(
                svg,
                r#"<polyline points="{}" stroke="{}" stroke-width="2" fill="none"/>"#,
                points.join(" "),
                series.color
            )?;
        }

        let legend_y = top + 15.0 + 16.0 * i as f64;
        writeln!(
            svg,
            r#"<line x1="{}" y1="{legend_y}" x2="{}" y2="{legend_y}" stroke="{}" stroke-width="2"/>"#,
            right - 70.0,
            right - 50.0,
            series.color
        )?;
        writeln!(
            svg,
            r#"<text x="{}" y="{}">{}</text>"#,
            right - 45.0,
            legend_y + 4.0,
            series.name
        )?;
    }
    Ok(())
}

/// Grid of images titled with their predicted label, in red when it differs from the true label.
///
/// `images` hold `HEIGHT * WIDTH` brightness values in `[0, 1]`.
pub fn render_predictions_svg(
    images: &[Vec<f32>],
    predictions: &[usize],
    labels: &[usize],
    columns: usize,
) -> String {
    let mut svg = String::new();
    // writing into a String never fails
    let _ = write_predictions_svg(&mut svg, images, predictions, labels, columns.max(1));
    svg
}

fn write_predictions_svg(
    svg: &mut String,
    images: &[Vec<f32>],
    predictions: &[usize],
    labels: &[usize],
    columns: usize,
) -> fmt::Result {
    let count = images.len().min(predictions.len()).min(labels.len());
    let rows = count.div_ceil(columns);
    let cell_width = WIDTH * CELL_SCALE + 8;
    let cell_height = HEIGHT * CELL_SCALE + CELL_TITLE + 8;
    writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{}" height="{}" font-family="sans-serif" font-size="12">"#,
        columns.min(count.max(1)) * cell_width,
        rows.max(1) * cell_height
    )?;
    writeln!(svg, r#"<rect width="100%" height="100%" fill="white"/>"#)?;

    for i in 0..count {
        let left = (i % columns) * cell_width + 4;
        let top = (i / columns) * cell_height + 4;
        let color = if predictions[i] == labels[i] {
            "black"
        } else {
            "red"
        };
        writeln!(
            svg,
            r#"<text x="{}" y="{}" text-anchor="middle" fill="{color}">label={}</text>"#,
            left + WIDTH * CELL_SCALE / 2,
            top + CELL_TITLE - 4,
            predictions[i]
        )?;

        let image_top = top + CELL_TITLE;
        writeln!(
            svg,
            r#"<rect x="{left}" y="{image_top}" width="{}" height="{}" fill="black"/>"#,
            WIDTH * CELL_SCALE,
            HEIGHT * CELL_SCALE
        )?;
        for (p, brightness) in images[i].iter().enumerate().take(WIDTH * HEIGHT) {
            if *brightness <= 0.0 {
                continue;
            }
            writeln!(
                svg,
                r#"<rect x="{}" y="{}" width="{CELL_SCALE}" height="{CELL_SCALE}" fill="white" fill-opacity="{:.2}"/>"#,
                left + (p % WIDTH) * CELL_SCALE,
                image_top + (p / WIDTH) * CELL_SCALE,
                brightness.min(1.0)
            )?;
        }
    }
    writeln!(svg, "</svg>")
}

pub fn save_svg(path: &Path, svg: &str) -> Result<()> {
    std::fs::write(path, svg).map_err(|e| Error::io(path, e))?;
    tracing::info!("Plot saved to {path:?}");
    Ok(())
}
