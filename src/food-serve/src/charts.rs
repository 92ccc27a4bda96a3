use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::metrics::ConfusionMatrix;
use crate::Result;

const CHART_WIDTH: f64 = 800.0;
const CHART_HEIGHT: f64 = 500.0;
const MARGIN_TOP: f64 = 60.0;
const MARGIN_RIGHT: f64 = 40.0;
const MARGIN_BOTTOM: f64 = 80.0;
const MARGIN_LEFT: f64 = 80.0;

const COLOR_GRID: &str = "#ecf0f1";
const COLOR_AXIS: &str = "#2c3e50";
const COLOR_TEXT: &str = "#2c3e50";

pub const COLOR_TRAIN: &str = "#3498db";
pub const COLOR_VALIDATION: &str = "#e67e22";

/// A named line, one value per epoch.
#[derive(Debug, Clone)]
pub struct Series {
    pub name: String,
    pub values: Vec<f64>,
    pub color: &'static str,
}

impl Series {
    pub fn new(name: &str, values: Vec<f64>, color: &'static str) -> Self {
        Series {
            name: name.to_owned(),
            values,
            color,
        }
    }
}

/// Render a line chart with epochs (1-based) on the x axis.
pub fn line_chart(
    title: &str,
    x_label: &str,
    y_label: &str,
    series: &[Series],
    output_path: &Path,
) -> Result<()> {
    let plot_width = CHART_WIDTH - MARGIN_LEFT - MARGIN_RIGHT;
    let plot_height = CHART_HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;

    let points = series.iter().map(|s| s.values.len()).max().unwrap_or(0);
    let x_max = (points.max(2) - 1) as f64;
    let y_max = series
        .iter()
        .flat_map(|s| s.values.iter().copied())
        .filter(|v| v.is_finite())
        .fold(0.0f64, f64::max);
    let y_max = if y_max > 0.0 { y_max * 1.05 } else { 1.0 };

    let to_x = |i: usize| MARGIN_LEFT + (i as f64 / x_max) * plot_width;
    let to_y = |v: f64| MARGIN_TOP + plot_height - (v / y_max) * plot_height;

    let mut svg = header(title);

    for i in 0..=5 {
        let value = y_max * i as f64 / 5.0;
        let y = to_y(value);
        let _ = write!(
            svg,
            r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="1"/>"#,
            MARGIN_LEFT,
            y,
            MARGIN_LEFT + plot_width,
            y,
            COLOR_GRID
        );
        let _ = write!(
            svg,
            r#"<text x="{}" y="{}" text-anchor="end" font-family="Arial, sans-serif" font-size="12" fill="{}">{:.2}</text>"#,
            MARGIN_LEFT - 10.0,
            y + 4.0,
            COLOR_TEXT,
            value
        );
    }

    axes(&mut svg, plot_width, plot_height, x_label, y_label);

    // at most ~10 epoch ticks
    let step = (points / 10).max(1);
    for i in (0..points).step_by(step) {
        let _ = write!(
            svg,
            r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="11" fill="{}">{}</text>"#,
            to_x(i),
            MARGIN_TOP + plot_height + 20.0,
            COLOR_TEXT,
            i + 1
        );
    }

    for s in series {
        if s.values.is_empty() {
            continue;
        }

        let path = s
            .values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let cmd = if i == 0 { 'M' } else { 'L' };
                format!("{} {:.2} {:.2}", cmd, to_x(i), to_y(*v))
            })
            .collect::<Vec<_>>()
            .join(" ");

        let _ = write!(
            svg,
            r#"<path d="{}" fill="none" stroke="{}" stroke-width="2"/>"#,
            path, s.color
        );
    }

    let mut legend_y = MARGIN_TOP + 10.0;
    for s in series {
        let _ = write!(
            svg,
            r#"<rect x="{}" y="{}" width="15" height="15" fill="{}"/><text x="{}" y="{}" font-family="Arial, sans-serif" font-size="12" fill="{}">{}</text>"#,
            CHART_WIDTH - MARGIN_RIGHT - 160.0,
            legend_y,
            s.color,
            CHART_WIDTH - MARGIN_RIGHT - 140.0,
            legend_y + 12.0,
            COLOR_TEXT,
            escape_xml(&s.name)
        );
        legend_y += 25.0;
    }

    svg.push_str("</svg>");
    fs::write(output_path, svg)?;
    Ok(())
}

/// Render a confusion matrix as a blue heat map, true labels on the y axis.
pub fn confusion_matrix_chart(cm: &ConfusionMatrix, labels: &[String], output_path: &Path) -> Result<()> {
    let n = cm.num_classes().max(1);
    let plot = (CHART_HEIGHT - MARGIN_TOP - MARGIN_BOTTOM).min(CHART_WIDTH - 2.0 * MARGIN_LEFT);
    let cell = plot / n as f64;
    let max = cm.max().max(1) as f64;
    let show_counts = n <= 20;

    let mut svg = header("Confusion Matrix");

    for (row, counts) in cm.rows().iter().enumerate() {
        for (col, count) in counts.iter().enumerate() {
            let intensity = *count as f64 / max;
            let x = MARGIN_LEFT + col as f64 * cell;
            let y = MARGIN_TOP + row as f64 * cell;

            let _ = write!(
                svg,
                r#"<rect x="{:.2}" y="{:.2}" width="{:.2}" height="{:.2}" fill="{}"/>"#,
                x,
                y,
                cell,
                cell,
                blues(intensity)
            );

            if show_counts {
                let fill = if intensity > 0.5 { "white" } else { COLOR_TEXT };
                let _ = write!(
                    svg,
                    r#"<text x="{:.2}" y="{:.2}" text-anchor="middle" font-family="Arial, sans-serif" font-size="11" fill="{}">{}</text>"#,
                    x + cell / 2.0,
                    y + cell / 2.0 + 4.0,
                    fill,
                    count
                );
            }
        }
    }

    if show_counts {
        for (i, label) in labels.iter().take(n).enumerate() {
            let offset = i as f64 * cell + cell / 2.0;
            let _ = write!(
                svg,
                r#"<text x="{:.2}" y="{:.2}" text-anchor="end" font-family="Arial, sans-serif" font-size="10" fill="{}">{}</text>"#,
                MARGIN_LEFT - 6.0,
                MARGIN_TOP + offset + 3.0,
                COLOR_TEXT,
                escape_xml(label)
            );
            let _ = write!(
                svg,
                r#"<text x="{:.2}" y="{:.2}" text-anchor="end" font-family="Arial, sans-serif" font-size="10" fill="{}" transform="rotate(-45 {:.2} {:.2})">{}</text>"#,
                MARGIN_LEFT + offset,
                MARGIN_TOP + plot + 14.0,
                COLOR_TEXT,
                MARGIN_LEFT + offset,
                MARGIN_TOP + plot + 14.0,
                escape_xml(label)
            );
        }
    }

    let _ = write!(
        svg,
        r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{}">Predicted Label</text>"#,
        MARGIN_LEFT + plot / 2.0,
        CHART_HEIGHT - 10.0,
        COLOR_TEXT
    );
    let _ = write!(
        svg,
        r#"<text x="20" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{}" transform="rotate(-90 20 {})">True Label</text>"#,
        MARGIN_TOP + plot / 2.0,
        COLOR_TEXT,
        MARGIN_TOP + plot / 2.0
    );

    svg.push_str("</svg>");
    fs::write(output_path, svg)?;
    Ok(())
}

fn header(title: &str) -> String {
    let mut svg = String::new();
    let _ = write!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {w} {h}" width="{w}" height="{h}"><rect width="{w}" height="{h}" fill="white"/>"#,
        w = CHART_WIDTH,
        h = CHART_HEIGHT
    );
    let _ = write!(
        svg,
        r#"<text x="{}" y="35" text-anchor="middle" font-family="Arial, sans-serif" font-size="18" font-weight="bold" fill="{}">{}</text>"#,
        CHART_WIDTH / 2.0,
        COLOR_TEXT,
        escape_xml(title)
    );
    svg
}

fn axes(svg: &mut String, plot_width: f64, plot_height: f64, x_label: &str, y_label: &str) {
    let _ = write!(
        svg,
        r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="2"/>"#,
        MARGIN_LEFT,
        MARGIN_TOP + plot_height,
        MARGIN_LEFT + plot_width,
        MARGIN_TOP + plot_height,
        COLOR_AXIS
    );
    let _ = write!(
        svg,
        r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="2"/>"#,
        MARGIN_LEFT,
        MARGIN_TOP,
        MARGIN_LEFT,
        MARGIN_TOP + plot_height,
        COLOR_AXIS
    );
    let _ = write!(
        svg,
        r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{}">{}</text>"#,
        MARGIN_LEFT + plot_width / 2.0,
        CHART_HEIGHT - 20.0,
        COLOR_TEXT,
        escape_xml(x_label)
    );
    let _ = write!(
        svg,
        r#"<text x="20" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{}" transform="rotate(-90 20 {})">{}</text>"#,
        CHART_HEIGHT / 2.0,
        COLOR_TEXT,
        CHART_HEIGHT / 2.0,
        escape_xml(y_label)
    );
}

/// White to dark blue.
fn blues(intensity: f64) -> String {
    let t = intensity.max(0.0).min(1.0);
    let lerp = |from: f64, to: f64| (from + (to - from) * t).round() as u8;
    format!("#{:02x}{:02x}{:02x}", lerp(247.0, 8.0), lerp(251.0, 48.0), lerp(255.0, 107.0))
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
