use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use plotly::{
    common::{Font, Mode, Title},
    layout::{Axis, GridPattern, LayoutGrid, RowOrder},
    ImageFormat, Layout, NamedColor, Plot, Scatter,
};
use tracing::info;

use crate::{
    config::ReportConfig,
    sweep::{MetricSeries, Phase},
};

const FONT_SIZE: usize = 16;

/// Path of the figure for `phase`, e.g. `train.png`
pub fn figure_path(phase: Phase, config: &ReportConfig) -> PathBuf {
    config.output_dir.join(format!("{}.png", phase.name()))
}

fn axis(title: &str) -> Axis {
    Axis::new()
        .title(Title::from(title).font(Font::new().size(FONT_SIZE)))
        .grid_color(NamedColor::DarkGray)
}

/// Three stacked panels (time, memory, MAE) against neuron count
pub fn figure(series: &MetricSeries, phase: Phase) -> Plot {
    let neurons = series.widths().to_vec();
    let panels = [
        (series.time(phase), "Time (s)"),
        (series.memory(phase), "Memory Usage (mb)"),
        (series.mae(phase), "MAE"),
    ];

    let mut plot = Plot::new();
    for (i, (values, label)) in panels.into_iter().enumerate() {
        let trace = Scatter::new(neurons.clone(), values.to_vec())
            .mode(Mode::LinesMarkers)
            .name(label)
            .x_axis(&format!("x{}", i + 1))
            .y_axis(&format!("y{}", i + 1));
        plot.add_trace(trace);
    }

    let layout = Layout::new()
        .title(Title::from(format!("{} phase", phase.name()).as_str()))
        .show_legend(false)
        .grid(
            LayoutGrid::new()
                .rows(3)
                .columns(1)
                .pattern(GridPattern::Independent)
                .row_order(RowOrder::TopToBottom),
        )
        .y_axis(axis(panels[0].1))
        .y_axis2(axis(panels[1].1))
        .y_axis3(axis(panels[2].1))
        .x_axis(Axis::new().grid_color(NamedColor::DarkGray))
        .x_axis2(Axis::new().grid_color(NamedColor::DarkGray))
        .x_axis3(axis("neurons"));
    plot.set_layout(layout);

    plot
}

/// Writes the figure for `phase` as a PNG, replacing any existing file
pub fn render(series: &MetricSeries, phase: Phase, config: &ReportConfig) -> Result<PathBuf> {
    if series.is_empty() {
        bail!("no sweep results to plot");
    }
    std::fs::create_dir_all(&config.output_dir).with_context(|| {
        format!(
            "failed to create output directory {}",
            config.output_dir.display()
        )
    })?;

    let path = figure_path(phase, config);
    let plot = figure(series, phase);
    plot.save(&path, ImageFormat::PNG, config.width, config.height, 1.0);

    let written = std::fs::metadata(&path)
        .with_context(|| format!("figure {} was not written", path.display()))?;
    if written.len() == 0 {
        bail!("figure {} is empty", path.display());
    }
    info!("saved {} figure to {}", phase.name(), path.display());

    if config.show {
        plot.show();
    }
    Ok(path)
}

/// Writes `train.png` then `test.png`
pub fn render_all(series: &MetricSeries, config: &ReportConfig) -> Result<[PathBuf; 2]> {
    Ok([
        render(series, Phase::Train, config)?,
        render(series, Phase::Test, config)?,
    ])
}

#[test]
fn test_figure_path() {
    let config = ReportConfig {
        output_dir: PathBuf::from("out"),
        ..Default::default()
    };
    assert_eq!(figure_path(Phase::Train, &config), PathBuf::from("out/train.png"));
    assert_eq!(figure_path(Phase::Test, &config), PathBuf::from("out/test.png"));
}

#[test]
fn test_render_rejects_empty_series() {
    let config = ReportConfig {
        show: false,
        ..Default::default()
    };
    assert!(render(&MetricSeries::default(), Phase::Train, &config).is_err());
}
