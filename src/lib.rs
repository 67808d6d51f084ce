//! Measures how the hidden width of a small regression network affects
//! training and inference cost. For every width in a doubling sweep a fresh
//! two layer network is trained and tested, with wall-clock time, peak
//! resident memory and mean absolute error recorded for both phases.

use anyhow::Result;
use tracing::info;

pub mod config;
pub mod dataset;
pub mod model;
pub mod profile;
pub mod report;
pub mod sweep;

pub use config::SweepConfig;
pub use dataset::{PreparedData, Table};
pub use model::{FitReport, Regressor};
pub use sweep::{MetricSeries, Phase, SweepRecord};

/// Sweeps over prepared data and writes both figures
pub fn run(data: &PreparedData, config: &SweepConfig) -> Result<MetricSeries> {
    let series = sweep::run_sweep(data, config)?;
    info!("sweep finished\n{}", sweep::format_series(&series));
    report::render_all(&series, &config.report)?;
    Ok(series)
}
