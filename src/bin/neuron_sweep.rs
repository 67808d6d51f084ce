use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use neuron_sweep::{
    dataset::{self, synthetic},
    SweepConfig,
};

/// Train a two layer regression network over a sweep of hidden widths and
/// plot time, memory and error against neuron count.
#[derive(Parser)]
struct Cli {
    /// CSV dataset with a header row
    #[arg(short, long, value_name = "PATH")]
    data: Option<PathBuf>,
    /// YAML file overriding the default configuration
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(short, long, value_name = "INT")]
    epochs: Option<usize>,
    #[arg(long, value_name = "FLOAT")]
    learning_rate: Option<f64>,
    /// Hidden width of the first iteration
    #[arg(long, value_name = "INT")]
    start_width: Option<i64>,
    /// Number of widths to sweep over
    #[arg(long, value_name = "INT")]
    iterations: Option<usize>,
    /// Directory for train.png and test.png
    #[arg(short, long, value_name = "DIR")]
    output_dir: Option<PathBuf>,
    /// Use a generated dataset with this many rows instead of reading a file
    #[arg(long, value_name = "ROWS")]
    synthetic: Option<usize>,
    /// Do not open the figures after saving them
    #[arg(long)]
    no_show: bool,
    /// Hide the training progress bars
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn into_config(self) -> Result<(SweepConfig, Option<usize>)> {
        let mut config = match &self.config {
            Some(path) => SweepConfig::from_yaml_file(path)?,
            None => SweepConfig::default(),
        };
        if let Some(data) = self.data {
            config.data.path = data;
        }
        if let Some(epochs) = self.epochs {
            config.train.epochs = epochs;
        }
        if let Some(learning_rate) = self.learning_rate {
            config.train.learning_rate = learning_rate;
        }
        if let Some(start_width) = self.start_width {
            config.start_width = start_width;
        }
        if let Some(iterations) = self.iterations {
            config.iterations = iterations;
        }
        if let Some(output_dir) = self.output_dir {
            config.report.output_dir = output_dir;
        }
        if self.no_show {
            config.report.show = false;
        }
        if self.quiet {
            config.train.verbose = false;
        }
        config.validate()?;
        Ok((config, self.synthetic))
    }
}

fn install_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .init();
}

fn main() -> Result<()> {
    install_logger();
    let (config, synthetic_rows) = Cli::parse().into_config()?;

    let data = match synthetic_rows {
        Some(rows) => {
            info!("generating a synthetic dataset with {rows} rows");
            let table = synthetic(rows, 3, &config.data.target, config.data.seed)?;
            dataset::prepare_table(&table, &config.data)?
        }
        None => {
            info!("reading dataset from {}", config.data.path.display());
            dataset::prepare(&config.data)?
        }
    };

    neuron_sweep::run(&data, &config)?;
    Ok(())
}
