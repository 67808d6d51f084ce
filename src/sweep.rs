use std::{
    fmt::Write as _,
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use itertools::izip;
use tch::Tensor;
use tracing::info;

use crate::{
    config::SweepConfig,
    dataset::{labels_tensor, PreparedData},
    model::{mean_absolute_error, FitReport, Regressor},
    profile::{memory_usage, peak},
};

/// Which half of an iteration a metric belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Test,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Test => "test",
        }
    }
}

/// Cost and error of one phase
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseMetrics {
    pub elapsed_secs: f64,
    pub peak_memory_mb: f64,
    pub mae: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepRecord {
    pub width: i64,
    pub train: PhaseMetrics,
    pub test: PhaseMetrics,
}

/// Everything one iteration produced
#[derive(Debug, Clone)]
pub struct Iteration {
    pub record: SweepRecord,
    pub fit: FitReport,
    pub predictions: Vec<f32>,
}

/// Per-width metrics as parallel sequences in sweep order. Records are
/// pushed whole, so every sequence always has the same length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSeries {
    widths: Vec<i64>,
    train_time: Vec<f64>,
    train_memory: Vec<f64>,
    train_mae: Vec<f64>,
    test_time: Vec<f64>,
    test_memory: Vec<f64>,
    test_mae: Vec<f64>,
}

impl MetricSeries {
    pub fn with_capacity(n: usize) -> Self {
        MetricSeries {
            widths: Vec::with_capacity(n),
            train_time: Vec::with_capacity(n),
            train_memory: Vec::with_capacity(n),
            train_mae: Vec::with_capacity(n),
            test_time: Vec::with_capacity(n),
            test_memory: Vec::with_capacity(n),
            test_mae: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, record: SweepRecord) {
        self.widths.push(record.width);
        self.train_time.push(record.train.elapsed_secs);
        self.train_memory.push(record.train.peak_memory_mb);
        self.train_mae.push(record.train.mae);
        self.test_time.push(record.test.elapsed_secs);
        self.test_memory.push(record.test.peak_memory_mb);
        self.test_mae.push(record.test.mae);
    }

    pub fn len(&self) -> usize {
        self.widths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widths.is_empty()
    }

    pub fn widths(&self) -> &[i64] {
        &self.widths
    }

    pub fn time(&self, phase: Phase) -> &[f64] {
        match phase {
            Phase::Train => &self.train_time,
            Phase::Test => &self.test_time,
        }
    }

    pub fn memory(&self, phase: Phase) -> &[f64] {
        match phase {
            Phase::Train => &self.train_memory,
            Phase::Test => &self.test_memory,
        }
    }

    pub fn mae(&self, phase: Phase) -> &[f64] {
        match phase {
            Phase::Train => &self.train_mae,
            Phase::Test => &self.test_mae,
        }
    }

    pub fn records(&self) -> impl Iterator<Item = SweepRecord> + '_ {
        izip!(
            &self.widths,
            &self.train_time,
            &self.train_memory,
            &self.train_mae,
            &self.test_time,
            &self.test_memory,
            &self.test_mae
        )
        .map(
            |(&width, &train_time, &train_memory, &train_mae, &test_time, &test_memory, &test_mae)| {
                SweepRecord {
                    width,
                    train: PhaseMetrics {
                        elapsed_secs: train_time,
                        peak_memory_mb: train_memory,
                        mae: train_mae,
                    },
                    test: PhaseMetrics {
                        elapsed_secs: test_time,
                        peak_memory_mb: test_memory,
                        mae: test_mae,
                    },
                }
            },
        )
    }
}

/// Tensors shared, read only, by every iteration
pub struct SweepInputs {
    pub train_features: Tensor,
    pub train_labels: Tensor,
    pub test_features: Tensor,
    pub test_labels: Vec<f64>,
}

impl SweepInputs {
    pub fn new(data: &PreparedData) -> Self {
        SweepInputs {
            train_features: data.train_features.to_tensor(),
            train_labels: labels_tensor(&data.train_labels),
            test_features: data.test_features.to_tensor(),
            test_labels: data.test_labels.clone(),
        }
    }

    pub fn n_features(&self) -> i64 {
        self.train_features.size()[1]
    }
}

/// Hidden widths visited by the sweep: `start_width` multiplied by
/// `growth_factor` after every iteration. Stops early rather than overflow;
/// `SweepConfig::validate` rejects such configurations.
pub fn widths(config: &SweepConfig) -> Vec<i64> {
    std::iter::successors(Some(config.start_width), |w| w.checked_mul(config.growth_factor))
        .take(config.iterations)
        .collect()
}

/// Builds, trains and tests a fresh model of the given width, timing and
/// memory profiling both phases.
pub fn run_iteration(width: i64, inputs: &SweepInputs, config: &SweepConfig) -> Result<Iteration> {
    let interval = Duration::from_millis(config.memory_interval_ms);

    info!("Neurons: {width}");
    let mut model = Regressor::new(inputs.n_features(), width, &config.train)?;
    info!("\n{}", model.summary());

    let start = Instant::now();
    let (fit, samples) = memory_usage(interval, || {
        model.fit(&inputs.train_features, &inputs.train_labels)
    })?;
    let elapsed = start.elapsed().as_secs_f64();
    let fit = fit?;
    let train = PhaseMetrics {
        elapsed_secs: elapsed,
        peak_memory_mb: peak(&samples),
        mae: fit.train_loss,
    };
    info!("Total time taken to train: {:.4} s", train.elapsed_secs);
    info!("Maximum memory used to train: {:.2} MB", train.peak_memory_mb);
    info!("Training set Mean Abs Error: {:5.2} security", train.mae);

    let start = Instant::now();
    let (predictions, samples) =
        memory_usage(interval, || model.predict(&inputs.test_features))?;
    let elapsed = start.elapsed().as_secs_f64();
    let predictions = predictions?;
    let test = PhaseMetrics {
        elapsed_secs: elapsed,
        peak_memory_mb: peak(&samples),
        mae: mean_absolute_error(&predictions, &inputs.test_labels)?,
    };
    info!("Total time taken to test: {:.4} s", test.elapsed_secs);
    info!("Maximum memory used to test: {:.2} MB", test.peak_memory_mb);
    info!("Testing set Mean Abs Error: {:5.2} security", test.mae);

    Ok(Iteration {
        record: SweepRecord { width, train, test },
        fit,
        predictions,
    })
}

/// Runs one iteration per width, in order. The first error aborts the sweep.
pub fn run_sweep(data: &PreparedData, config: &SweepConfig) -> Result<MetricSeries> {
    config.validate()?;
    if data.test_labels.is_empty() {
        bail!("test partition is empty");
    }

    let inputs = SweepInputs::new(data);
    let widths = widths(config);
    let mut series = MetricSeries::with_capacity(widths.len());
    for (i, &width) in widths.iter().enumerate() {
        info!("iteration {}/{}", i + 1, widths.len());
        let iteration = run_iteration(width, &inputs, config)?;
        series.push(iteration.record);
    }
    Ok(series)
}

/// Fixed width table of every record
pub fn format_series(series: &MetricSeries) -> String {
    let mut out = format!(
        "{:>8} {:>12} {:>12} {:>10} {:>12} {:>12} {:>10}\n",
        "neurons", "train (s)", "train (MB)", "train MAE", "test (s)", "test (MB)", "test MAE"
    );
    for r in series.records() {
        let _ = writeln!(
            out,
            "{:>8} {:>12.4} {:>12.2} {:>10.2} {:>12.4} {:>12.2} {:>10.2}",
            r.width,
            r.train.elapsed_secs,
            r.train.peak_memory_mb,
            r.train.mae,
            r.test.elapsed_secs,
            r.test.peak_memory_mb,
            r.test.mae
        );
    }
    out
}

#[cfg(test)]
fn record(width: i64) -> SweepRecord {
    let w = width as f64;
    SweepRecord {
        width,
        train: PhaseMetrics {
            elapsed_secs: w,
            peak_memory_mb: w + 1.0,
            mae: w + 2.0,
        },
        test: PhaseMetrics {
            elapsed_secs: w + 3.0,
            peak_memory_mb: w + 4.0,
            mae: w + 5.0,
        },
    }
}

#[test]
fn test_default_widths() {
    let widths = widths(&SweepConfig::default());
    assert_eq!(widths, vec![3, 6, 12, 24, 48, 96, 192, 384, 768]);
    assert!(widths.windows(2).all(|w| w[1] == 2 * w[0]));
}

#[test]
fn test_widths_never_overflow() {
    let config = SweepConfig {
        iterations: 100,
        ..Default::default()
    };
    let widths = widths(&config);
    assert!(widths.len() < 100);
    assert!(widths.windows(2).all(|w| w[1] == 2 * w[0]));
    assert!(config.validate().is_err());
}

#[test]
fn test_series_sequences_stay_aligned() {
    let mut series = MetricSeries::default();
    for width in widths(&SweepConfig::default()) {
        series.push(record(width));
    }
    assert_eq!(series.len(), 9);
    for phase in [Phase::Train, Phase::Test] {
        assert_eq!(series.time(phase).len(), 9);
        assert_eq!(series.memory(phase).len(), 9);
        assert_eq!(series.mae(phase).len(), 9);
    }
    assert_eq!(series.mae(Phase::Test)[1], 11.0);
    assert_eq!(series.records().nth(2), Some(record(12)));
}

#[test]
fn test_format_series() {
    let mut series = MetricSeries::default();
    series.push(record(3));
    let table = format_series(&series);
    assert_eq!(table.lines().count(), 2);
    assert!(table.contains("neurons"));
    assert!(table.lines().nth(1).unwrap().trim_start().starts_with('3'));
}
