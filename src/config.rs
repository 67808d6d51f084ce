use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Default input file, relative to the working directory
pub const DEFAULT_DATA_PATH: &str = "dataset-shuffled.csv";

/// Experiment-wide tunables. Every field has a default, so a config file
/// only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub data: DataConfig,
    pub train: TrainConfig,
    pub report: ReportConfig,
    /// Width of the hidden layer in the first iteration
    pub start_width: i64,
    /// Factor applied to the width between iterations
    pub growth_factor: i64,
    /// Number of widths to sweep over
    pub iterations: usize,
    /// Interval between resident memory samples, in milliseconds
    pub memory_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub path: PathBuf,
    /// Regression target, removed from the features
    pub target: String,
    pub train_fraction: f64,
    /// Seed for the train/test split
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    /// Fraction of the training rows held out for monitoring during fit
    pub validation_split: f64,
    pub batch_size: i64,
    /// Seed for weight initialization and batch shuffling
    pub seed: i64,
    /// Show a progress bar while fitting
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub output_dir: PathBuf,
    pub width: usize,
    pub height: usize,
    /// Open each figure after saving it
    pub show: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        SweepConfig {
            data: DataConfig::default(),
            train: TrainConfig::default(),
            report: ReportConfig::default(),
            start_width: 3,
            growth_factor: 2,
            iterations: 9,
            memory_interval_ms: 100,
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        DataConfig {
            path: PathBuf::from(DEFAULT_DATA_PATH),
            target: "security".to_string(),
            train_fraction: 0.7,
            seed: 0,
        }
    }
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            epochs: 10,
            learning_rate: 0.1,
            validation_split: 0.2,
            batch_size: 32,
            seed: 0,
            verbose: true,
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        ReportConfig {
            output_dir: PathBuf::from("."),
            width: 1024,
            height: 1024,
            show: true,
        }
    }
}

impl SweepConfig {
    /// Reads a YAML config file. Fields missing from the file keep their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: SweepConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.start_width < 1 {
            bail!("start width must be positive, got {}", self.start_width);
        }
        if self.growth_factor < 1 {
            bail!("growth factor must be positive, got {}", self.growth_factor);
        }
        if self.iterations == 0 {
            bail!("sweep needs at least one iteration");
        }
        let mut width = self.start_width;
        for _ in 1..self.iterations {
            width = match width.checked_mul(self.growth_factor) {
                Some(width) => width,
                None => bail!(
                    "{} iterations from width {} with growth factor {} overflow the width",
                    self.iterations,
                    self.start_width,
                    self.growth_factor
                ),
            };
        }
        if !(self.data.train_fraction > 0.0 && self.data.train_fraction < 1.0) {
            bail!(
                "train fraction must lie in (0, 1), got {}",
                self.data.train_fraction
            );
        }
        if self.memory_interval_ms == 0 {
            bail!("memory sampling interval must be at least 1 ms");
        }
        if self.data.target.is_empty() {
            bail!("target column name is empty");
        }
        self.train.validate()
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            bail!("epochs must be positive");
        }
        if !(self.learning_rate > 0.0) {
            bail!("learning rate must be positive, got {}", self.learning_rate);
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            bail!(
                "validation split must lie in [0, 1), got {}",
                self.validation_split
            );
        }
        if self.batch_size < 1 {
            bail!("batch size must be positive, got {}", self.batch_size);
        }
        Ok(())
    }
}

#[test]
fn test_defaults_match_experiment() {
    let config = SweepConfig::default();
    assert_eq!(config.start_width, 3);
    assert_eq!(config.growth_factor, 2);
    assert_eq!(config.iterations, 9);
    assert_eq!(config.train.epochs, 10);
    assert_eq!(config.train.learning_rate, 0.1);
    assert_eq!(config.train.validation_split, 0.2);
    assert_eq!(config.data.train_fraction, 0.7);
    assert_eq!(config.data.target, "security");
    assert!(config.validate().is_ok());
}

#[test]
fn test_partial_yaml_keeps_defaults() {
    let yaml = "iterations: 4\ntrain:\n  epochs: 3\n";
    let config: SweepConfig = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.iterations, 4);
    assert_eq!(config.train.epochs, 3);
    assert_eq!(config.train.learning_rate, 0.1);
    assert_eq!(config.start_width, 3);
    assert_eq!(config.data.path, PathBuf::from(DEFAULT_DATA_PATH));
}

#[test]
fn test_validate_rejects_bad_values() {
    let mut config = SweepConfig::default();
    config.data.train_fraction = 1.0;
    assert!(config.validate().is_err());

    let mut config = SweepConfig::default();
    config.train.validation_split = 1.0;
    assert!(config.validate().is_err());

    let mut config = SweepConfig::default();
    config.start_width = 0;
    assert!(config.validate().is_err());

    let mut config = SweepConfig::default();
    config.iterations = 63;
    assert!(config.validate().is_err());
    config.iterations = 62;
    assert!(config.validate().is_ok());
}
