use std::{collections::HashSet, fmt::Write as _, path::Path};

use anyhow::{anyhow, bail, Context, Result};
use rand::{prelude::Distribution, rngs::StdRng, Rng, SeedableRng};
use statrs::{
    distribution::Normal,
    statistics::{Data, Distribution as _, Max, Min, OrderStatistics},
};
use tch::Tensor;
use tracing::{debug, info};

use crate::config::DataConfig;

/// An ordered table of numeric rows sharing one column schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<f64>>,
}

/// Row indices (into the source table) of each partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Descriptive statistics of one column
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnStats {
    pub column: String,
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation (n - 1 denominator)
    pub std: f64,
    pub min: f64,
    pub q25: f64,
    pub q50: f64,
    pub q75: f64,
    pub max: f64,
}

/// Normalized features and raw labels for both partitions
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub train_features: Table,
    pub train_labels: Vec<f64>,
    pub test_features: Table,
    pub test_labels: Vec<f64>,
    /// Training statistics used for normalization
    pub stats: Vec<ColumnStats>,
    pub split: Split,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<f64>>) -> Result<Table> {
        let mut seen = HashSet::with_capacity(columns.len());
        for column in &columns {
            if !seen.insert(column.as_str()) {
                bail!("duplicate column `{column}`");
            }
        }
        for (r, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                bail!(
                    "row {r} has {} values but the header has {} columns",
                    row.len(),
                    columns.len()
                );
            }
        }
        Ok(Table { columns, rows })
    }

    /// Reads a comma separated file with a header row. Every cell must be numeric.
    pub fn from_csv(path: impl AsRef<Path>) -> Result<Table> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("failed to open dataset {}", path.display()))?;

        let columns: Vec<String> = reader
            .headers()
            .with_context(|| format!("failed to read header of {}", path.display()))?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for (r, record) in reader.records().enumerate() {
            let record =
                record.with_context(|| format!("malformed row {} in {}", r + 1, path.display()))?;
            let row = record
                .iter()
                .zip(&columns)
                .map(|(cell, column)| {
                    cell.parse::<f64>().with_context(|| {
                        format!(
                            "non-numeric value {cell:?} in column `{column}`, row {} of {}",
                            r + 1,
                            path.display()
                        )
                    })
                })
                .collect::<Result<Vec<f64>>>()?;
            rows.push(row);
        }

        debug!(
            "read {} rows x {} columns from {}",
            rows.len(),
            columns.len(),
            path.display()
        );
        Table::new(columns, rows)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    fn column_index(&self, column: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| anyhow!("column `{column}` not found in {:?}", self.columns))
    }

    pub fn column(&self, column: &str) -> Result<Vec<f64>> {
        let idx = self.column_index(column)?;
        Ok(self.rows.iter().map(|row| row[idx]).collect())
    }

    /// Removes a column from the table and returns its values
    pub fn pop(&mut self, column: &str) -> Result<Vec<f64>> {
        let idx = self.column_index(column)?;
        self.columns.remove(idx);
        Ok(self.rows.iter_mut().map(|row| row.remove(idx)).collect())
    }

    /// New table holding the given rows, in the given order
    pub fn select(&self, indices: &[usize]) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: indices.iter().map(|&i| self.rows[i].clone()).collect(),
        }
    }

    /// Randomly partitions the rows. The first partition holds
    /// `round(train_fraction * n)` rows in sampled order, the second holds
    /// the rest in their original order.
    pub fn split(&self, train_fraction: f64, seed: u64) -> (Table, Table, Split) {
        let n = self.n_rows();
        let n_train = ((train_fraction * n as f64).round() as usize).min(n);

        let mut rng = StdRng::seed_from_u64(seed);
        let train: Vec<usize> = rand::seq::index::sample(&mut rng, n, n_train).into_vec();

        let in_train: HashSet<usize> = train.iter().copied().collect();
        let test: Vec<usize> = (0..n).filter(|i| !in_train.contains(i)).collect();

        let split = Split { train, test };
        (self.select(&split.train), self.select(&split.test), split)
    }

    pub fn describe(&self) -> Vec<ColumnStats> {
        self.columns
            .iter()
            .enumerate()
            .map(|(c, column)| {
                let values: Vec<f64> = self.rows.iter().map(|row| row[c]).collect();
                let count = values.len();
                let mut data = Data::new(values);
                ColumnStats {
                    column: column.clone(),
                    count,
                    mean: data.mean().unwrap_or(f64::NAN),
                    std: data.std_dev().unwrap_or(f64::NAN),
                    min: data.min(),
                    q25: data.lower_quartile(),
                    q50: data.quantile(0.5),
                    q75: data.upper_quartile(),
                    max: data.max(),
                }
            })
            .collect()
    }

    /// Standardizes each column as `(value - mean) / std` with the given
    /// statistics. A column whose standard deviation is zero (or not finite)
    /// cannot be standardized and is reported as an error.
    pub fn normalize(&self, stats: &[ColumnStats]) -> Result<Table> {
        let mut scales = Vec::with_capacity(self.n_columns());
        for column in &self.columns {
            let stat = stats
                .iter()
                .find(|s| &s.column == column)
                .ok_or_else(|| anyhow!("no statistics for column `{column}`"))?;
            if stat.std == 0.0 || !stat.std.is_finite() {
                bail!(
                    "feature column `{column}` has standard deviation {} in the training \
                     partition and cannot be normalized",
                    stat.std
                );
            }
            scales.push((stat.mean, stat.std));
        }

        let rows = self
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&scales)
                    .map(|(value, (mean, std))| (value - mean) / std)
                    .collect()
            })
            .collect();

        Ok(Table {
            columns: self.columns.clone(),
            rows,
        })
    }

    /// `[n_rows, n_columns]` float tensor
    pub fn to_tensor(&self) -> Tensor {
        let flat: Vec<f32> = self.rows.iter().flatten().map(|&v| v as f32).collect();
        Tensor::of_slice(&flat).view([self.n_rows() as i64, self.n_columns() as i64])
    }
}

/// `[n, 1]` float tensor of regression targets
pub fn labels_tensor(labels: &[f64]) -> Tensor {
    let labels: Vec<f32> = labels.iter().map(|&v| v as f32).collect();
    Tensor::of_slice(&labels).view([-1, 1])
}

/// Loads the dataset, splits it, removes the target and normalizes the
/// features with statistics from the training partition only.
pub fn prepare(config: &DataConfig) -> Result<PreparedData> {
    let table = Table::from_csv(&config.path)?;
    prepare_table(&table, config)
}

pub fn prepare_table(table: &Table, config: &DataConfig) -> Result<PreparedData> {
    if table.n_rows() == 0 {
        bail!("dataset has no rows");
    }
    // Fail on a missing target before doing any work
    table.column_index(&config.target)?;

    let (mut train, mut test, split) = table.split(config.train_fraction, config.seed);
    info!(
        "split {} rows into {} train / {} test (seed {})",
        table.n_rows(),
        train.n_rows(),
        test.n_rows(),
        config.seed
    );

    let train_labels = train.pop(&config.target)?;
    let test_labels = test.pop(&config.target)?;
    if train.n_columns() == 0 {
        bail!("dataset has no feature columns besides `{}`", config.target);
    }

    let stats = train.describe();
    debug!("training statistics:\n{}", format_stats(&stats));

    let train_features = train.normalize(&stats)?;
    let test_features = test.normalize(&stats)?;

    Ok(PreparedData {
        train_features,
        train_labels,
        test_features,
        test_labels,
        stats,
        split,
    })
}

/// Renders statistics as a transposed `describe()` table
pub fn format_stats(stats: &[ColumnStats]) -> String {
    let width = stats
        .iter()
        .map(|s| s.column.len())
        .max()
        .unwrap_or(0)
        .max(6);
    let mut out = format!(
        "{:width$} {:>6} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}\n",
        "", "count", "mean", "std", "min", "25%", "50%", "75%", "max"
    );
    for s in stats {
        let _ = writeln!(
            out,
            "{:width$} {:>6} {:>10.4} {:>10.4} {:>10.4} {:>10.4} {:>10.4} {:>10.4} {:>10.4}",
            s.column, s.count, s.mean, s.std, s.min, s.q25, s.q50, s.q75, s.max
        );
    }
    out
}

/// Synthetic regression table with feature columns `x0..` drawn uniformly
/// from [-1, 1) and target `security = 3 * x0 + 2` plus small gaussian noise.
pub fn synthetic(rows: usize, features: usize, target: &str, seed: u64) -> Result<Table> {
    if features == 0 {
        bail!("synthetic table needs at least one feature");
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 0.1)?;

    let mut columns: Vec<String> = (0..features).map(|i| format!("x{i}")).collect();
    columns.push(target.to_string());

    let data = (0..rows)
        .map(|_| {
            let mut row: Vec<f64> = (0..features).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let y = 3.0 * row[0] + 2.0 + noise.sample(&mut rng);
            row.push(y);
            row
        })
        .collect();

    Table::new(columns, data)
}

#[cfg(test)]
fn write_csv(name: &str, contents: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("neuron_sweep_{}_{name}", std::process::id()));
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_from_csv() {
    let path = write_csv("ok.csv", "a,b,security\n1,2,3\n4, 5 ,6\n");
    let table = Table::from_csv(&path).unwrap();
    assert_eq!(table.columns(), &["a", "b", "security"]);
    assert_eq!(table.rows(), &[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
    std::fs::remove_file(path).unwrap();
}

#[test]
fn test_from_csv_rejects_non_numeric() {
    let path = write_csv("text.csv", "a,security\n1,2\nfoo,3\n");
    let err = Table::from_csv(&path).unwrap_err();
    assert!(format!("{err:#}").contains("column `a`"));
    std::fs::remove_file(path).unwrap();
}

#[test]
fn test_from_csv_rejects_ragged_rows() {
    let path = write_csv("ragged.csv", "a,b,security\n1,2,3\n4,5\n");
    assert!(Table::from_csv(&path).is_err());
    std::fs::remove_file(path).unwrap();
}

#[test]
fn test_pop_missing_column() {
    let mut table = synthetic(10, 2, "security", 0).unwrap();
    assert!(table.pop("nope").is_err());
    let labels = table.pop("security").unwrap();
    assert_eq!(labels.len(), 10);
    assert_eq!(table.columns(), &["x0", "x1"]);
    assert!(table.rows().iter().all(|row| row.len() == 2));
}

#[test]
fn test_split_partitions_rows() {
    let table = synthetic(101, 3, "security", 1).unwrap();
    let (train, test, split) = table.split(0.7, 0);
    assert_eq!(train.n_rows(), 71);
    assert_eq!(test.n_rows(), 30);

    let mut all: Vec<usize> = split.train.iter().chain(&split.test).copied().collect();
    all.sort_unstable();
    assert_eq!(all, (0..101).collect::<Vec<_>>());

    // Test rows keep the source order
    assert!(split.test.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(train.rows()[0], table.rows()[split.train[0]]);
}

#[test]
fn test_split_is_deterministic() {
    let table = synthetic(50, 2, "security", 3).unwrap();
    let (_, _, first) = table.split(0.7, 0);
    let (_, _, second) = table.split(0.7, 0);
    assert_eq!(first, second);
}

#[test]
fn test_describe() {
    let table = Table::new(
        vec!["a".to_string()],
        vec![vec![1.0], vec![2.0], vec![3.0], vec![4.0]],
    )
    .unwrap();
    let stats = table.describe();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].count, 4);
    assert_eq!(stats[0].mean, 2.5);
    // Sample standard deviation
    assert!((stats[0].std - (5.0_f64 / 3.0).sqrt()).abs() < 1e-12);
    assert_eq!(stats[0].min, 1.0);
    assert_eq!(stats[0].max, 4.0);
}

#[test]
fn test_normalize_zero_std_is_an_error() {
    let table = Table::new(
        vec!["flat".to_string(), "varied".to_string()],
        vec![vec![1.0, 1.0], vec![1.0, 2.0], vec![1.0, 3.0]],
    )
    .unwrap();
    let stats = table.describe();
    let err = table.normalize(&stats).unwrap_err();
    assert!(err.to_string().contains("`flat`"));
}

#[test]
fn test_stats_come_from_train_only() {
    let table = synthetic(100, 3, "security", 7).unwrap();
    let config = DataConfig::default();
    let prepared = prepare_table(&table, &config).unwrap();

    let mut train = table.select(&prepared.split.train);
    train.pop("security").unwrap();
    let train_only = train.describe();

    for (a, b) in prepared.stats.iter().zip(&train_only) {
        assert_eq!(a.mean.to_bits(), b.mean.to_bits());
        assert_eq!(a.std.to_bits(), b.std.to_bits());
    }

    // Normalized training features have zero mean and unit std
    for stat in prepared.train_features.describe() {
        assert!(stat.mean.abs() < 1e-9);
        assert!((stat.std - 1.0).abs() < 1e-9);
    }
    assert_eq!(prepared.test_features.n_rows(), prepared.test_labels.len());
}

#[test]
fn test_tensor_shapes() {
    let table = synthetic(5, 3, "security", 0).unwrap();
    assert_eq!(table.to_tensor().size(), vec![5, 4]);
    assert_eq!(labels_tensor(&[1.0, 2.0]).size(), vec![2, 1]);
}
