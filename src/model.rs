use std::fmt::Write as _;

use anyhow::{bail, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tch::{
    data::Iter2,
    nn::{self, Module, OptimizerConfig},
    Device, Kind, Reduction, Tensor,
};
use tracing::{debug, warn};

use crate::config::TrainConfig;

/// Two layer regression network: a ReLU hidden layer of configurable width
/// followed by a single linear output unit, trained with Adam on MSE.
pub struct Regressor {
    vs: nn::VarStore,
    net: nn::Sequential,
    opt: nn::Optimizer,
    n_features: i64,
    width: i64,
    config: TrainConfig,
}

/// Metrics of one training epoch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    /// Mean squared error over the training batches
    pub loss: f64,
    pub mae: f64,
    pub val_loss: Option<f64>,
    pub val_mae: Option<f64>,
}

/// Outcome of a call to [`Regressor::fit`]
#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    pub history: Vec<EpochStats>,
    /// Mean of the absolute per-epoch training loss
    pub train_loss: f64,
}

/// Loss and metrics of a model over a labelled set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub mae: f64,
    pub mse: f64,
}

impl Regressor {
    pub fn new(n_features: i64, width: i64, config: &TrainConfig) -> Result<Regressor> {
        if n_features < 1 {
            bail!("regressor needs at least one input feature, got {n_features}");
        }
        if width < 1 {
            bail!("hidden layer width must be positive, got {width}");
        }

        tch::manual_seed(config.seed);
        let device = Device::cuda_if_available();
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let net = nn::seq()
            .add(nn::linear(&root / "hidden", n_features, width, Default::default()))
            .add_fn(|xs| xs.relu())
            .add(nn::linear(&root / "output", width, 1, Default::default()));
        let opt = nn::Adam::default().build(&vs, config.learning_rate)?;

        debug!("built regressor {n_features} -> {width} -> 1 on {device:?}");
        Ok(Regressor {
            vs,
            net,
            opt,
            n_features,
            width,
            config: config.clone(),
        })
    }

    pub fn width(&self) -> i64 {
        self.width
    }

    pub fn n_features(&self) -> i64 {
        self.n_features
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// Trains for the configured number of epochs. The last
    /// `validation_split` fraction of the rows is held out and only
    /// evaluated, never trained on.
    pub fn fit(&mut self, features: &Tensor, labels: &Tensor) -> Result<FitReport> {
        let n_rows = features.size()[0];
        if labels.size()[0] != n_rows {
            bail!(
                "{} feature rows but {} labels",
                n_rows,
                labels.size()[0]
            );
        }

        // Keep the first floor(n * (1 - split)) rows for training
        let n_train = (n_rows as f64 * (1.0 - self.config.validation_split)).floor() as i64;
        if n_train < 1 {
            bail!("no training rows left after holding out the validation split");
        }
        let n_val = n_rows - n_train;

        // Rows are shuffled on the CPU and each batch is moved to the model device
        let device = self.device();
        let features = features.to_device(Device::Cpu);
        let labels = labels.to_device(Device::Cpu);
        let train_xs = features.narrow(0, 0, n_train);
        let train_ys = labels.narrow(0, 0, n_train);
        let validation = (n_val > 0).then(|| {
            (
                features.narrow(0, n_train, n_val).to_device(device),
                labels.narrow(0, n_train, n_val).to_device(device),
            )
        });

        let pb = if self.config.verbose {
            let pb = ProgressBar::new(self.config.epochs as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}]{bar:20.cyan/blue}{pos:>3}/{len:3} {msg}")?,
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        let mut rng = StdRng::seed_from_u64(self.config.seed as u64);
        let mut order: Vec<i64> = (0..n_train).collect();

        let mut history = Vec::with_capacity(self.config.epochs);
        for epoch in 1..=self.config.epochs {
            let mut loss_sum = 0f64;
            let mut mae_sum = 0f64;
            let mut samples = 0f64;

            order.shuffle(&mut rng);
            let index = Tensor::of_slice(&order);
            let mut batches = Iter2::new(
                &train_xs.index_select(0, &index),
                &train_ys.index_select(0, &index),
                self.config.batch_size,
            );
            batches.to_device(device).return_smaller_last_batch();
            for (xs, ys) in &mut batches {
                let output = self.net.forward(&xs);
                let loss = output.mse_loss(&ys, Reduction::Mean);
                self.opt.backward_step(&loss);

                // Weight by batch size so the epoch value is a per-sample mean
                let batch = xs.size()[0] as f64;
                loss_sum += f64::from(&loss) * batch;
                mae_sum += f64::from(&(&output - &ys).abs().mean(Kind::Float).detach()) * batch;
                samples += batch;
            }

            let loss = loss_sum / samples;
            let mae = mae_sum / samples;
            if !loss.is_finite() {
                warn!("epoch {epoch}: training loss is {loss}");
            }

            let val = validation
                .as_ref()
                .map(|(xs, ys)| self.evaluate(xs, ys));
            let stats = EpochStats {
                epoch,
                loss,
                mae,
                val_loss: val.map(|v| v.loss),
                val_mae: val.map(|v| v.mae),
            };
            history.push(stats);

            pb.inc(1);
            pb.set_message(format_epoch(&stats));
        }
        pb.finish();

        let train_loss = history.iter().map(|s| s.loss.abs()).sum::<f64>() / history.len() as f64;
        Ok(FitReport {
            history,
            train_loss,
        })
    }

    /// Predicts one value per row, without touching the weights
    pub fn predict(&self, features: &Tensor) -> Result<Vec<f32>> {
        let n_cols = features.size().get(1).copied().unwrap_or(0);
        if n_cols != self.n_features {
            bail!(
                "model expects {} features but got {}",
                self.n_features,
                n_cols
            );
        }
        let features = features.to_device(self.device());
        let output = tch::no_grad(|| self.net.forward(&features));
        Ok(Vec::<f32>::from(
            output.to_device(Device::Cpu).contiguous().view(-1),
        ))
    }

    /// Loss and metrics over a labelled set, computed by the framework
    pub fn evaluate(&self, features: &Tensor, labels: &Tensor) -> Evaluation {
        let device = self.device();
        let features = features.to_device(device);
        let labels = labels.to_device(device);
        tch::no_grad(|| {
            let output = self.net.forward(&features);
            let mse = f64::from(&output.mse_loss(&labels, Reduction::Mean));
            let mae = f64::from(&(&output - &labels).abs().mean(Kind::Float));
            Evaluation { loss: mse, mae, mse }
        })
    }

    /// Number of scalar parameters whose variable name starts with `prefix`
    fn count_params(&self, prefix: &str) -> usize {
        self.vs
            .variables()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(_, tensor)| tensor.numel())
            .sum()
    }

    pub fn trainable_params(&self) -> usize {
        self.vs
            .trainable_variables()
            .iter()
            .map(Tensor::numel)
            .sum()
    }

    /// Layer by layer architecture table
    pub fn summary(&self) -> String {
        const RULE: &str =
            "_________________________________________________________________";
        const DOUBLE_RULE: &str =
            "=================================================================";

        let total = self.count_params("");
        let trainable = self.trainable_params();
        let layers = [
            ("hidden (Dense)", self.width, self.count_params("hidden.")),
            ("output (Dense)", 1, self.count_params("output.")),
        ];

        let mut out = format!("Model: \"regressor_{}\"\n{RULE}\n", self.width);
        let _ = writeln!(out, " {:<27} {:<25} {}", "Layer (type)", "Output Shape", "Param #");
        let _ = writeln!(out, "{DOUBLE_RULE}");
        for (i, (name, units, params)) in layers.iter().enumerate() {
            let _ = writeln!(out, " {:<27} {:<25} {}", name, format!("(None, {units})"), params);
            if i + 1 < layers.len() {
                let _ = writeln!(out, "{RULE}");
            }
        }
        let _ = writeln!(out, "{DOUBLE_RULE}");
        let _ = writeln!(out, "Total params: {total}");
        let _ = writeln!(out, "Trainable params: {trainable}");
        let _ = writeln!(out, "Non-trainable params: {}", total - trainable);
        let _ = write!(out, "{RULE}");
        out
    }
}

fn format_epoch(stats: &EpochStats) -> String {
    match (stats.val_loss, stats.val_mae) {
        (Some(val_loss), Some(val_mae)) => format!(
            "loss={:1.3e} mae={:1.3e} val_loss={val_loss:1.3e} val_mae={val_mae:1.3e}",
            stats.loss, stats.mae
        ),
        _ => format!("loss={:1.3e} mae={:1.3e}", stats.loss, stats.mae),
    }
}

/// Mean of `|prediction - label|`
pub fn mean_absolute_error(predictions: &[f32], labels: &[f64]) -> Result<f64> {
    if predictions.len() != labels.len() {
        bail!(
            "{} predictions but {} labels",
            predictions.len(),
            labels.len()
        );
    }
    if predictions.is_empty() {
        bail!("mean absolute error of an empty set");
    }
    let total: f64 = predictions
        .iter()
        .zip(labels)
        .map(|(&p, &y)| (p as f64 - y).abs())
        .sum();
    Ok(total / labels.len() as f64)
}

#[cfg(test)]
fn quiet_config() -> TrainConfig {
    TrainConfig {
        verbose: false,
        ..Default::default()
    }
}

#[cfg(test)]
fn linear_data(n: i64) -> (Tensor, Tensor) {
    let x: Vec<f32> = (0..n).map(|i| i as f32 / n as f32 * 2.0 - 1.0).collect();
    let y: Vec<f32> = x.iter().map(|x| 3.0 * x + 2.0).collect();
    (
        Tensor::of_slice(&x).view([n, 1]),
        Tensor::of_slice(&y).view([n, 1]),
    )
}

#[test]
fn test_param_counts() {
    let model = Regressor::new(4, 3, &quiet_config()).unwrap();
    // (4 * 3 + 3) + (3 * 1 + 1)
    assert_eq!(model.trainable_params(), 19);
    assert_eq!(model.count_params("hidden."), 15);
    assert_eq!(model.count_params("output."), 4);

    let summary = model.summary();
    assert!(summary.contains("hidden (Dense)"));
    assert!(summary.contains("(None, 3)"));
    assert!(summary.contains("Total params: 19"));
}

#[test]
fn test_rejects_zero_width() {
    assert!(Regressor::new(3, 0, &quiet_config()).is_err());
    assert!(Regressor::new(0, 3, &quiet_config()).is_err());
}

#[test]
fn test_fit_reports_every_epoch() {
    let (xs, ys) = linear_data(100);
    let config = TrainConfig {
        epochs: 4,
        ..quiet_config()
    };
    let mut model = Regressor::new(1, 8, &config).unwrap();
    let report = model.fit(&xs, &ys).unwrap();

    assert_eq!(report.history.len(), 4);
    assert!(report.history.iter().all(|s| s.val_loss.is_some()));
    let expected = report.history.iter().map(|s| s.loss.abs()).sum::<f64>() / 4.0;
    assert!((report.train_loss - expected).abs() < 1e-12);
    assert!(report.train_loss >= 0.0);
}

#[test]
fn test_fit_without_validation() {
    let (xs, ys) = linear_data(20);
    let config = TrainConfig {
        epochs: 2,
        validation_split: 0.0,
        ..quiet_config()
    };
    let mut model = Regressor::new(1, 3, &config).unwrap();
    let report = model.fit(&xs, &ys).unwrap();
    assert!(report.history.iter().all(|s| s.val_loss.is_none()));
}

#[test]
fn test_fit_on_model_device() {
    let (xs, ys) = linear_data(50);
    let config = TrainConfig {
        epochs: 2,
        batch_size: 8,
        ..quiet_config()
    };
    let mut model = Regressor::new(1, 4, &config).unwrap();
    assert_eq!(model.device(), Device::cuda_if_available());

    // Inputs arrive on the CPU whatever device the weights live on
    let report = model.fit(&xs, &ys).unwrap();
    assert!(report.history.iter().all(|s| s.loss.is_finite()));
    assert!(report.history.iter().all(|s| s.val_loss.is_some()));
    assert_eq!(model.predict(&xs).unwrap().len(), 50);
}

#[test]
fn test_validation_rows_never_train() {
    let (xs, ys) = linear_data(100);
    let config = TrainConfig {
        epochs: 3,
        ..quiet_config()
    };

    // Same training rows, very different labels in the held out last 20%
    let mut altered: Vec<f32> = Vec::<f32>::from(ys.view(-1));
    for y in &mut altered[80..] {
        *y = 1000.0;
    }
    let altered_ys = Tensor::of_slice(&altered).view([100, 1]);

    let mut first = Regressor::new(1, 5, &config).unwrap();
    // Start from the same weights even if other tests touch the global generator
    let mut second = Regressor::new(1, 5, &config).unwrap();
    second.vs.copy(&first.vs).unwrap();

    let first_report = first.fit(&xs, &ys).unwrap();
    let first_predictions = first.predict(&xs).unwrap();
    let second_report = second.fit(&xs, &altered_ys).unwrap();
    let second_predictions = second.predict(&xs).unwrap();

    let losses = |report: &FitReport| report.history.iter().map(|s| s.loss).collect::<Vec<_>>();
    assert_eq!(losses(&first_report), losses(&second_report));
    assert_eq!(first_predictions, second_predictions);
    assert_ne!(
        first_report.history[0].val_loss,
        second_report.history[0].val_loss
    );
}

#[test]
fn test_predict_does_not_change_weights() {
    let (xs, _) = linear_data(10);
    let model = Regressor::new(1, 3, &quiet_config()).unwrap();
    let first = model.predict(&xs).unwrap();
    let second = model.predict(&xs).unwrap();
    assert_eq!(first.len(), 10);
    assert_eq!(first, second);
}

#[test]
fn test_predict_rejects_wrong_feature_count() {
    let model = Regressor::new(2, 3, &quiet_config()).unwrap();
    let xs = Tensor::of_slice(&[1.0_f32, 2.0, 3.0]).view([1, 3]);
    assert!(model.predict(&xs).is_err());
}

#[test]
fn test_direct_mae_matches_framework_mae() {
    let (xs, ys) = linear_data(64);
    let config = TrainConfig {
        epochs: 3,
        ..quiet_config()
    };
    let mut model = Regressor::new(1, 6, &config).unwrap();
    model.fit(&xs, &ys).unwrap();

    let predictions = model.predict(&xs).unwrap();
    let labels: Vec<f64> = Vec::<f32>::from(ys.view(-1))
        .into_iter()
        .map(f64::from)
        .collect();
    let direct = mean_absolute_error(&predictions, &labels).unwrap();
    let framework = model.evaluate(&xs, &ys).mae;
    assert!(direct >= 0.0);
    assert!((direct - framework).abs() <= 1e-4 * direct.max(1.0));
}

#[test]
fn test_mean_absolute_error() {
    let mae = mean_absolute_error(&[1.0, 2.0, 4.0], &[1.0, 3.0, 2.0]).unwrap();
    assert!((mae - 1.0).abs() < 1e-12);
    assert!(mean_absolute_error(&[1.0], &[1.0, 2.0]).is_err());
    assert!(mean_absolute_error(&[], &[]).is_err());
}
