use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Instant;

use tch::{nn, Device, Tensor};

use crate::config::Config;
use crate::data::DataSource;
use crate::error::{Error, Result};
use crate::loss::Criterion;
use crate::metrics::{EvalReport, Evaluator, Horizon, MetricKind};
use crate::model::Forecaster;
use crate::optim::Optim;
use crate::scaler::StandardScaler;

const BEST_VAL_SENTINEL: f64 = 1.0e7;
const CHECKPOINT_VERSION: i64 = 1;
const CHECKPOINT_VERSION_KEY: &str = "__checkpoint_version";

/// Receives user-facing training output. Owned by the executor so progress
/// reporting is an injected handle rather than process-wide state.
pub trait ProgressSink {
    fn epoch(&mut self, epoch: usize, seconds: f64, train_loss: f64, valid_loss: f64);
    fn early_stop(&mut self, epoch: usize);
    fn metric(&mut self, metric: &str, horizon: &str, value: f64);
}

/// Default sink: epoch lines and the final report go to stdout.
pub struct StdoutProgress;

impl ProgressSink for StdoutProgress {
    fn epoch(&mut self, epoch: usize, seconds: f64, train_loss: f64, valid_loss: f64) {
        println!(
            "| end of epoch {epoch:3} | time: {seconds:5.2}s | train_loss {train_loss:5.4} | valid mae {valid_loss:5.4}"
        );
    }

    fn early_stop(&mut self, epoch: usize) {
        println!("early stop at epoch: {epoch:04}");
    }

    fn metric(&mut self, metric: &str, horizon: &str, value: f64) {
        println!("{metric}: {horizon}: {value:.4}");
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Improved,
    Stalled,
    EarlyStop,
}

/// Model-selection policy: tracks the lowest validation loss seen, the
/// consecutive-epoch wait counter, and the consecutive non-finite run.
///
/// A non-finite loss never reaches the `best_val` comparison; it counts as
/// non-improving, and a long enough run of them aborts training outright.
#[derive(Debug)]
struct BestTracker {
    best_val: f64,
    wait: usize,
    patience: usize,
    non_finite_run: usize,
    divergence_patience: usize,
}

impl BestTracker {
    fn new(patience: usize, divergence_patience: usize) -> Self {
        Self {
            best_val: BEST_VAL_SENTINEL,
            wait: 0,
            patience,
            non_finite_run: 0,
            divergence_patience,
        }
    }

    fn observe(&mut self, valid_loss: f64) -> Result<Verdict> {
        if !valid_loss.is_finite() {
            self.non_finite_run += 1;
            if self.non_finite_run >= self.divergence_patience {
                return Err(Error::Divergence(format!(
                    "{} consecutive non-finite epochs",
                    self.non_finite_run
                )));
            }
            self.wait += 1;
            return Ok(self.stall_verdict());
        }
        self.non_finite_run = 0;
        if valid_loss < self.best_val {
            self.best_val = valid_loss;
            self.wait = 0;
            Ok(Verdict::Improved)
        } else {
            self.wait += 1;
            Ok(self.stall_verdict())
        }
    }

    fn stall_verdict(&self) -> Verdict {
        if self.wait >= self.patience {
            Verdict::EarlyStop
        } else {
            Verdict::Stalled
        }
    }

    fn best_val(&self) -> f64 {
        self.best_val
    }
}

/// Drives epoch-based optimization with validation-based model selection,
/// early stopping, checkpoint persistence, and multi-horizon evaluation.
///
/// Owns the live parameter store exclusively; the best-model snapshot is a
/// deep copy taken at improvement time, so later in-place training can never
/// mutate it. After `train` returns, the live parameters are the best
/// snapshot, and `save_model`/`evaluate` act on that state.
pub struct Executor<M: Forecaster> {
    device: Device,
    vs: nn::VarStore,
    model: M,
    scaler: StandardScaler,
    evaluator: Evaluator,
    criterion: Criterion,
    null_val: f64,
    val_metric: MetricKind,
    optim: Optim,
    epochs: usize,
    num_nodes: i64,
    lr_decay: bool,
    tracker: BestTracker,
    best_state: Option<Vec<(String, Tensor)>>,
    progress: Box<dyn ProgressSink>,
}

impl<M: Forecaster> Executor<M> {
    pub fn new(config: &Config, vs: nn::VarStore, model: M, scaler: StandardScaler) -> Result<Self> {
        let device = config.resolve_device()?;
        if vs.device() != device {
            return Err(Error::Configuration(format!(
                "model parameters live on {:?} but the configured device is {:?}",
                vs.device(),
                device
            )));
        }
        let optim = Optim::new(&vs, config)?;

        let parameter_count: usize = vs.trainable_variables().iter().map(|t| t.numel()).sum();
        log::info!("model has {parameter_count} trainable parameters");

        // The validation scalar strategy is fixed here, not re-branched per
        // epoch: the mask flag picks which "all"-horizon entry counts.
        let val_metric = if config.mask {
            MetricKind::MaskedMae
        } else {
            MetricKind::Mae
        };

        Ok(Self {
            device,
            vs,
            model,
            scaler,
            evaluator: Evaluator::new(config.null_val),
            criterion: config.train_loss.criterion(),
            null_val: config.null_val,
            val_metric,
            optim,
            epochs: config.epochs,
            num_nodes: config.num_nodes,
            lr_decay: config.lr_decay,
            tracker: BestTracker::new(config.patience, config.divergence_patience),
            best_state: None,
            progress: Box::new(StdoutProgress),
        })
    }

    /// Replace the default stdout sink.
    pub fn set_progress(&mut self, sink: Box<dyn ProgressSink>) {
        self.progress = sink;
    }

    /// Run the epoch loop until the budget is exhausted or patience runs out,
    /// leaving the best-validation snapshot as the active model.
    pub fn train(&mut self, train: &mut DataSource, valid: &DataSource) -> Result<()> {
        if train.num_batches() == 0 {
            return Err(Error::DataExhausted("training split".into()));
        }
        if valid.num_batches() == 0 {
            return Err(Error::DataExhausted("validation split".into()));
        }
        if self.num_nodes > 0 && train.num_nodes() != self.num_nodes {
            return Err(Error::Configuration(format!(
                "data provides {} nodes but num_nodes is {}",
                train.num_nodes(),
                self.num_nodes
            )));
        }
        log::info!("begin training");

        for epoch in 1..=self.epochs {
            let epoch_start = Instant::now();
            let mut train_losses = Vec::with_capacity(train.num_batches() as usize);
            train.shuffle();

            for (x, y) in train.iter_batches() {
                let x = x.to_device(self.device);
                let y = y.to_device(self.device);
                self.optim.zero_grad();
                let output = self.model.forward(&x);
                // Loss lives in original units on both sides.
                let loss = (self.criterion)(
                    &self.scaler.inverse_transform(&output),
                    &self.scaler.inverse_transform(&y),
                    self.null_val,
                );
                loss.backward();
                self.optim.step();
                train_losses.push(f64::try_from(&loss).unwrap_or(f64::NAN));
            }

            if self.lr_decay {
                self.optim.decay_lr();
            }

            let mut valid_losses = Vec::with_capacity(valid.num_batches() as usize);
            for (x, y) in valid.iter_batches() {
                let x = x.to_device(self.device);
                let y = y.to_device(self.device);
                let output = tch::no_grad(|| self.model.forward(&x));
                let score = self.evaluator.evaluate(
                    &self.scaler.inverse_transform(&output),
                    &self.scaler.inverse_transform(&y),
                );
                let batch_loss = score
                    .get(&self.val_metric)
                    .and_then(|by_horizon| by_horizon.get(&Horizon::All))
                    .copied()
                    .unwrap_or(f64::NAN);
                valid_losses.push(batch_loss);
            }

            let mean_train = mean(&train_losses);
            let mean_valid = mean(&valid_losses);
            self.progress.epoch(
                epoch,
                epoch_start.elapsed().as_secs_f64(),
                mean_train,
                mean_valid,
            );

            // A diverged training epoch must not enter model selection either.
            let selection_loss = if mean_train.is_finite() {
                mean_valid
            } else {
                f64::NAN
            };
            match self.tracker.observe(selection_loss)? {
                Verdict::Improved => self.best_state = Some(self.snapshot()),
                Verdict::Stalled => {}
                Verdict::EarlyStop => {
                    self.progress.early_stop(epoch);
                    break;
                }
            }
        }

        // Everything after training acts on the best snapshot, never the
        // final-epoch weights.
        if let Some(state) = &self.best_state {
            restore_state(&self.vs, state);
        }
        Ok(())
    }

    /// Score the active model on a held-out split, reporting every metric per
    /// horizon step and aggregated.
    pub fn evaluate(&mut self, test: &DataSource) -> Result<EvalReport> {
        if test.num_batches() == 0 {
            return Err(Error::DataExhausted("test split".into()));
        }
        log::info!("start evaluating");

        let mut outputs = Vec::new();
        let mut targets = Vec::new();
        for (x, y) in test.iter_batches() {
            let x = x.to_device(self.device);
            let y = y.to_device(self.device);
            let prediction = tch::no_grad(|| self.model.forward(&x));
            outputs.push(prediction);
            targets.push(y);
        }
        let predicted = Tensor::cat(&outputs, 0);
        let observed = Tensor::cat(&targets, 0);

        let seq_len = test.seq_len();
        if seq_len > predicted.size()[0] {
            return Err(Error::Configuration(format!(
                "source declares {} samples but only {} were collected",
                seq_len,
                predicted.size()[0]
            )));
        }
        // Cut final-batch padding off the concatenated tensors, not per
        // batch; batch boundaries need not align with the true length.
        let predicted = predicted.narrow(0, 0, seq_len);
        let observed = observed.narrow(0, 0, seq_len);

        let predicted = self.scaler.inverse_transform(&predicted);
        let observed = self.scaler.inverse_transform(&observed);

        let report = self.evaluator.evaluate(&predicted, &observed);
        for (metric, by_horizon) in &report {
            for (horizon, value) in by_horizon {
                self.progress
                    .metric(&metric.to_string(), &horizon.to_string(), *value);
            }
        }
        Ok(report)
    }

    /// Write the active model's parameter state (nothing else) to `path`,
    /// creating parent directories as needed.
    pub fn save_model(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut entries: Vec<(String, Tensor)> = self
            .vs
            .variables()
            .iter()
            .map(|(name, value)| (name.clone(), value.detach().to_device(Device::Cpu)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.push((
            CHECKPOINT_VERSION_KEY.to_string(),
            Tensor::from_slice(&[CHECKPOINT_VERSION]),
        ));
        Tensor::write_safetensors(&entries, path)?;
        log::info!("saved model parameters to {}", path.display());
        Ok(())
    }

    /// Load a previously saved parameter state into the live model. Fails
    /// closed on a missing/unknown version tag or any name/shape mismatch.
    pub fn load_model(&mut self, path: &Path) -> Result<()> {
        let entries = Tensor::read_safetensors(path)?;
        let mut saved: HashMap<String, Tensor> = entries.into_iter().collect();

        let version = saved.remove(CHECKPOINT_VERSION_KEY).ok_or_else(|| {
            Error::StructureMismatch(format!(
                "checkpoint {} carries no version tag",
                path.display()
            ))
        })?;
        let version = version.int64_value(&[0]);
        if version != CHECKPOINT_VERSION {
            return Err(Error::StructureMismatch(format!(
                "unsupported checkpoint version {version}, expected {CHECKPOINT_VERSION}"
            )));
        }

        let mut live = self.vs.variables();
        if saved.len() != live.len() {
            return Err(Error::StructureMismatch(format!(
                "checkpoint holds {} parameters, model expects {}",
                saved.len(),
                live.len()
            )));
        }
        for (name, value) in &live {
            let stored = saved.get(name).ok_or_else(|| {
                Error::StructureMismatch(format!("checkpoint is missing parameter '{name}'"))
            })?;
            if stored.size() != value.size() {
                return Err(Error::StructureMismatch(format!(
                    "parameter '{}' has shape {:?} in checkpoint but {:?} in the model",
                    name,
                    stored.size(),
                    value.size()
                )));
            }
        }
        tch::no_grad(|| {
            for (name, value) in live.iter_mut() {
                value.copy_(&saved[name.as_str()]);
            }
        });
        log::info!("loaded model parameters from {}", path.display());
        Ok(())
    }

    /// Inference with the active model on one input batch.
    pub fn predict(&self, input: &Tensor) -> Tensor {
        tch::no_grad(|| self.model.forward(&input.to_device(self.device)))
    }

    pub fn best_val(&self) -> f64 {
        self.tracker.best_val()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Deep copy of every parameter. Value semantics: later in-place updates
    /// to the live model cannot reach a snapshot.
    fn snapshot(&self) -> Vec<(String, Tensor)> {
        let mut state: Vec<(String, Tensor)> = self
            .vs
            .variables()
            .iter()
            .map(|(name, value)| (name.clone(), value.detach().copy()))
            .collect();
        state.sort_by(|a, b| a.0.cmp(&b.0));
        state
    }
}

fn restore_state(vs: &nn::VarStore, state: &[(String, Tensor)]) {
    let mut live = vs.variables();
    tch::no_grad(|| {
        for (name, value) in state {
            if let Some(var) = live.get_mut(name) {
                var.copy_(value);
            }
        }
    });
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        f64::NAN
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_val_is_monotonically_non_increasing() {
        let mut tracker = BestTracker::new(10, 5);
        let mut previous = tracker.best_val();
        for loss in [9.0, 7.0, 8.0, 5.0, 6.0, 5.5] {
            tracker.observe(loss).unwrap();
            assert!(tracker.best_val() <= previous);
            previous = tracker.best_val();
        }
        assert!((tracker.best_val() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn stops_exactly_at_one_plus_patience() {
        let patience = 3;
        let mut tracker = BestTracker::new(patience, 5);
        assert_eq!(tracker.observe(1.0).unwrap(), Verdict::Improved);
        assert_eq!(tracker.observe(1.0).unwrap(), Verdict::Stalled);
        assert_eq!(tracker.observe(1.0).unwrap(), Verdict::Stalled);
        assert_eq!(tracker.observe(1.0).unwrap(), Verdict::EarlyStop);
    }

    #[test]
    fn never_stops_while_strictly_improving() {
        let mut tracker = BestTracker::new(1, 5);
        for epoch in 0..100 {
            let loss = 100.0 - epoch as f64;
            assert_eq!(tracker.observe(loss).unwrap(), Verdict::Improved);
        }
    }

    #[test]
    fn patience_one_scenario_stops_after_second_epoch() {
        // losses [5.0, 5.0, 4.0] with patience 1: the third epoch never runs
        let mut tracker = BestTracker::new(1, 5);
        assert_eq!(tracker.observe(5.0).unwrap(), Verdict::Improved);
        assert_eq!(tracker.observe(5.0).unwrap(), Verdict::EarlyStop);
        assert!((tracker.best_val() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn wait_resets_on_improvement() {
        let mut tracker = BestTracker::new(2, 5);
        assert_eq!(tracker.observe(5.0).unwrap(), Verdict::Improved);
        assert_eq!(tracker.observe(6.0).unwrap(), Verdict::Stalled);
        assert_eq!(tracker.observe(3.0).unwrap(), Verdict::Improved);
        assert_eq!(tracker.observe(4.0).unwrap(), Verdict::Stalled);
        assert_eq!(tracker.observe(4.0).unwrap(), Verdict::EarlyStop);
    }

    #[test]
    fn non_finite_loss_never_corrupts_best_val() {
        let mut tracker = BestTracker::new(10, 5);
        tracker.observe(5.0).unwrap();
        assert_eq!(tracker.observe(f64::NAN).unwrap(), Verdict::Stalled);
        assert!((tracker.best_val() - 5.0).abs() < 1e-12);
        assert_eq!(tracker.observe(4.0).unwrap(), Verdict::Improved);
        assert!((tracker.best_val() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn consecutive_non_finite_epochs_abort() {
        let mut tracker = BestTracker::new(10, 2);
        tracker.observe(5.0).unwrap();
        assert_eq!(tracker.observe(f64::NAN).unwrap(), Verdict::Stalled);
        assert!(matches!(
            tracker.observe(f64::INFINITY),
            Err(Error::Divergence(_))
        ));
    }

    #[test]
    fn finite_epoch_resets_divergence_run() {
        let mut tracker = BestTracker::new(10, 2);
        tracker.observe(f64::NAN).unwrap();
        tracker.observe(5.0).unwrap();
        // the run restarts, so a single further NaN is tolerated
        assert_eq!(tracker.observe(f64::NAN).unwrap(), Verdict::Stalled);
    }

    #[test]
    fn mean_of_empty_slice_is_nan() {
        assert!(mean(&[]).is_nan());
        assert!((mean(&[1.0, 2.0, 3.0]) - 2.0).abs() < 1e-12);
    }
}
