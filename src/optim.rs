use serde::Deserialize;
use tch::nn::{self, OptimizerConfig, VarStore};
use tch::Tensor;

use crate::config::Config;
use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    AdamW,
    Sgd,
    Rmsprop,
}

/// Wraps the gradient update rule plus the optional once-per-epoch learning
/// rate decay. The executor calls `decay_lr` at most once per epoch.
pub struct Optim {
    inner: nn::Optimizer,
    learning_rate: f64,
    decay_rate: f64,
    max_grad_norm: Option<f64>,
}

impl Optim {
    pub fn new(vs: &VarStore, config: &Config) -> Result<Self> {
        let lr = config.learning_rate;
        let wd = config.weight_decay;
        let inner = match config.optimizer {
            OptimizerKind::Adam => nn::Adam {
                wd,
                ..Default::default()
            }
            .build(vs, lr)?,
            OptimizerKind::AdamW => nn::AdamW {
                wd,
                ..Default::default()
            }
            .build(vs, lr)?,
            OptimizerKind::Sgd => nn::Sgd {
                wd,
                ..Default::default()
            }
            .build(vs, lr)?,
            OptimizerKind::Rmsprop => nn::RmsProp {
                wd,
                ..Default::default()
            }
            .build(vs, lr)?,
        };
        Ok(Self {
            inner,
            learning_rate: lr,
            decay_rate: config.lr_decay_rate,
            max_grad_norm: config.max_grad_norm,
        })
    }

    pub fn zero_grad(&mut self) {
        self.inner.zero_grad();
    }

    pub fn backward_step(&mut self, loss: &Tensor) {
        loss.backward();
        self.step();
    }

    pub fn step(&mut self) {
        if let Some(max_norm) = self.max_grad_norm {
            self.inner.clip_grad_norm(max_norm);
        }
        self.inner.step();
    }

    /// Advance the learning-rate schedule by one epoch.
    pub fn decay_lr(&mut self) {
        self.learning_rate *= self.decay_rate;
        self.inner.set_lr(self.learning_rate);
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn decay_multiplies_learning_rate() {
        let vs = VarStore::new(Device::Cpu);
        let _w = vs.root().var("w", &[2], nn::Init::Const(1.0));
        let config = Config {
            learning_rate: 0.1,
            lr_decay_rate: 0.5,
            ..Config::default()
        };
        let mut optim = Optim::new(&vs, &config).unwrap();
        assert!((optim.learning_rate() - 0.1).abs() < 1e-12);
        optim.decay_lr();
        assert!((optim.learning_rate() - 0.05).abs() < 1e-12);
        optim.decay_lr();
        assert!((optim.learning_rate() - 0.025).abs() < 1e-12);
    }

    #[test]
    fn optimizer_kind_names_deserialize() {
        let kind: OptimizerKind = serde_json::from_str("\"adamw\"").unwrap();
        assert_eq!(kind, OptimizerKind::AdamW);
        assert!(serde_json::from_str::<OptimizerKind>("\"lbfgs\"").is_err());
    }
}
