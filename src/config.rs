use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tch::Device;

use crate::error::{Error, Result};
use crate::loss::TrainLoss;
use crate::optim::OptimizerKind;

/// Run configuration, deserialized from one or more JSON files.
///
/// Every field has a default, so config files only need to name the options
/// they change. The executor treats the config as read-only.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Explicit device spec (`cpu`, `cuda`, `cuda:<index>`). When absent the
    /// `cuda` flag decides.
    pub device: Option<String>,
    pub cuda: bool,
    pub train_loss: TrainLoss,
    pub epochs: usize,
    pub num_nodes: i64,
    pub batch_size: i64,
    pub patience: usize,
    pub lr_decay: bool,
    pub lr_decay_rate: f64,
    pub mask: bool,
    pub learning_rate: f64,
    pub optimizer: OptimizerKind,
    pub weight_decay: f64,
    pub max_grad_norm: Option<f64>,
    /// Sentinel marking missing readings; masked metrics skip these entries.
    pub null_val: f64,
    /// Consecutive non-finite epochs tolerated before aborting.
    pub divergence_patience: usize,
    pub window: i64,
    pub horizon: i64,
    pub hidden_dim: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: None,
            cuda: true,
            train_loss: TrainLoss::MaskedMae,
            epochs: 100,
            num_nodes: 0,
            batch_size: 64,
            patience: 20,
            lr_decay: false,
            lr_decay_rate: 0.97,
            mask: true,
            learning_rate: 1e-3,
            optimizer: OptimizerKind::Adam,
            weight_decay: 0.0,
            max_grad_norm: None,
            null_val: 0.0,
            divergence_patience: 5,
            window: 12,
            horizon: 12,
            hidden_dim: 256,
        }
    }
}

impl Config {
    /// Merge several JSON config files into one `Config`. Keys already set by
    /// an earlier file are not overwritten by later ones.
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut merged = serde_json::Map::new();
        for path in paths {
            let path = path.as_ref();
            let text = fs::read_to_string(path).map_err(|source| Error::FileRead {
                path: path.to_path_buf(),
                source,
            })?;
            let value: Value = serde_json::from_str(&text)?;
            let object = value.as_object().ok_or_else(|| {
                Error::Configuration(format!("{} is not a JSON object", path.display()))
            })?;
            for (key, val) in object {
                merged.entry(key.clone()).or_insert_with(|| val.clone());
            }
        }
        Self::from_value(Value::Object(merged))
    }

    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|err| Error::Configuration(format!("invalid option value: {err}")))
    }

    /// Resolve the compute device. An explicit `device` spec takes priority;
    /// otherwise the `cuda` flag selects GPU 0 when one is present.
    pub fn resolve_device(&self) -> Result<Device> {
        match &self.device {
            Some(spec) => parse_device(spec),
            None => Ok(if self.cuda {
                Device::cuda_if_available()
            } else {
                Device::Cpu
            }),
        }
    }
}

fn parse_device(spec: &str) -> Result<Device> {
    match spec {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::Cuda(0)),
        other => {
            if let Some(index) = other.strip_prefix("cuda:") {
                let index = index.parse::<usize>().map_err(|_| {
                    Error::Configuration(format!("malformed device spec '{other}'"))
                })?;
                Ok(Device::Cuda(index))
            } else {
                Err(Error::Configuration(format!(
                    "malformed device spec '{other}'"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_apply_when_keys_absent() {
        let config = Config::from_value(json!({ "epochs": 7 })).unwrap();
        assert_eq!(config.epochs, 7);
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.patience, 20);
        assert!(config.mask);
        assert!(!config.lr_decay);
        assert_eq!(config.train_loss, TrainLoss::MaskedMae);
    }

    #[test]
    fn unknown_loss_name_is_rejected() {
        let result = Config::from_value(json!({ "train_loss": "huber" }));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn first_file_wins_on_merge() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        std::fs::write(&a, r#"{"epochs": 5, "patience": 3}"#).unwrap();
        std::fs::write(&b, r#"{"epochs": 50, "batch_size": 8}"#).unwrap();

        let config = Config::from_files(&[a, b]).unwrap();
        assert_eq!(config.epochs, 5);
        assert_eq!(config.patience, 3);
        assert_eq!(config.batch_size, 8);
    }

    #[test]
    fn device_spec_parsing() {
        assert_eq!(parse_device("cpu").unwrap(), Device::Cpu);
        assert_eq!(parse_device("cuda").unwrap(), Device::Cuda(0));
        assert_eq!(parse_device("cuda:1").unwrap(), Device::Cuda(1));
        assert!(matches!(
            parse_device("tpu"),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            parse_device("cuda:abc"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn explicit_device_overrides_cuda_flag() {
        let config = Config::from_value(json!({ "device": "cpu", "cuda": true })).unwrap();
        assert_eq!(config.resolve_device().unwrap(), Device::Cpu);
    }
}
