use serde::Deserialize;
use tch::Tensor;

use crate::metrics;

/// Training criterion signature: `(prediction, target, null_val)` in
/// original units, returning a differentiable scalar tensor.
pub type Criterion = fn(&Tensor, &Tensor, f64) -> Tensor;

/// Closed set of supported training losses. Selection happens once when the
/// executor is built; an unsupported name already fails at config parse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainLoss {
    MaskedMae,
    MaskedMse,
    MaskedRmse,
    Mae,
    Mse,
    Rmse,
}

impl TrainLoss {
    pub fn criterion(self) -> Criterion {
        match self {
            TrainLoss::MaskedMae => metrics::masked_mae,
            TrainLoss::MaskedMse => metrics::masked_mse,
            TrainLoss::MaskedRmse => metrics::masked_rmse,
            TrainLoss::Mae => plain_mae,
            TrainLoss::Mse => plain_mse,
            TrainLoss::Rmse => plain_rmse,
        }
    }
}

fn plain_mae(prediction: &Tensor, target: &Tensor, _null_val: f64) -> Tensor {
    metrics::mae(prediction, target)
}

fn plain_mse(prediction: &Tensor, target: &Tensor, _null_val: f64) -> Tensor {
    metrics::mse(prediction, target)
}

fn plain_rmse(prediction: &Tensor, target: &Tensor, _null_val: f64) -> Tensor {
    metrics::mse(prediction, target).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_deserialize_to_variants() {
        let loss: TrainLoss = serde_json::from_str("\"masked_mae\"").unwrap();
        assert_eq!(loss, TrainLoss::MaskedMae);
        let loss: TrainLoss = serde_json::from_str("\"rmse\"").unwrap();
        assert_eq!(loss, TrainLoss::Rmse);
    }

    #[test]
    fn unsupported_name_fails_to_parse() {
        assert!(serde_json::from_str::<TrainLoss>("\"huber\"").is_err());
    }

    #[test]
    fn criterion_table_matches_metric_functions() {
        let prediction = Tensor::from_slice(&[1.0f32, 2.0]);
        let target = Tensor::from_slice(&[0.0f32, 4.0]);

        let masked = TrainLoss::MaskedMae.criterion()(&prediction, &target, 0.0);
        assert!((f64::try_from(&masked).unwrap() - 2.0).abs() < 1e-6);

        let plain = TrainLoss::Mae.criterion()(&prediction, &target, 0.0);
        assert!((f64::try_from(&plain).unwrap() - 1.5).abs() < 1e-6);
    }
}
