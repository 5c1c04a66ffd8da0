use std::collections::BTreeMap;
use std::fmt;

use tch::{Kind, Tensor};

/// Accuracy measures reported by the evaluator, in report order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MetricKind {
    MaskedMae,
    MaskedRmse,
    MaskedMape,
    Mae,
    Rmse,
    Mape,
}

impl MetricKind {
    pub const ALL: [MetricKind; 6] = [
        MetricKind::MaskedMae,
        MetricKind::MaskedRmse,
        MetricKind::MaskedMape,
        MetricKind::Mae,
        MetricKind::Rmse,
        MetricKind::Mape,
    ];
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::MaskedMae => "masked_MAE",
            MetricKind::MaskedRmse => "masked_RMSE",
            MetricKind::MaskedMape => "masked_MAPE",
            MetricKind::Mae => "MAE",
            MetricKind::Rmse => "RMSE",
            MetricKind::Mape => "MAPE",
        };
        f.write_str(name)
    }
}

/// Forecast-horizon label: an individual 1-indexed step, or the aggregate
/// over every step. Steps order before `All`, so report iteration prints
/// step scalars first and the aggregate last.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Horizon {
    Step(i64),
    All,
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Horizon::Step(step) => write!(f, "{step}"),
            Horizon::All => f.write_str("all"),
        }
    }
}

/// Metric name -> horizon label -> scalar, with stable iteration order.
pub type EvalReport = BTreeMap<MetricKind, BTreeMap<Horizon, f64>>;

/// Computes the full metric suite over multi-horizon predictions.
///
/// Masked variants skip entries whose target equals `null_val` (NaN-aware),
/// the convention for sensors that report missing readings as a sentinel.
#[derive(Debug, Clone, Copy)]
pub struct Evaluator {
    null_val: f64,
}

impl Evaluator {
    pub fn new(null_val: f64) -> Self {
        Self { null_val }
    }

    /// Score predictions against targets, both shaped
    /// `[samples, horizon, nodes, dim]`, per horizon step and aggregated.
    pub fn evaluate(&self, prediction: &Tensor, target: &Tensor) -> EvalReport {
        let horizon = prediction.size()[1];
        let mut report = EvalReport::new();
        for kind in MetricKind::ALL {
            let mut by_horizon = BTreeMap::new();
            for step in 0..horizon {
                let pred_step = prediction.select(1, step);
                let target_step = target.select(1, step);
                by_horizon.insert(
                    Horizon::Step(step + 1),
                    self.scalar(kind, &pred_step, &target_step),
                );
            }
            by_horizon.insert(Horizon::All, self.scalar(kind, prediction, target));
            report.insert(kind, by_horizon);
        }
        report
    }

    fn scalar(&self, kind: MetricKind, prediction: &Tensor, target: &Tensor) -> f64 {
        let value = match kind {
            MetricKind::MaskedMae => masked_mae(prediction, target, self.null_val),
            MetricKind::MaskedRmse => masked_rmse(prediction, target, self.null_val),
            MetricKind::MaskedMape => masked_mape(prediction, target, self.null_val),
            MetricKind::Mae => mae(prediction, target),
            MetricKind::Rmse => mse(prediction, target).sqrt(),
            MetricKind::Mape => mape(prediction, target),
        };
        f64::try_from(&value).unwrap_or(f64::NAN)
    }
}

fn null_mask(target: &Tensor, null_val: f64) -> Tensor {
    let mask = if null_val.is_nan() {
        target.isnan().logical_not()
    } else {
        target.ne(null_val)
    };
    let mask = mask.to_kind(Kind::Float);
    // Rescale so the masked mean stays an unbiased mean over valid entries.
    let mask = &mask / mask.mean(Kind::Float);
    mask.nan_to_num(0.0, 0.0, 0.0)
}

fn masked_average(elementwise: Tensor, target: &Tensor, null_val: f64) -> Tensor {
    let loss = elementwise * null_mask(target, null_val);
    loss.nan_to_num(0.0, 0.0, 0.0).mean(Kind::Float)
}

pub fn masked_mae(prediction: &Tensor, target: &Tensor, null_val: f64) -> Tensor {
    masked_average((prediction - target).abs(), target, null_val)
}

pub fn masked_mse(prediction: &Tensor, target: &Tensor, null_val: f64) -> Tensor {
    masked_average((prediction - target).pow_tensor_scalar(2), target, null_val)
}

pub fn masked_rmse(prediction: &Tensor, target: &Tensor, null_val: f64) -> Tensor {
    masked_mse(prediction, target, null_val).sqrt()
}

pub fn masked_mape(prediction: &Tensor, target: &Tensor, null_val: f64) -> Tensor {
    let ratio = ((prediction - target) / target).abs();
    masked_average(ratio, target, null_val)
}

pub fn mae(prediction: &Tensor, target: &Tensor) -> Tensor {
    (prediction - target).abs().mean(Kind::Float)
}

pub fn mse(prediction: &Tensor, target: &Tensor) -> Tensor {
    (prediction - target)
        .pow_tensor_scalar(2)
        .mean(Kind::Float)
}

pub fn mape(prediction: &Tensor, target: &Tensor) -> Tensor {
    ((prediction - target) / target)
        .abs()
        .nan_to_num(0.0, 0.0, 0.0)
        .mean(Kind::Float)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind, Tensor};

    fn t(values: &[f32]) -> Tensor {
        Tensor::from_slice(values)
    }

    #[test]
    fn masked_mae_skips_null_entries() {
        let prediction = t(&[1.0, 2.0]);
        let target = t(&[0.0, 4.0]);
        // target[0] is the null sentinel, so only |2 - 4| counts
        let masked = f64::try_from(&masked_mae(&prediction, &target, 0.0)).unwrap();
        assert!((masked - 2.0).abs() < 1e-6, "masked {masked}");

        let plain = f64::try_from(&mae(&prediction, &target)).unwrap();
        assert!((plain - 1.5).abs() < 1e-6, "plain {plain}");
    }

    #[test]
    fn nan_null_sentinel_masks_nan_targets() {
        let prediction = t(&[1.0, 2.0]);
        let target = t(&[f32::NAN, 5.0]);
        let masked = f64::try_from(&masked_mae(&prediction, &target, f64::NAN)).unwrap();
        assert!((masked - 3.0).abs() < 1e-6, "masked {masked}");
    }

    #[test]
    fn perfect_prediction_scores_zero() {
        let target = Tensor::rand(&[2, 3, 4, 1], (Kind::Float, Device::Cpu)) + 1.0;
        let prediction = target.copy();
        let evaluator = Evaluator::new(0.0);
        let report = evaluator.evaluate(&prediction, &target);
        for (_, by_horizon) in &report {
            for (_, value) in by_horizon {
                assert!(value.abs() < 1e-6);
            }
        }
    }

    #[test]
    fn masked_rmse_is_root_of_masked_mse() {
        let prediction = t(&[1.0, 5.0]);
        let target = t(&[4.0, 1.0]);
        let rmse = f64::try_from(&masked_rmse(&prediction, &target, 0.0)).unwrap();
        let mse = f64::try_from(&masked_mse(&prediction, &target, 0.0)).unwrap();
        assert!((rmse - mse.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn report_has_stable_step_then_all_order() {
        let target = Tensor::rand(&[2, 12, 3, 1], (Kind::Float, Device::Cpu)) + 1.0;
        let prediction = Tensor::rand(&[2, 12, 3, 1], (Kind::Float, Device::Cpu)) + 1.0;
        let report = Evaluator::new(0.0).evaluate(&prediction, &target);

        let metrics: Vec<MetricKind> = report.keys().copied().collect();
        assert_eq!(metrics[0], MetricKind::MaskedMae);
        assert_eq!(metrics[5], MetricKind::Mape);

        let horizons: Vec<Horizon> = report[&MetricKind::MaskedMae].keys().copied().collect();
        assert_eq!(horizons.len(), 13);
        assert_eq!(horizons[0], Horizon::Step(1));
        assert_eq!(horizons[11], Horizon::Step(12));
        assert_eq!(horizons[12], Horizon::All);
    }
}
