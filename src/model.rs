use tch::nn::Module;
use tch::{nn, Kind, Tensor};

/// The executor's view of a forecasting model: a windowed multivariate graph
/// signal `[batch, window, nodes, dim]` in, a multi-horizon prediction
/// `[batch, horizon, nodes, dim]` out.
pub trait Forecaster {
    fn forward(&self, input: &Tensor) -> Tensor;
}

#[derive(Debug, Clone)]
pub struct ForecasterConfig {
    pub window: i64,
    pub horizon: i64,
    pub input_dim: i64,
    pub hidden_dim: i64,
}

impl Default for ForecasterConfig {
    fn default() -> Self {
        Self {
            window: 12,
            horizon: 12,
            input_dim: 1,
            hidden_dim: 256,
        }
    }
}

/// Baseline forecaster: a per-node MLP over the flattened input window, with
/// optional one-hop neighbor mixing when an adjacency matrix is supplied.
/// Weights are shared across nodes.
pub struct MlpForecaster {
    fc1: nn::Linear,
    fc2: nn::Linear,
    adjacency: Option<Tensor>,
    horizon: i64,
    input_dim: i64,
}

impl MlpForecaster {
    pub fn new(vs: &nn::Path, config: &ForecasterConfig, adjacency: Option<Tensor>) -> Self {
        let in_features = config.window * config.input_dim;
        let out_features = config.horizon * config.input_dim;
        let fc1 = nn::linear(vs / "fc1", in_features, config.hidden_dim, Default::default());
        let fc2 = nn::linear(vs / "fc2", config.hidden_dim, out_features, Default::default());
        let adjacency = adjacency.map(|adj| row_normalize(&adj));
        Self {
            fc1,
            fc2,
            adjacency,
            horizon: config.horizon,
            input_dim: config.input_dim,
        }
    }
}

impl Forecaster for MlpForecaster {
    fn forward(&self, input: &Tensor) -> Tensor {
        let size = input.size();
        let (batch, nodes) = (size[0], size[2]);

        // Average each node's signal with its neighbors before the MLP.
        let x = match &self.adjacency {
            Some(adjacency) => {
                let adjacency = adjacency.to_device(input.device());
                // [B, W, N, D] -> [B, W, D, N] so the node axis is last
                let per_node = input.permute(&[0, 1, 3, 2]);
                let mixed = per_node.matmul(&adjacency.transpose(0, 1));
                let mixed = mixed.permute(&[0, 1, 3, 2]);
                (input + mixed) * 0.5
            }
            None => input.shallow_clone(),
        };

        // [B, W, N, D] -> [B, N, W*D]
        let x = x.permute(&[0, 2, 1, 3]).reshape(&[batch, nodes, -1]);
        let hidden = self.fc1.forward(&x).relu();
        let out = self.fc2.forward(&hidden);
        // [B, N, H*D] -> [B, H, N, D]
        out.reshape(&[batch, nodes, self.horizon, self.input_dim])
            .permute(&[0, 2, 1, 3])
    }
}

fn row_normalize(adjacency: &Tensor) -> Tensor {
    let nodes = adjacency.size()[0];
    let ones = Tensor::ones(&[nodes, 1], (Kind::Float, adjacency.device()));
    let row_sums = adjacency.matmul(&ones).clamp_min(1e-12);
    adjacency / row_sums
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn::VarStore, Device};

    fn config() -> ForecasterConfig {
        ForecasterConfig {
            window: 4,
            horizon: 3,
            input_dim: 1,
            hidden_dim: 8,
        }
    }

    #[test]
    fn output_shape_matches_horizon() {
        let vs = VarStore::new(Device::Cpu);
        let model = MlpForecaster::new(&vs.root(), &config(), None);
        let input = Tensor::rand(&[5, 4, 6, 1], (Kind::Float, Device::Cpu));
        let output = model.forward(&input);
        assert_eq!(output.size(), vec![5, 3, 6, 1]);
    }

    #[test]
    fn adjacency_mixing_keeps_shape() {
        let vs = VarStore::new(Device::Cpu);
        let adjacency = Tensor::ones(&[6, 6], (Kind::Float, Device::Cpu));
        let model = MlpForecaster::new(&vs.root(), &config(), Some(adjacency));
        let input = Tensor::rand(&[2, 4, 6, 1], (Kind::Float, Device::Cpu));
        assert_eq!(model.forward(&input).size(), vec![2, 3, 6, 1]);
    }

    #[test]
    fn row_normalize_produces_unit_rows() {
        let adjacency = Tensor::from_slice(&[1.0f32, 3.0, 2.0, 2.0]).reshape(&[2, 2]);
        let normalized = row_normalize(&adjacency);
        let ones = Tensor::ones(&[2, 1], (Kind::Float, Device::Cpu));
        let row_sums = normalized.matmul(&ones);
        assert!(row_sums.allclose(&ones, 1e-6, 1e-6, false));
    }
}
