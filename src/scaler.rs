use tch::Tensor;

/// Reversible z-score transform fitted once on the training split.
///
/// `transform` and `inverse_transform` are a left-inverse pair; the executor
/// relies on that to compute every loss and metric in original units.
#[derive(Debug, Clone, Copy)]
pub struct StandardScaler {
    mean: f64,
    std: f64,
}

impl StandardScaler {
    pub fn new(mean: f64, std: f64) -> Self {
        let std = if std.is_finite() && std > 0.0 { std } else { 1.0 };
        Self { mean, std }
    }

    /// Fit mean and standard deviation on the training signal.
    pub fn fit(data: &Tensor) -> Self {
        let mean = f64::try_from(&data.mean(tch::Kind::Float)).unwrap_or(0.0);
        let std = f64::try_from(&data.std(true)).unwrap_or(1.0);
        Self::new(mean, std)
    }

    pub fn transform(&self, x: &Tensor) -> Tensor {
        (x - self.mean) / self.std
    }

    pub fn inverse_transform(&self, x: &Tensor) -> Tensor {
        x * self.std + self.mean
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std(&self) -> f64 {
        self.std
    }
}
