use crate::error::{EmbeddingError, Result};
use serde::{Deserialize, Serialize};

/// Stochastic Gradient Descent (SGD) for embedding rows.
///
/// Updates one row using the rule:
/// `row = row - learning_rate * grad`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sgd {
    pub learning_rate: f32,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }

    pub fn validate(&self) -> Result<()> {
        check_learning_rate(self.learning_rate)
    }

    pub fn update_row(&self, row: &mut [f32], grad: &[f32]) {
        let lr = self.learning_rate;
        for (p, &g) in row.iter_mut().zip(grad) {
            *p -= lr * g;
        }
    }
}

/// SGD with a momentum buffer.
///
/// `v = momentum_factor * v + grad; row = row - learning_rate * v`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MomentumSgd {
    pub learning_rate: f32,
    #[serde(default = "default_momentum")]
    pub momentum_factor: f32,
}

impl MomentumSgd {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            momentum_factor: default_momentum(),
        }
    }

    pub fn with_momentum_factor(mut self, momentum_factor: f32) -> Self {
        self.momentum_factor = momentum_factor;
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_learning_rate(self.learning_rate)?;
        check_unit_interval("momentum_factor", self.momentum_factor)
    }

    pub fn update_row(&self, row: &mut [f32], momentum: &mut [f32], grad: &[f32]) {
        let lr = self.learning_rate;
        let f = self.momentum_factor;
        for ((p, v), &g) in row.iter_mut().zip(momentum.iter_mut()).zip(grad) {
            *v = f * *v + g;
            *p -= lr * *v;
        }
    }
}

/// Nesterov accelerated gradient, lookahead form.
///
/// `v = momentum * v + grad; row = row - learning_rate * (momentum * v + grad)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Nesterov {
    pub learning_rate: f32,
    #[serde(default = "default_momentum")]
    pub momentum: f32,
}

impl Nesterov {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            momentum: default_momentum(),
        }
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_learning_rate(self.learning_rate)?;
        check_unit_interval("momentum", self.momentum)
    }

    pub fn update_row(&self, row: &mut [f32], accm: &mut [f32], grad: &[f32]) {
        let lr = self.learning_rate;
        let mu = self.momentum;
        for ((p, v), &g) in row.iter_mut().zip(accm.iter_mut()).zip(grad) {
            *v = mu * *v + g;
            *p -= lr * (mu * *v + g);
        }
    }
}

fn default_momentum() -> f32 {
    0.9
}

pub(crate) fn check_learning_rate(learning_rate: f32) -> Result<()> {
    if !learning_rate.is_finite() || learning_rate < 0.0 {
        return Err(EmbeddingError::config(format!(
            "learning rate must be finite and non-negative, got {learning_rate}"
        )));
    }
    Ok(())
}

pub(crate) fn check_unit_interval(name: &str, value: f32) -> Result<()> {
    if !(0.0..1.0).contains(&value) {
        return Err(EmbeddingError::config(format!(
            "{name} must lie in [0, 1), got {value}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sgd_update_row() {
        let sgd = Sgd::new(0.1);
        let mut row = vec![1.0, 2.0];

        sgd.update_row(&mut row, &[0.5, -0.5]);

        // [1.0 - 0.05, 2.0 + 0.05]
        assert!((row[0] - 0.95).abs() < 1e-6);
        assert!((row[1] - 2.05).abs() < 1e-6);
    }

    #[test]
    fn test_momentum_accumulates() {
        let opt = MomentumSgd::new(1.0).with_momentum_factor(0.5);
        let mut row = vec![0.0];
        let mut v = vec![0.0];

        opt.update_row(&mut row, &mut v, &[1.0]);
        assert_eq!(v[0], 1.0);
        assert_eq!(row[0], -1.0);

        opt.update_row(&mut row, &mut v, &[1.0]);
        // v = 0.5 * 1 + 1
        assert_eq!(v[0], 1.5);
        assert_eq!(row[0], -2.5);
    }

    #[test]
    fn test_nesterov_lookahead() {
        let opt = Nesterov::new(0.1).with_momentum(0.5);
        let mut row = vec![1.0];
        let mut accm = vec![2.0];

        opt.update_row(&mut row, &mut accm, &[1.0]);

        // v = 0.5 * 2 + 1 = 2; step = 0.1 * (0.5 * 2 + 1) = 0.2
        assert_eq!(accm[0], 2.0);
        assert!((row[0] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_hyper_parameters() {
        assert!(Sgd::new(-1.0).validate().is_err());
        assert!(Sgd::new(f32::NAN).validate().is_err());
        assert!(MomentumSgd::new(0.1)
            .with_momentum_factor(1.0)
            .validate()
            .is_err());
        assert!(Nesterov::new(0.1).validate().is_ok());
    }
}
