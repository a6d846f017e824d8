use super::sgd::{check_learning_rate, check_unit_interval};
use crate::error::{EmbeddingError, Result};
use serde::{Deserialize, Serialize};

/// Adam for embedding rows, with an externally supplied step size.
///
/// # Formula
///
/// $$
/// \begin{aligned}
/// & m_t = \beta_1 m_{t-1} + (1 - \beta_1) g_t \\
/// & v_t = \beta_2 v_{t-1} + (1 - \beta_2) g_t^2 \\
/// & \theta_t = \theta_{t-1} - \alpha_t \, m_t / (\sqrt{v_t} + \epsilon)
/// \end{aligned}
/// $$
///
/// Bias correction is folded into `alpha_t` by the caller, see
/// [`adam_alpha_t`](super::scheduler::adam_alpha_t). `learning_rate` holds the
/// current `alpha_t`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    pub learning_rate: f32,
    #[serde(default = "default_beta1")]
    pub beta1: f32,
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
}

impl Adam {
    /// Creates Adam with `beta1 = 0.9`, `beta2 = 0.999`, `epsilon = 1e-7`.
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_epsilon(),
        }
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_learning_rate(self.learning_rate)?;
        check_unit_interval("beta1", self.beta1)?;
        check_unit_interval("beta2", self.beta2)?;
        if self.epsilon.is_nan() || self.epsilon <= 0.0 {
            return Err(EmbeddingError::config(format!(
                "epsilon must be positive, got {}",
                self.epsilon
            )));
        }
        Ok(())
    }

    pub fn update_row(&self, row: &mut [f32], m: &mut [f32], v: &mut [f32], grad: &[f32]) {
        let alpha_t = self.learning_rate;
        let (b1, b2, eps) = (self.beta1, self.beta2, self.epsilon);
        for (((p, m), v), &g) in row.iter_mut().zip(m.iter_mut()).zip(v.iter_mut()).zip(grad) {
            *m = b1 * *m + (1.0 - b1) * g;
            *v = b2 * *v + (1.0 - b2) * g * g;
            *p -= alpha_t * *m / (v.sqrt() + eps);
        }
    }
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_epsilon() -> f32 {
    1e-7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adam_new() {
        let adam = Adam::new(0.001);
        assert_eq!(adam.learning_rate, 0.001);
        assert_eq!(adam.beta1, 0.9);
        assert_eq!(adam.beta2, 0.999);
    }

    #[test]
    fn test_adam_update_row() {
        let adam = Adam::new(0.1).with_epsilon(1e-8);
        let mut row = vec![1.0];
        let mut m = vec![0.0];
        let mut v = vec![0.0];

        adam.update_row(&mut row, &mut m, &mut v, &[0.1]);

        // m = 0.1 * 0.1 = 0.01
        // v = 0.001 * 0.01 = 0.00001
        // row = 1.0 - 0.1 * 0.01 / sqrt(0.00001)
        assert!((m[0] - 0.01).abs() < 1e-7);
        assert!((v[0] - 1e-5).abs() < 1e-9);
        let expected = 1.0 - 0.1 * 0.01 / (1e-5f32.sqrt() + 1e-8);
        assert!((row[0] - expected).abs() < 1e-5, "row={}", row[0]);
    }

    #[test]
    fn test_adam_rejects_bad_epsilon() {
        assert!(Adam::new(0.1).with_epsilon(0.0).validate().is_err());
        assert!(Adam::new(0.1).with_betas(0.9, 1.5).validate().is_err());
    }
}
