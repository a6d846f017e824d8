//! Learning-rate schedules.
//!
//! The optimizer engines never compute their own step size. The training loop
//! evaluates a schedule, optionally folds in Adam's bias correction with
//! [`adam_alpha_t`], and pushes the result through
//! [`EmbeddingCollection::set_learning_rate`](crate::embedding::EmbeddingCollection::set_learning_rate).

use std::f32::consts::PI;

/// A learning rate as a function of the global step.
pub trait LearningRateSchedule {
    fn learning_rate(&self, step: usize) -> f32;
}

/// Linear ramp from 0 to `max_lr` over `warmup_steps`, then a linear decay to
/// `min_lr` at `total_steps`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearWarmup {
    pub max_lr: f32,
    pub min_lr: f32,
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl LinearWarmup {
    pub fn new(max_lr: f32, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            max_lr,
            min_lr: 0.0,
            warmup_steps,
            total_steps,
        }
    }

    pub fn with_min_lr(mut self, min_lr: f32) -> Self {
        self.min_lr = min_lr;
        self
    }
}

impl LearningRateSchedule for LinearWarmup {
    fn learning_rate(&self, step: usize) -> f32 {
        match phase(step, self.warmup_steps, self.total_steps) {
            Phase::Warmup(frac) => self.max_lr * frac,
            Phase::Decay(progress) => self.max_lr + (self.min_lr - self.max_lr) * progress,
            Phase::Done => self.min_lr,
        }
    }
}

/// Linear warmup followed by a half-cosine down to `min_lr`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosineDecay {
    pub max_lr: f32,
    pub min_lr: f32,
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl CosineDecay {
    pub fn new(max_lr: f32, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            max_lr,
            min_lr: 0.0,
            warmup_steps,
            total_steps,
        }
    }

    pub fn with_min_lr(mut self, min_lr: f32) -> Self {
        self.min_lr = min_lr;
        self
    }
}

impl LearningRateSchedule for CosineDecay {
    fn learning_rate(&self, step: usize) -> f32 {
        match phase(step, self.warmup_steps, self.total_steps) {
            Phase::Warmup(frac) => self.max_lr * frac,
            Phase::Decay(progress) => {
                let weight = 0.5 * (1.0 + (progress * PI).cos());
                self.min_lr + (self.max_lr - self.min_lr) * weight
            }
            Phase::Done => self.min_lr,
        }
    }
}

enum Phase {
    Warmup(f32),
    Decay(f32),
    Done,
}

fn phase(step: usize, warmup_steps: usize, total_steps: usize) -> Phase {
    if step < warmup_steps {
        Phase::Warmup(step as f32 / warmup_steps as f32)
    } else if step < total_steps {
        let decayed = step - warmup_steps;
        Phase::Decay(decayed as f32 / (total_steps - warmup_steps) as f32)
    } else {
        Phase::Done
    }
}

/// Bias-corrected Adam step size for update number `step` (1-based):
/// `lr * sqrt(1 - beta2^t) / (1 - beta1^t)`.
///
/// Step 0 is treated as step 1.
pub fn adam_alpha_t(learning_rate: f32, beta1: f32, beta2: f32, step: u64) -> f32 {
    let t = step.max(1).min(i32::MAX as u64) as i32;
    let correction1 = 1.0 - (beta1 as f64).powi(t);
    let correction2 = 1.0 - (beta2 as f64).powi(t);
    (learning_rate as f64 * correction2.sqrt() / correction1) as f32
}
