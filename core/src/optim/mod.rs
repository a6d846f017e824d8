//! In-place optimizer updates of embedding rows.
//!
//! The optimizer kind is picked once when a table is built. The per-kind state
//! lives in [`OptimizerState`], sized for the shard's full capacity, and the
//! [`OptimizerUpdateEngine`] applies one update per unique row of a [`Wgrad`].

pub mod adam;
pub mod scheduler;
pub mod sgd;

pub use adam::Adam;
pub use scheduler::{adam_alpha_t, CosineDecay, LearningRateSchedule, LinearWarmup};
pub use sgd::{MomentumSgd, Nesterov, Sgd};

use crate::error::{EmbeddingError, Result};
use crate::params::OptimizerParams;
use crate::pipeline::Wgrad;
use crate::table::EmbeddingValueStore;
use crate::types::HashKey;
use std::fmt;
use std::str::FromStr;

/// Optimizer selector, with the integer codes used by external drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptimizerKind {
    Adam = 0,
    MomentumSgd = 1,
    Nesterov = 2,
    Sgd = 3,
}

impl TryFrom<u32> for OptimizerKind {
    type Error = EmbeddingError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Adam),
            1 => Ok(Self::MomentumSgd),
            2 => Ok(Self::Nesterov),
            3 => Ok(Self::Sgd),
            other => Err(EmbeddingError::config(format!(
                "unknown optimizer kind {other}"
            ))),
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "adam" => Ok(Self::Adam),
            "momentum_sgd" | "momentum" => Ok(Self::MomentumSgd),
            "nesterov" => Ok(Self::Nesterov),
            "sgd" => Ok(Self::Sgd),
            other => Err(EmbeddingError::config(format!(
                "unknown optimizer '{other}'"
            ))),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Adam => "adam",
            Self::MomentumSgd => "momentum_sgd",
            Self::Nesterov => "nesterov",
            Self::Sgd => "sgd",
        };
        f.write_str(name)
    }
}

/// Auxiliary per-row arrays, `[capacity, vec_size]` each, zero at construction.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimizerState {
    Sgd,
    Momentum { momentum: Vec<f32> },
    Nesterov { accm: Vec<f32> },
    Adam { m: Vec<f32>, v: Vec<f32> },
}

impl OptimizerState {
    pub fn new(kind: OptimizerKind, capacity: usize, vec_size: usize) -> Self {
        let len = capacity * vec_size;
        match kind {
            OptimizerKind::Sgd => Self::Sgd,
            OptimizerKind::MomentumSgd => Self::Momentum {
                momentum: vec![0.0; len],
            },
            OptimizerKind::Nesterov => Self::Nesterov {
                accm: vec![0.0; len],
            },
            OptimizerKind::Adam => Self::Adam {
                m: vec![0.0; len],
                v: vec![0.0; len],
            },
        }
    }

    /// Length of each auxiliary array; 0 for SGD.
    pub fn len(&self) -> usize {
        match self {
            Self::Sgd => 0,
            Self::Momentum { momentum } => momentum.len(),
            Self::Nesterov { accm } => accm.len(),
            Self::Adam { m, .. } => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Optimizer of one table on one device.
#[derive(Debug, Clone)]
pub struct OptimizerUpdateEngine {
    params: OptimizerParams,
    state: OptimizerState,
    vec_size: usize,
    times: u64,
}

impl OptimizerUpdateEngine {
    pub fn new(params: OptimizerParams, capacity: usize, vec_size: usize) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            state: OptimizerState::new(params.kind(), capacity, vec_size),
            vec_size,
            times: 0,
        })
    }

    pub fn kind(&self) -> OptimizerKind {
        self.params.kind()
    }

    pub fn params(&self) -> &OptimizerParams {
        &self.params
    }

    pub fn state(&self) -> &OptimizerState {
        &self.state
    }

    /// Number of completed `update` calls.
    pub fn times(&self) -> u64 {
        self.times
    }

    /// For Adam this is the bias-corrected `alpha_t`.
    pub fn set_learning_rate(&mut self, learning_rate: f32) -> Result<()> {
        let mut params = self.params;
        params.set_learning_rate(learning_rate);
        params.validate()?;
        self.params = params;
        Ok(())
    }

    /// Applies `wgrad` to `store`, once per unique row, and advances the step counter.
    pub fn update<K: HashKey>(
        &mut self,
        wgrad: &Wgrad<K>,
        store: &mut EmbeddingValueStore,
    ) -> Result<()> {
        if wgrad.vec_size != self.vec_size || store.vec_size() != self.vec_size {
            return Err(EmbeddingError::ShapeMismatch {
                expected: vec![self.vec_size],
                got: vec![wgrad.vec_size, store.vec_size()],
            });
        }
        if let Some(&bad) = wgrad.rows.iter().find(|&&r| r >= store.capacity()) {
            return Err(EmbeddingError::InvalidInput(format!(
                "gradient row {bad} is outside the store"
            )));
        }

        let width = self.vec_size;
        for (i, &row) in wgrad.rows.iter().enumerate() {
            let grad = wgrad.grad(i);
            let aux = row * width..(row + 1) * width;
            match (&self.params, &mut self.state) {
                (OptimizerParams::Sgd(o), OptimizerState::Sgd) => {
                    o.update_row(store.row_mut(row), grad)
                }
                (OptimizerParams::MomentumSgd(o), OptimizerState::Momentum { momentum }) => {
                    o.update_row(store.row_mut(row), &mut momentum[aux], grad)
                }
                (OptimizerParams::Nesterov(o), OptimizerState::Nesterov { accm }) => {
                    o.update_row(store.row_mut(row), &mut accm[aux], grad)
                }
                (OptimizerParams::Adam(o), OptimizerState::Adam { m, v }) => {
                    o.update_row(store.row_mut(row), &mut m[aux.clone()], &mut v[aux], grad)
                }
                _ => {
                    return Err(EmbeddingError::config(
                        "optimizer state does not match its parameters",
                    ))
                }
            }
        }
        self.times += 1;
        Ok(())
    }
}
