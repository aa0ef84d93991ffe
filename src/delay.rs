//! Delay models for channels and memories.
//!
//! A delay model yields a nonnegative duration in seconds each time it is
//! sampled. All sampling draws from the simulation RNG handle so runs stay
//! seed-deterministic.

use serde::{Deserialize, Serialize};

use crate::rng::SimRng;

/// How a channel or memory computes its per-operation delay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DelayModel {
    /// Fixed delay in seconds.
    Constant(f64),
    /// Uniform delay in `[min, max)` seconds.
    Uniform { min: f64, max: f64 },
    /// Normal delay with the given mean and standard deviation, clamped at zero.
    Normal { mean: f64, std: f64 },
}

impl DelayModel {
    /// Sample a delay in seconds.
    pub fn calculate(&self, rng: &mut SimRng) -> f64 {
        match *self {
            DelayModel::Constant(delay) => delay,
            DelayModel::Uniform { min, max } => rng.uniform(min, max),
            DelayModel::Normal { mean, std } => rng.normal(mean, std).max(0.0),
        }
    }
}

impl Default for DelayModel {
    fn default() -> Self {
        DelayModel::Constant(0.0)
    }
}

impl From<f64> for DelayModel {
    fn from(delay: f64) -> Self {
        DelayModel::Constant(delay)
    }
}
