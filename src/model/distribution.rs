//! Runtime parameter distributions
//!
//! Used wherever the model draws a number at run time: product release
//! delays, initial populations, wait-list seeding. The closed variant set
//! mirrors the samplers available on [`RngManager`].

use crate::rng::RngManager;
use serde::{Deserialize, Serialize};

/// A sampleable distribution with its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RuntimeDistribution {
    /// Always `value`
    Delta { value: f64 },
    /// Uniform in [min, max)
    Uniform { min: f64, max: f64 },
    /// Normal(mean, sd); can be negative, so not usable as a time delay
    Gaussian { mean: f64, sd: f64 },
    /// max(0, Normal(mean, sd))
    TruncGaussian { mean: f64, sd: f64 },
    /// Normal(mean, sd) resampled until non-negative
    NonNegGaussian { mean: f64, sd: f64 },
    /// Exponential with the given rate
    Exponential { rate: f64 },
    /// Gamma(shape, scale)
    Gamma { shape: f64, scale: f64 },
    /// Beta(alpha, beta)
    Beta { alpha: f64, beta: f64 },
}

impl RuntimeDistribution {
    /// The constant distribution.
    pub fn delta(value: f64) -> Self {
        RuntimeDistribution::Delta { value }
    }

    /// True for the constant distribution.
    pub fn is_constant(&self) -> bool {
        matches!(self, RuntimeDistribution::Delta { .. })
    }

    /// True for the constant-zero distribution. Products with a zero
    /// delay release directly instead of through the wait list.
    pub fn is_zero(&self) -> bool {
        matches!(self, RuntimeDistribution::Delta { value } if *value == 0.0)
    }

    /// Draw one sample.
    pub fn sample(&self, rng: &mut RngManager) -> f64 {
        match *self {
            RuntimeDistribution::Delta { value } => value,
            RuntimeDistribution::Uniform { min, max } => rng.uniform(min, max),
            RuntimeDistribution::Gaussian { mean, sd } => rng.normal(mean, sd),
            RuntimeDistribution::TruncGaussian { mean, sd } => rng.normal(mean, sd).max(0.0),
            RuntimeDistribution::NonNegGaussian { mean, sd } => loop {
                let x = rng.normal(mean, sd);
                if x >= 0.0 {
                    break x;
                }
            },
            RuntimeDistribution::Exponential { rate } => rng.exponential(rate),
            RuntimeDistribution::Gamma { shape, scale } => rng.gamma(shape, scale),
            RuntimeDistribution::Beta { alpha, beta } => rng.beta(alpha, beta),
        }
    }
}
