//! Per-request configuration.
//!
//! Every setting that influences a curvature request, including the random
//! seed and numerical thresholds, travels in a [`CurvatureConfig`] value.
//! Nothing is read from global state, so independent requests with equal
//! configurations produce equal results.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::hessian_factor::FactorConfig;
use crate::layer::ParamId;
use crate::partition::BlockPartition;
use crate::sampling::SampleSplit;

/// Settings of the Gram eigendecomposition.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EigenConfig<F> {
    /// Eigenvalues `λ <= zero_threshold` are treated as zero and dropped
    /// (absolute; default: `1e-10` for f64, `1e-5` for f32).
    pub zero_threshold: F,
    /// Keep only the `k` largest eigenvalues per block (default: all).
    pub top_k: Option<usize>,
    /// Rescale transferred eigenvectors to unit length (default: true).
    pub normalize: bool,
    /// Compute `‖VVᵀu - λu‖ / max(1, |λ|)` for every kept pair (default: false).
    pub check_residuals: bool,
}

impl Default for EigenConfig<f64> {
    fn default() -> Self {
        EigenConfig {
            zero_threshold: 1e-10,
            top_k: None,
            normalize: true,
            check_residuals: false,
        }
    }
}

impl Default for EigenConfig<f32> {
    fn default() -> Self {
        EigenConfig {
            zero_threshold: 1e-5,
            top_k: None,
            normalize: true,
            check_residuals: false,
        }
    }
}

/// Settings of the low-rank Newton step.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NewtonStepConfig<F> {
    /// Damping `δ` added to every eigenvalue before inversion (default: 0).
    pub damping: F,
    /// Skip directions with `λ + δ <= 0` instead of failing (default: true).
    pub skip_nonpositive: bool,
    /// Damped curvatures in `(0, zero_threshold)` fail with a zero-curvature
    /// error (default: `1e-10` for f64, `1e-5` for f32).
    pub zero_threshold: F,
}

impl Default for NewtonStepConfig<f64> {
    fn default() -> Self {
        NewtonStepConfig {
            damping: 0.0,
            skip_nonpositive: true,
            zero_threshold: 1e-10,
        }
    }
}

impl Default for NewtonStepConfig<f32> {
    fn default() -> Self {
        NewtonStepConfig {
            damping: 0.0,
            skip_nonpositive: true,
            zero_threshold: 1e-5,
        }
    }
}

/// Quantities to compute besides eigenvalues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Outputs {
    pub eigenvectors: bool,
    pub first_order: bool,
    pub second_order: bool,
    pub newton_step: bool,
}

impl Outputs {
    /// Eigenvalues only.
    pub fn eigenvalues() -> Self {
        Outputs {
            eigenvectors: false,
            first_order: false,
            second_order: false,
            newton_step: false,
        }
    }

    /// Everything.
    pub fn all() -> Self {
        Outputs {
            eigenvectors: true,
            first_order: true,
            second_order: true,
            newton_step: true,
        }
    }

    /// Whether parameter-space eigenvectors must be formed.
    pub(crate) fn needs_vectors(&self) -> bool {
        self.eigenvectors || self.first_order || self.second_order || self.newton_step
    }
}

impl Default for Outputs {
    fn default() -> Self {
        Outputs {
            eigenvectors: true,
            first_order: false,
            second_order: false,
            newton_step: false,
        }
    }
}

/// Full description of one curvature request.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CurvatureConfig<F> {
    /// Parameter group in eigenvector order (default: every parameter, forward order).
    pub params: Option<Vec<ParamId>>,
    pub partition: BlockPartition,
    pub factor: FactorConfig,
    pub samples: SampleSplit,
    /// Root of every random stream of the request.
    pub seed: u64,
    pub eigen: EigenConfig<F>,
    pub newton: NewtonStepConfig<F>,
    pub outputs: Outputs,
}

impl<F> Default for CurvatureConfig<F>
where
    EigenConfig<F>: Default,
    NewtonStepConfig<F>: Default,
{
    fn default() -> Self {
        CurvatureConfig {
            params: None,
            partition: BlockPartition::default(),
            factor: FactorConfig::default(),
            samples: SampleSplit::default(),
            seed: 0,
            eigen: EigenConfig::default(),
            newton: NewtonStepConfig::default(),
            outputs: Outputs::default(),
        }
    }
}
