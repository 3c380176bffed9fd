use lowrank::Float;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Parameters controlling when [`damped_newton`](crate::damped_newton) stops.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConvergenceParams<F> {
    /// Maximum number of steps (default: 100).
    pub max_iter: usize,
    /// Step size tolerance: stop when `||θ_{k+1} - θ_k|| < step_tol` (default: 1e-12).
    pub step_tol: F,
    /// Loss change tolerance: stop when `|ℓ_{k+1} - ℓ_k| < func_tol` (default: 0, disabled).
    pub func_tol: F,
}

impl Default for ConvergenceParams<f64> {
    fn default() -> Self {
        ConvergenceParams {
            max_iter: 100,
            step_tol: 1e-12,
            func_tol: 0.0,
        }
    }
}

impl Default for ConvergenceParams<f32> {
    fn default() -> Self {
        ConvergenceParams {
            max_iter: 100,
            step_tol: 1e-7,
            func_tol: 0.0,
        }
    }
}

impl<F: Float> ConvergenceParams<F> {
    pub(crate) fn step_converged(&self, step_norm: F) -> bool {
        step_norm < self.step_tol
    }

    pub(crate) fn loss_converged(&self, previous: F, current: F) -> bool {
        self.func_tol > F::zero() && (previous - current).abs() < self.func_tol
    }
}
