//! Directional derivatives along eigenvectors and the low-rank Newton step.
//!
//! For a direction `u` the per-sample first-order derivative is
//! `γ_n = g_nᵀ J_n u` and the per-sample second-order derivative is
//! `λ_n = ‖M_nᵀ J_n u‖²`, the curvature of sample `n`'s GGN along `u`.
//! Both are reduced over their sample subset the same way the loss is.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::NewtonStepConfig;
use crate::error::NumericalError;
use crate::factor::BlockJacobian;
use crate::gram::Eigenpair;
use crate::linalg::{axpy, dot};
use crate::loss::Reduction;
use crate::Float;

/// Per-sample directional derivatives and their reduction, one row per direction.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DirectionalDerivatives<F> {
    /// Samples the derivatives were evaluated on.
    pub samples: Vec<usize>,
    /// `per_sample[i][j]`: direction `i`, sample `samples[j]`.
    pub per_sample: Vec<Vec<F>>,
    /// Reduction-consistent estimate of the batch derivative per direction.
    pub value: Vec<F>,
    /// Sample variance of the per-sample values per direction.
    /// Zero when only one sample is used.
    pub sample_variance: Vec<F>,
    /// Standard error of the mean, `sqrt(sample_variance / samples)`.
    pub standard_error: Vec<F>,
    /// Maps the mean of a row to its `value`: 1 for mean reduction, the
    /// batch size for sum reduction.
    pub scale: F,
}

impl<F: Float> DirectionalDerivatives<F> {
    /// Reduce per-sample rows.
    pub fn aggregate(
        samples: Vec<usize>,
        per_sample: Vec<Vec<F>>,
        reduction: Reduction,
        batch_size: usize,
    ) -> Self {
        let mut value = Vec::with_capacity(per_sample.len());
        let mut sample_variance = Vec::with_capacity(per_sample.len());
        let mut standard_error = Vec::with_capacity(per_sample.len());
        for row in &per_sample {
            value.push(reduction.aggregate(row, batch_size));

            // Welford's online algorithm
            let mut mean = F::zero();
            let mut m2 = F::zero();
            for (k, &x) in row.iter().enumerate() {
                let delta = x - mean;
                mean = mean + delta / F::count(k + 1);
                m2 = m2 + delta * (x - mean);
            }
            let s = row.len();
            if s > 1 {
                let sf = F::count(s);
                let var = m2 / (sf - F::one());
                sample_variance.push(var);
                standard_error.push((var / sf).sqrt());
            } else {
                sample_variance.push(F::zero());
                standard_error.push(F::zero());
            }
        }
        DirectionalDerivatives {
            samples,
            per_sample,
            value,
            sample_variance,
            standard_error,
            scale: reduction.aggregate(&[F::one()], batch_size),
        }
    }
}

/// `γ_{n,i} = g_nᵀ J_n u_i` for every direction and sample.
pub fn first_order<F: Float>(
    jacobian: &BlockJacobian<'_, F>,
    directions: &[Eigenpair<F>],
    samples: &[usize],
    reduction: Reduction,
    batch_size: usize,
) -> DirectionalDerivatives<F> {
    let per_sample = directions
        .iter()
        .map(|d| {
            samples
                .iter()
                .map(|&n| jacobian.project_gradient(n, &d.vector))
                .collect()
        })
        .collect();
    DirectionalDerivatives::aggregate(samples.to_vec(), per_sample, reduction, batch_size)
}

/// `λ_{n,i} = ‖M_nᵀ J_n u_i‖²` for every direction and sample.
///
/// With the direction samples and an exact factor, the reduced value equals
/// the eigenvalue of `u_i`.
pub fn second_order<F: Float>(
    jacobian: &BlockJacobian<'_, F>,
    directions: &[Eigenpair<F>],
    samples: &[usize],
    reduction: Reduction,
    batch_size: usize,
) -> DirectionalDerivatives<F> {
    let per_sample = directions
        .iter()
        .map(|d| {
            samples
                .iter()
                .map(|&n| {
                    let p = jacobian.project_factor(n, &d.vector);
                    dot(&p, &p)
                })
                .collect()
        })
        .collect();
    DirectionalDerivatives::aggregate(samples.to_vec(), per_sample, reduction, batch_size)
}

/// Newton step restricted to the span of the given directions.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NewtonStep<F> {
    /// `-Σ_i γ_i / (λ_i + δ_i) u_i`.
    pub step: Vec<F>,
    /// `-γ_i / (λ_i + δ_i)` per direction, zero for skipped directions.
    pub coefficients: Vec<F>,
    /// Directions skipped because `λ_i + δ_i <= 0`.
    pub skipped: Vec<usize>,
}

/// Assemble `-Σ_i γ_i / (λ_i + δ_i) u_i`.
///
/// `first[i]` and `second[i]` are the first- and second-order directional
/// derivatives along `directions[i]`, `dampings[i]` its damping `δ_i`.
/// A damped curvature that is not positive skips the direction (or fails,
/// when skipping is disabled); one that is positive but below the zero
/// threshold fails with [`NumericalError::ZeroCurvature`], which a larger
/// damping resolves.
pub fn newton_step<F: Float>(
    directions: &[Eigenpair<F>],
    first: &[F],
    second: &[F],
    dampings: &[F],
    config: &NewtonStepConfig<F>,
) -> Result<NewtonStep<F>, NumericalError> {
    assert_eq!(directions.len(), first.len(), "one first-order value per direction");
    assert_eq!(directions.len(), second.len(), "one second-order value per direction");
    assert_eq!(directions.len(), dampings.len(), "one damping per direction");
    let Some(dim) = directions.first().map(|d| d.vector.len()) else {
        return Err(NumericalError::NoCurvatureDirections);
    };

    let mut step = vec![F::zero(); dim];
    let mut coefficients = Vec::with_capacity(directions.len());
    let mut skipped = Vec::new();
    for (i, d) in directions.iter().enumerate() {
        let curvature = second[i] + dampings[i];
        if !curvature.is_finite() || !first[i].is_finite() {
            return Err(NumericalError::NonFinite {
                what: "directional derivative",
            });
        }
        if curvature <= F::zero() {
            if config.skip_nonpositive {
                skipped.push(i);
                coefficients.push(F::zero());
                continue;
            }
            return Err(NumericalError::NonPositiveCurvature {
                direction: i,
                curvature: curvature.to_f64().unwrap_or(f64::NAN),
            });
        }
        if curvature < config.zero_threshold {
            return Err(NumericalError::ZeroCurvature {
                direction: i,
                curvature: curvature.to_f64().unwrap_or(f64::NAN),
            });
        }
        let c = -first[i] / curvature;
        axpy(c, &d.vector, &mut step);
        coefficients.push(c);
    }
    Ok(NewtonStep {
        step,
        coefficients,
        skipped,
    })
}
