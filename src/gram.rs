//! Eigenpairs of a GGN block from its small Gram matrix.
//!
//! With `G = VᵀV = W Λ Wᵀ`, every eigenpair `(λ, w)` of `G` with `λ > 0`
//! gives an eigenpair `(λ, u)` of `V Vᵀ` with `u = V w / √λ`, and `‖u‖ = 1`
//! whenever `‖w‖ = 1`. Eigenvalues at or below the zero threshold belong to
//! the null space of `V` and are dropped.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::EigenConfig;
use crate::error::NumericalError;
use crate::factor::LowRankFactor;
use crate::linalg::{axpy, norm, scale, symmetrize, SymmetricEigensolver};
use crate::Float;

/// Kept eigenpairs of `G`, descending by eigenvalue.
#[derive(Clone, Debug)]
pub struct GramEigen<F> {
    /// Eigenvalues above the zero threshold, largest first.
    pub values: Vec<F>,
    /// Unit eigenvectors of `G` belonging to `values`.
    pub coefficients: Vec<Vec<F>>,
    /// Dimension of `G`.
    pub rank: usize,
    /// Eigenvalues at or below the zero threshold.
    pub dropped: usize,
}

/// An eigenpair of a GGN block in parameter space.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Eigenpair<F> {
    pub value: F,
    pub vector: Vec<F>,
}

/// Form, symmetrize and eigendecompose `G = VᵀV`.
///
/// Eigenvalues are sorted descending with a stable sort: equal eigenvalues
/// keep the order the solver returned them in. No canonical tie-break is
/// applied, so the basis of a repeated eigenvalue depends on the solver.
pub fn gram_eigen<F: Float>(
    factor: &LowRankFactor<'_, '_, F>,
    solver: &dyn SymmetricEigensolver<F>,
    config: &EigenConfig<F>,
) -> Result<GramEigen<F>, NumericalError> {
    let mut g = factor.gram();
    if g.iter().flatten().any(|v| !v.is_finite()) {
        return Err(NumericalError::NonFinite {
            what: "Gram matrix",
        });
    }
    symmetrize(&mut g);
    let eig = solver.eigh(&g)?;

    let mut pairs: Vec<(F, Vec<F>)> = eig.values.into_iter().zip(eig.vectors).collect();
    let rank = pairs.len();
    pairs.retain(|(lambda, _)| *lambda > config.zero_threshold);
    let dropped = rank - pairs.len();
    pairs.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    if let Some(k) = config.top_k {
        pairs.truncate(k);
    }

    let (values, coefficients) = pairs.into_iter().unzip();
    Ok(GramEigen {
        values,
        coefficients,
        rank,
        dropped,
    })
}

impl<F: Float> GramEigen<F> {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Map the kept eigenpairs to parameter space, `u = V w / √λ`.
    ///
    /// With `normalize`, `u` is additionally rescaled to unit length, which
    /// removes the rounding drift of the transfer.
    pub fn transfer(&self, factor: &LowRankFactor<'_, '_, F>, normalize: bool) -> Vec<Eigenpair<F>> {
        self.values
            .iter()
            .zip(&self.coefficients)
            .map(|(&value, w)| {
                let mut vector = factor.apply(w);
                scale(F::one() / value.sqrt(), &mut vector);
                if normalize {
                    let n = norm(&vector);
                    if n > F::zero() {
                        scale(F::one() / n, &mut vector);
                    }
                }
                Eigenpair { value, vector }
            })
            .collect()
    }
}

/// `‖V Vᵀ u - λ u‖ / max(1, |λ|)`.
pub fn residual<F: Float>(factor: &LowRankFactor<'_, '_, F>, pair: &Eigenpair<F>) -> F {
    let mut r = factor.ggn_vector_product(&pair.vector);
    axpy(-pair.value, &pair.vector, &mut r);
    norm(&r) / pair.value.abs().max(F::one())
}
