//! nalgebra adapters.
//!
//! [`NalgebraEigen`] plugs nalgebra's symmetric eigendecomposition into the
//! Gram engine through [`compute_curvature_with`](crate::compute_curvature_with);
//! the conversion helpers turn results into `DMatrix<F>` / `DVector<F>`.

use nalgebra::{DMatrix, DVector, RealField};

use crate::error::NumericalError;
use crate::float::Float;
use crate::gram::Eigenpair;
use crate::linalg::{SymmetricEigen, SymmetricEigensolver};

/// Symmetric eigensolver backed by `nalgebra::SymmetricEigen`.
#[derive(Clone, Copy, Debug)]
pub struct NalgebraEigen {
    /// Iteration limit of the implicit QR algorithm; `0` means unlimited.
    pub max_iterations: usize,
}

impl Default for NalgebraEigen {
    fn default() -> Self {
        NalgebraEigen {
            max_iterations: 1000,
        }
    }
}

impl<F: Float + RealField> SymmetricEigensolver<F> for NalgebraEigen {
    fn eigh(&self, a: &[Vec<F>]) -> Result<SymmetricEigen<F>, NumericalError> {
        let m = to_dmatrix(a);
        let eps = <F as num_traits::Float>::epsilon();
        let eig = nalgebra::SymmetricEigen::try_new(m, eps, self.max_iterations).ok_or(
            NumericalError::EigensolverDidNotConverge {
                sweeps: self.max_iterations,
            },
        )?;
        Ok(SymmetricEigen {
            values: eig.eigenvalues.iter().copied().collect(),
            vectors: eig
                .eigenvectors
                .column_iter()
                .map(|c| c.iter().copied().collect())
                .collect(),
        })
    }
}

/// Row-major nested vectors to a `DMatrix`.
pub fn to_dmatrix<F: Float + RealField>(rows: &[Vec<F>]) -> DMatrix<F> {
    let ncols = rows.first().map_or(0, Vec::len);
    DMatrix::from_fn(rows.len(), ncols, |i, j| rows[i][j])
}

/// Eigenvectors as the columns of a `dim x k` matrix, in eigenvalue order.
pub fn eigenvector_matrix<F: Float + RealField>(pairs: &[Eigenpair<F>]) -> DMatrix<F> {
    let dim = pairs.first().map_or(0, |p| p.vector.len());
    DMatrix::from_fn(dim, pairs.len(), |i, j| pairs[j].vector[i])
}

/// Eigenvalues as a `DVector`, in the order given.
pub fn eigenvalue_vector<F: Float + RealField>(pairs: &[Eigenpair<F>]) -> DVector<F> {
    DVector::from_iterator(pairs.len(), pairs.iter().map(|p| p.value))
}
