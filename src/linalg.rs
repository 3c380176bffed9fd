//! Dense helpers and the symmetric eigensolver seam.
//!
//! Matrices are `Vec<Vec<F>>` in row-major order. Only small matrices (Gram
//! matrices, whose size is bounded by samples × factor columns) pass through
//! here; parameter-space vectors are only ever touched by `dot`, `axpy` and
//! friends.

use crate::error::NumericalError;
use crate::Float;

/// Compute the dot product of two vectors.
pub fn dot<F: Float>(a: &[F], b: &[F]) -> F {
    debug_assert_eq!(a.len(), b.len());
    let mut s = F::zero();
    for i in 0..a.len() {
        s = s + a[i] * b[i];
    }
    s
}

/// Compute the L2 norm of a vector.
pub fn norm<F: Float>(v: &[F]) -> F {
    dot(v, v).sqrt()
}

/// `y += alpha * x`.
pub fn axpy<F: Float>(alpha: F, x: &[F], y: &mut [F]) {
    assert_eq!(x.len(), y.len(), "axpy operands must have the same length");
    for (yi, &xi) in y.iter_mut().zip(x) {
        *yi = *yi + alpha * xi;
    }
}

/// `v *= alpha`.
pub fn scale<F: Float>(alpha: F, v: &mut [F]) {
    for vi in v.iter_mut() {
        *vi = *vi * alpha;
    }
}

/// Replace `a` by `(a + aᵀ) / 2` in place.
pub fn symmetrize<F: Float>(a: &mut [Vec<F>]) {
    let n = a.len();
    let half = F::lit(0.5);
    for i in 0..n {
        debug_assert_eq!(a[i].len(), n);
        for j in (i + 1)..n {
            let m = half * (a[i][j] + a[j][i]);
            a[i][j] = m;
            a[j][i] = m;
        }
    }
}

/// `a · x` for a row-major matrix.
pub fn mat_vec<F: Float>(a: &[Vec<F>], x: &[F]) -> Vec<F> {
    a.iter().map(|row| dot(row, x)).collect()
}

/// Eigendecomposition of a symmetric matrix.
///
/// `vectors[i]` is the unit eigenvector belonging to `values[i]`. No ordering
/// is implied; callers sort.
#[derive(Clone, Debug)]
pub struct SymmetricEigen<F> {
    pub values: Vec<F>,
    pub vectors: Vec<Vec<F>>,
}

/// Backend that eigendecomposes dense symmetric matrices.
///
/// Implementations must not keep state between calls: the Gram engine may
/// call one solver from several threads when blocks run in parallel.
pub trait SymmetricEigensolver<F: Float>: Sync {
    fn eigh(&self, a: &[Vec<F>]) -> Result<SymmetricEigen<F>, NumericalError>;
}

/// Cyclic Jacobi eigensolver.
///
/// Sweeps over all off-diagonal pairs, annihilating each with a plane
/// rotation, until the off-diagonal Frobenius norm drops below
/// `n * F::epsilon()` times the matrix norm. Accurate to working precision for
/// the small Gram matrices it sees.
#[derive(Clone, Copy, Debug)]
pub struct Jacobi {
    /// Maximum number of full sweeps (default: 64).
    pub max_sweeps: usize,
}

impl Default for Jacobi {
    fn default() -> Self {
        Jacobi { max_sweeps: 64 }
    }
}

impl<F: Float> SymmetricEigensolver<F> for Jacobi {
    fn eigh(&self, a: &[Vec<F>]) -> Result<SymmetricEigen<F>, NumericalError> {
        jacobi_eigh(a, self.max_sweeps)
            .ok_or(NumericalError::EigensolverDidNotConverge {
                sweeps: self.max_sweeps,
            })
    }
}

/// Jacobi eigendecomposition of a symmetric `n x n` matrix.
///
/// Returns `None` if the off-diagonal mass has not vanished after
/// `max_sweeps` sweeps.
// Rotations update rows and columns p, q of both the matrix and the basis
#[allow(clippy::needless_range_loop)]
pub fn jacobi_eigh<F: Float>(a: &[Vec<F>], max_sweeps: usize) -> Option<SymmetricEigen<F>> {
    let n = a.len();
    debug_assert!(a.iter().all(|row| row.len() == n));

    let mut m: Vec<Vec<F>> = a.to_vec();
    let mut v = vec![vec![F::zero(); n]; n];
    for (i, row) in v.iter_mut().enumerate() {
        row[i] = F::one();
    }

    let eps = F::epsilon();
    let two = F::lit(2.0);
    let tol = eps * F::count(n.max(1));

    for _ in 0..=max_sweeps {
        let mut off = F::zero();
        let mut total = F::zero();
        for i in 0..n {
            for j in 0..n {
                let sq = m[i][j] * m[i][j];
                total = total + sq;
                if i != j {
                    off = off + sq;
                }
            }
        }
        if !off.is_finite() || !total.is_finite() {
            return None;
        }
        if off <= tol * tol * total {
            let values = (0..n).map(|i| m[i][i]).collect();
            let vectors = (0..n).map(|j| (0..n).map(|i| v[i][j]).collect()).collect();
            return Some(SymmetricEigen { values, vectors });
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = m[p][q];
                if apq.abs() <= eps * (m[p][p].abs() + m[q][q].abs()) {
                    m[p][q] = F::zero();
                    m[q][p] = F::zero();
                    continue;
                }
                let theta = (m[q][q] - m[p][p]) / (two * apq);
                let t = if theta >= F::zero() {
                    F::one() / (theta + (theta * theta + F::one()).sqrt())
                } else {
                    -F::one() / (-theta + (theta * theta + F::one()).sqrt())
                };
                let c = F::one() / (t * t + F::one()).sqrt();
                let s = t * c;

                for k in 0..n {
                    let mkp = m[k][p];
                    let mkq = m[k][q];
                    m[k][p] = c * mkp - s * mkq;
                    m[k][q] = s * mkp + c * mkq;
                }
                for k in 0..n {
                    let mpk = m[p][k];
                    let mqk = m[q][k];
                    m[p][k] = c * mpk - s * mqk;
                    m[q][k] = s * mpk + c * mqk;
                }
                m[p][q] = F::zero();
                m[q][p] = F::zero();
                for k in 0..n {
                    let vkp = v[k][p];
                    let vkq = v[k][q];
                    v[k][p] = c * vkp - s * vkq;
                    v[k][q] = s * vkp + c * vkq;
                }
            }
        }
    }

    None
}
