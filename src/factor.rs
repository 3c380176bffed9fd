//! The implicit low-rank factor `V` of a GGN block.
//!
//! For a block `B` and sample `n` with backpropagated factor columns
//! `M_n = [m_{n,1} .. m_{n,K}]` at each layer output, column `(n, k)` of `V`
//! is `c · (J_n^{(p)ᵀ} m_{n,k})_{p ∈ B}` with `c` the reduction scale. `V` is
//! never stored: the Gram matrix is assembled from per-parameter kernels and
//! `V`, `Vᵀ` are applied on the fly.

use std::collections::HashMap;

use crate::error::HostIntegrationError;
use crate::extractors::{LayerCapture, ParamJacobian};
use crate::layer::{LayerId, ParamId};
use crate::linalg::{axpy, dot};
use crate::partition::Block;
use crate::Float;

/// Captured Jacobians and backpropagated quantities, keyed by parameter.
pub struct CaptureIndex<'c, F> {
    params: HashMap<ParamId, (&'c dyn ParamJacobian<F>, &'c LayerCapture<F>)>,
}

impl<'c, F: Float> CaptureIndex<'c, F> {
    pub fn new(captures: &'c [LayerCapture<F>]) -> Self {
        let mut params = HashMap::new();
        for capture in captures {
            for (id, jac) in &capture.jacobians {
                params.insert(*id, (jac.as_ref(), capture));
            }
        }
        CaptureIndex { params }
    }

    /// Restrict to the parameters of `block`, in block order.
    pub fn block(&self, block: &Block) -> Result<BlockJacobian<'c, F>, HostIntegrationError> {
        let terms = block
            .segments
            .iter()
            .map(|seg| {
                let &(jacobian, capture) = self
                    .params
                    .get(&seg.id)
                    .ok_or(HostIntegrationError::MissingParameter { param: seg.id })?;
                if jacobian.param_len() != seg.len {
                    return Err(HostIntegrationError::ShapeMismatch {
                        layer: seg.id.layer,
                        what: "parameter Jacobian",
                        expected: seg.len,
                        found: jacobian.param_len(),
                    });
                }
                Ok(Term {
                    offset: seg.offset,
                    len: seg.len,
                    layer: capture.layer,
                    jacobian,
                    backprop: &capture.backprop,
                    gradients: &capture.gradients,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(BlockJacobian {
            dim: block.dim(),
            terms,
        })
    }
}

struct Term<'c, F> {
    offset: usize,
    len: usize,
    layer: LayerId,
    jacobian: &'c dyn ParamJacobian<F>,
    backprop: &'c [Vec<Vec<F>>],
    gradients: &'c [Vec<F>],
}

/// Per-sample Jacobians of the network output w.r.t. one block, composed with
/// the backpropagated factor columns and loss gradients.
pub struct BlockJacobian<'c, F> {
    dim: usize,
    terms: Vec<Term<'c, F>>,
}

impl<'c, F: Float> BlockJacobian<'c, F> {
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of factor columns of sample `n`, checked to agree across layers.
    pub fn columns_of(&self, n: usize) -> Result<usize, HostIntegrationError> {
        let mut count = None;
        for t in &self.terms {
            let k = t.backprop.get(n).map_or(0, Vec::len);
            match count {
                None => count = Some(k),
                Some(c) if c != k => {
                    return Err(HostIntegrationError::ShapeMismatch {
                        layer: t.layer,
                        what: "factor columns per sample",
                        expected: c,
                        found: k,
                    })
                }
                Some(_) => {}
            }
        }
        Ok(count.unwrap_or(0))
    }

    /// `m_{n,k}ᵀ J_n x` for every column `k` of sample `n` (unscaled).
    pub fn project_factor(&self, n: usize, x: &[F]) -> Vec<F> {
        assert_eq!(x.len(), self.dim, "vector does not match block dimension");
        let k = self.terms.first().map_or(0, |t| t.backprop[n].len());
        let mut out = vec![F::zero(); k];
        for t in &self.terms {
            let jx = t.jacobian.jvp(n, &x[t.offset..t.offset + t.len]);
            for (o, col) in out.iter_mut().zip(&t.backprop[n]) {
                *o = *o + dot(col, &jx);
            }
        }
        out
    }

    /// `g_nᵀ J_n x` with `g_n` the loss gradient of sample `n`.
    pub fn project_gradient(&self, n: usize, x: &[F]) -> F {
        assert_eq!(x.len(), self.dim, "vector does not match block dimension");
        self.terms.iter().fold(F::zero(), |acc, t| {
            let jx = t.jacobian.jvp(n, &x[t.offset..t.offset + t.len]);
            acc + dot(&t.gradients[n], &jx)
        })
    }

    /// `J_nᵀ g_n`, the block gradient of sample `n`'s loss.
    pub fn sample_gradient(&self, n: usize) -> Vec<F> {
        let mut out = vec![F::zero(); self.dim];
        for t in &self.terms {
            let g = t.jacobian.vjp(n, &t.gradients[n]);
            out[t.offset..t.offset + t.len].copy_from_slice(&g);
        }
        out
    }
}

/// Column `k` of sample `sample`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FactorColumn {
    sample: usize,
    k: usize,
}

/// `V` for one block over a set of samples, with a uniform column scale.
pub struct LowRankFactor<'b, 'c, F> {
    jacobian: &'b BlockJacobian<'c, F>,
    samples: Vec<usize>,
    /// Columns per sample, aligned with `samples`.
    counts: Vec<usize>,
    columns: Vec<FactorColumn>,
    scale: F,
}

impl<'b, 'c, F: Float> LowRankFactor<'b, 'c, F> {
    pub fn new(
        jacobian: &'b BlockJacobian<'c, F>,
        samples: &[usize],
        scale: F,
    ) -> Result<Self, HostIntegrationError> {
        let mut columns = Vec::new();
        let mut counts = Vec::with_capacity(samples.len());
        for &n in samples {
            let k = jacobian.columns_of(n)?;
            columns.extend((0..k).map(|k| FactorColumn { sample: n, k }));
            counts.push(k);
        }
        Ok(LowRankFactor {
            jacobian,
            samples: samples.to_vec(),
            counts,
            columns,
            scale,
        })
    }

    /// Number of columns, i.e. the Gram matrix dimension.
    pub fn rank(&self) -> usize {
        self.columns.len()
    }

    pub fn dim(&self) -> usize {
        self.jacobian.dim
    }

    /// `G = VᵀV`, assembled sample pair by sample pair from kernels.
    pub fn gram(&self) -> Vec<Vec<F>> {
        let r = self.rank();
        let mut g = vec![vec![F::zero(); r]; r];
        let scale2 = self.scale * self.scale;
        // first column index of each sample
        let mut starts = Vec::with_capacity(self.samples.len());
        let mut offset = 0;
        for &k in &self.counts {
            starts.push(offset);
            offset += k;
        }
        for (a, &n) in self.samples.iter().enumerate() {
            for (b, &m) in self.samples.iter().enumerate().skip(a) {
                for t in &self.jacobian.terms {
                    let block = t.jacobian.kernel_block(n, m, &t.backprop[n], &t.backprop[m]);
                    for (i, row) in block.iter().enumerate() {
                        for (j, &v) in row.iter().enumerate() {
                            let (p, q) = (starts[a] + i, starts[b] + j);
                            g[p][q] = g[p][q] + scale2 * v;
                        }
                    }
                }
                if a == b {
                    continue;
                }
                for i in 0..self.counts[a] {
                    for j in 0..self.counts[b] {
                        let (p, q) = (starts[a] + i, starts[b] + j);
                        g[q][p] = g[p][q];
                    }
                }
            }
        }
        g
    }

    /// `V w`.
    pub fn apply(&self, w: &[F]) -> Vec<F> {
        assert_eq!(w.len(), self.rank(), "coefficient vector does not match rank");
        let mut out = vec![F::zero(); self.dim()];
        for (col, &wi) in self.columns.iter().zip(w) {
            if wi == F::zero() {
                continue;
            }
            for t in &self.jacobian.terms {
                let v = t.jacobian.vjp(col.sample, &t.backprop[col.sample][col.k]);
                axpy(self.scale * wi, &v, &mut out[t.offset..t.offset + t.len]);
            }
        }
        out
    }

    /// `Vᵀ x`.
    pub fn apply_transpose(&self, x: &[F]) -> Vec<F> {
        let mut out = Vec::with_capacity(self.rank());
        for &n in &self.samples {
            out.extend(
                self.jacobian
                    .project_factor(n, x)
                    .into_iter()
                    .map(|v| self.scale * v),
            );
        }
        out
    }

    /// `V Vᵀ x`, the GGN-block vector product.
    pub fn ggn_vector_product(&self, x: &[F]) -> Vec<F> {
        self.apply(&self.apply_transpose(x))
    }

    /// `V` as a dense `dim × rank` matrix.
    #[cfg(test)]
    fn dense(&self) -> Vec<Vec<F>> {
        let r = self.rank();
        let cols: Vec<Vec<F>> = (0..r)
            .map(|j| {
                let mut e = vec![F::zero(); r];
                e[j] = F::one();
                self.apply(&e)
            })
            .collect();
        (0..self.dim())
            .map(|i| cols.iter().map(|c| c[i]).collect())
            .collect()
    }
}
