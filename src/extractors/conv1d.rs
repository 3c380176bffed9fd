use crate::extractors::ParamJacobian;
use crate::Float;

/// Shape of a one-dimensional cross-correlation without padding.
///
/// Inputs are `in_channels × input_len`, outputs `out_channels × positions`,
/// kernels `out_channels × in_channels × kernel_size`, all row-major.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Conv1dGeometry {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub input_len: usize,
    pub positions: usize,
}

impl Conv1dGeometry {
    fn kernel_len(&self) -> usize {
        self.out_channels * self.in_channels * self.kernel_size
    }

    fn output_len(&self) -> usize {
        self.out_channels * self.positions
    }

    /// Input entry seen by tap `k` of channel `c` at output position `t`.
    #[inline]
    fn tap<F: Float>(&self, x: &[F], c: usize, t: usize, k: usize) -> F {
        x[c * self.input_len + t * self.stride + k]
    }
}

/// Jacobian of a convolution output w.r.t. its kernel.
///
/// The kernel is evaluated through the patch Gram matrix
/// `Q[t][t'] = Σ_{c,k} x_n[c, t·s + k] x_m[c, t'·s + k]`:
/// `xᵀ J_n J_mᵀ y = Σ_o Σ_{t,t'} x[o,t] Q[t][t'] y[o,t']`.
pub struct Conv1dWeightJacobian<F> {
    inputs: Vec<Vec<F>>,
    geometry: Conv1dGeometry,
}

impl<F: Float> Conv1dWeightJacobian<F> {
    pub fn new(inputs: Vec<Vec<F>>, geometry: Conv1dGeometry) -> Self {
        Conv1dWeightJacobian { inputs, geometry }
    }

    fn patch_gram(&self, n: usize, m: usize) -> Vec<Vec<F>> {
        let g = &self.geometry;
        let (xn, xm) = (&self.inputs[n], &self.inputs[m]);
        (0..g.positions)
            .map(|t| {
                (0..g.positions)
                    .map(|u| {
                        let mut s = F::zero();
                        for c in 0..g.in_channels {
                            for k in 0..g.kernel_size {
                                s = s + g.tap(xn, c, t, k) * g.tap(xm, c, u, k);
                            }
                        }
                        s
                    })
                    .collect()
            })
            .collect()
    }

    fn contract(&self, q: &[Vec<F>], x: &[F], y: &[F]) -> F {
        let t_len = self.geometry.positions;
        let mut s = F::zero();
        for o in 0..self.geometry.out_channels {
            let xo = &x[o * t_len..(o + 1) * t_len];
            let yo = &y[o * t_len..(o + 1) * t_len];
            for (t, row) in q.iter().enumerate() {
                if xo[t] == F::zero() {
                    continue;
                }
                let mut inner = F::zero();
                for (u, &quv) in row.iter().enumerate() {
                    inner = inner + quv * yo[u];
                }
                s = s + xo[t] * inner;
            }
        }
        s
    }
}

impl<F: Float> ParamJacobian<F> for Conv1dWeightJacobian<F> {
    fn param_len(&self) -> usize {
        self.geometry.kernel_len()
    }

    fn output_len(&self) -> usize {
        self.geometry.output_len()
    }

    fn num_samples(&self) -> usize {
        self.inputs.len()
    }

    fn jvp(&self, sample: usize, theta: &[F]) -> Vec<F> {
        let g = &self.geometry;
        assert_eq!(theta.len(), g.kernel_len(), "kernel length mismatch");
        let x = &self.inputs[sample];
        let mut out = vec![F::zero(); g.output_len()];
        for o in 0..g.out_channels {
            for t in 0..g.positions {
                let mut s = F::zero();
                for c in 0..g.in_channels {
                    let w = &theta[(o * g.in_channels + c) * g.kernel_size..][..g.kernel_size];
                    for (k, &wk) in w.iter().enumerate() {
                        s = s + wk * g.tap(x, c, t, k);
                    }
                }
                out[o * g.positions + t] = s;
            }
        }
        out
    }

    fn vjp(&self, sample: usize, v: &[F]) -> Vec<F> {
        let g = &self.geometry;
        assert_eq!(v.len(), g.output_len(), "output length mismatch");
        let x = &self.inputs[sample];
        let mut out = vec![F::zero(); g.kernel_len()];
        for o in 0..g.out_channels {
            for t in 0..g.positions {
                let vot = v[o * g.positions + t];
                if vot == F::zero() {
                    continue;
                }
                for c in 0..g.in_channels {
                    let base = (o * g.in_channels + c) * g.kernel_size;
                    for k in 0..g.kernel_size {
                        out[base + k] = out[base + k] + vot * g.tap(x, c, t, k);
                    }
                }
            }
        }
        out
    }

    fn kernel(&self, n: usize, m: usize, x: &[F], y: &[F]) -> F {
        self.contract(&self.patch_gram(n, m), x, y)
    }

    fn kernel_block(&self, n: usize, m: usize, xs: &[Vec<F>], ys: &[Vec<F>]) -> Vec<Vec<F>> {
        let q = self.patch_gram(n, m);
        xs.iter()
            .map(|x| ys.iter().map(|y| self.contract(&q, x, y)).collect())
            .collect()
    }
}

/// Jacobian of a convolution output w.r.t. its per-channel bias.
pub struct Conv1dBiasJacobian {
    geometry: Conv1dGeometry,
    samples: usize,
}

impl Conv1dBiasJacobian {
    pub fn new(geometry: Conv1dGeometry, samples: usize) -> Self {
        Conv1dBiasJacobian { geometry, samples }
    }

    fn channel_sums<F: Float>(&self, v: &[F]) -> Vec<F> {
        v.chunks_exact(self.geometry.positions.max(1))
            .map(|row| row.iter().fold(F::zero(), |a, &b| a + b))
            .collect()
    }
}

impl<F: Float> ParamJacobian<F> for Conv1dBiasJacobian {
    fn param_len(&self) -> usize {
        self.geometry.out_channels
    }

    fn output_len(&self) -> usize {
        self.geometry.output_len()
    }

    fn num_samples(&self) -> usize {
        self.samples
    }

    fn jvp(&self, _sample: usize, theta: &[F]) -> Vec<F> {
        assert_eq!(theta.len(), self.geometry.out_channels, "bias length mismatch");
        theta
            .iter()
            .flat_map(|&b| std::iter::repeat(b).take(self.geometry.positions))
            .collect()
    }

    fn vjp(&self, _sample: usize, v: &[F]) -> Vec<F> {
        assert_eq!(v.len(), self.geometry.output_len(), "output length mismatch");
        self.channel_sums(v)
    }

    fn kernel(&self, _n: usize, _m: usize, x: &[F], y: &[F]) -> F {
        crate::linalg::dot(&self.channel_sums(x), &self.channel_sums(y))
    }
}
