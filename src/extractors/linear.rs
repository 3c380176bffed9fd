use crate::extractors::ParamJacobian;
use crate::linalg::dot;
use crate::Float;

/// Jacobian of `y = W a` w.r.t. the row-major weight `W` (`out × in`).
///
/// `J_n θ = Θ a_n` and `J_nᵀ v = v a_nᵀ`, so
/// `xᵀ J_n J_mᵀ y = (x · y)(a_n · a_m)`.
pub struct LinearWeightJacobian<F> {
    inputs: Vec<Vec<F>>,
    out_features: usize,
}

impl<F: Float> LinearWeightJacobian<F> {
    pub fn new(inputs: Vec<Vec<F>>, out_features: usize) -> Self {
        LinearWeightJacobian {
            inputs,
            out_features,
        }
    }

    fn in_features(&self) -> usize {
        self.inputs.first().map_or(0, Vec::len)
    }
}

impl<F: Float> ParamJacobian<F> for LinearWeightJacobian<F> {
    fn param_len(&self) -> usize {
        self.out_features * self.in_features()
    }

    fn output_len(&self) -> usize {
        self.out_features
    }

    fn num_samples(&self) -> usize {
        self.inputs.len()
    }

    fn jvp(&self, sample: usize, theta: &[F]) -> Vec<F> {
        let a = &self.inputs[sample];
        let k = a.len();
        assert_eq!(theta.len(), self.out_features * k, "weight length mismatch");
        theta.chunks_exact(k.max(1)).map(|row| dot(row, a)).collect()
    }

    fn vjp(&self, sample: usize, v: &[F]) -> Vec<F> {
        let a = &self.inputs[sample];
        assert_eq!(v.len(), self.out_features, "output length mismatch");
        let mut out = Vec::with_capacity(v.len() * a.len());
        for &vo in v {
            out.extend(a.iter().map(|&ai| vo * ai));
        }
        out
    }

    fn kernel(&self, n: usize, m: usize, x: &[F], y: &[F]) -> F {
        dot(x, y) * dot(&self.inputs[n], &self.inputs[m])
    }

    fn kernel_block(&self, n: usize, m: usize, xs: &[Vec<F>], ys: &[Vec<F>]) -> Vec<Vec<F>> {
        let aa = dot(&self.inputs[n], &self.inputs[m]);
        xs.iter()
            .map(|x| ys.iter().map(|y| aa * dot(x, y)).collect())
            .collect()
    }
}

/// Jacobian of an additive bias `y = z + b`: the identity for every sample.
pub struct BiasJacobian {
    features: usize,
    samples: usize,
}

impl BiasJacobian {
    pub fn new(features: usize, samples: usize) -> Self {
        BiasJacobian { features, samples }
    }
}

impl<F: Float> ParamJacobian<F> for BiasJacobian {
    fn param_len(&self) -> usize {
        self.features
    }

    fn output_len(&self) -> usize {
        self.features
    }

    fn num_samples(&self) -> usize {
        self.samples
    }

    fn jvp(&self, _sample: usize, theta: &[F]) -> Vec<F> {
        theta.to_vec()
    }

    fn vjp(&self, _sample: usize, v: &[F]) -> Vec<F> {
        v.to_vec()
    }

    fn kernel(&self, _n: usize, _m: usize, x: &[F], y: &[F]) -> F {
        dot(x, y)
    }
}
