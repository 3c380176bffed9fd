use crate::extractors::ParamJacobian;
use crate::Float;

/// Jacobian of `y = γ ⊙ a` w.r.t. the scale `γ`: `diag(a_n)`.
pub struct ScaleJacobian<F> {
    inputs: Vec<Vec<F>>,
}

impl<F: Float> ScaleJacobian<F> {
    pub fn new(inputs: Vec<Vec<F>>) -> Self {
        ScaleJacobian { inputs }
    }
}

impl<F: Float> ParamJacobian<F> for ScaleJacobian<F> {
    fn param_len(&self) -> usize {
        self.inputs.first().map_or(0, Vec::len)
    }

    fn output_len(&self) -> usize {
        self.param_len()
    }

    fn num_samples(&self) -> usize {
        self.inputs.len()
    }

    fn jvp(&self, sample: usize, theta: &[F]) -> Vec<F> {
        let a = &self.inputs[sample];
        assert_eq!(theta.len(), a.len(), "scale length mismatch");
        theta.iter().zip(a).map(|(&t, &ai)| t * ai).collect()
    }

    fn vjp(&self, sample: usize, v: &[F]) -> Vec<F> {
        self.jvp(sample, v)
    }

    fn kernel(&self, n: usize, m: usize, x: &[F], y: &[F]) -> F {
        let (an, am) = (&self.inputs[n], &self.inputs[m]);
        let mut s = F::zero();
        for i in 0..x.len() {
            s = s + x[i] * y[i] * an[i] * am[i];
        }
        s
    }
}
