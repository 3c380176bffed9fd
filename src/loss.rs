//! Loss functions and their square-root Hessians with respect to the network output.
//!
//! A loss provides, per sample, factor columns `s_1..s_K` in output space with
//! `Σ_k s_k s_kᵀ = H` (exact recipe) or `E[Σ_k s_k s_kᵀ] = H` (Monte-Carlo
//! recipe). Factor columns are what the host backpropagates to build `V`.

use std::fmt;

use rand::{Rng, RngCore};
use rand_distr::StandardNormal;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::Float;

/// How per-sample losses are combined over a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Reduction {
    /// `(1/N) Σ_n ℓ_n`.
    #[default]
    Mean,
    /// `Σ_n ℓ_n`.
    Sum,
}

impl Reduction {
    /// Reduce per-sample values computed on `samples.len()` of `batch_size`
    /// samples to an estimate of the batch quantity.
    ///
    /// `Mean` averages. `Sum` rescales the subset sum by `batch_size / n` so
    /// the estimate is unbiased for the full batch (and exact when the subset
    /// is the full batch).
    pub fn aggregate<F: Float>(self, per_sample: &[F], batch_size: usize) -> F {
        if per_sample.is_empty() {
            return F::zero();
        }
        let n = F::count(per_sample.len());
        let mean = per_sample.iter().fold(F::zero(), |acc, &v| acc + v) / n;
        match self {
            Reduction::Mean => mean,
            Reduction::Sum => mean * F::count(batch_size),
        }
    }

    /// Weight `w` such that `w · Σ_{n ∈ subset} G_n` estimates the batch curvature
    /// when `subset_size` of `batch_size` samples contribute.
    pub fn weight<F: Float>(self, subset_size: usize, batch_size: usize) -> F {
        let n = F::count(subset_size.max(1));
        match self {
            Reduction::Mean => F::one() / n,
            Reduction::Sum => F::count(batch_size) / n,
        }
    }
}

/// Recipe for the square-root loss Hessian.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FactorRecipe {
    /// Closed-form factor: `Σ_k s_k s_kᵀ = H` exactly.
    Exact,
    /// Sampled factor: `E[Σ_k s_k s_kᵀ] = H`.
    MonteCarlo,
}

impl fmt::Display for FactorRecipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactorRecipe::Exact => write!(f, "exact"),
            FactorRecipe::MonteCarlo => write!(f, "Monte-Carlo"),
        }
    }
}

/// A per-sample loss `ℓ(f, y)` of the network output `f`.
pub trait Loss<F: Float>: Sync {
    /// Target type of one sample.
    type Target: Sync;

    /// Name used in error messages and logs.
    fn name(&self) -> &str;

    fn reduction(&self) -> Reduction;

    /// Per-sample loss value.
    fn value(&self, output: &[F], target: &Self::Target) -> F;

    /// Per-sample gradient `∂ℓ/∂f`.
    fn gradient(&self, output: &[F], target: &Self::Target) -> Vec<F>;

    /// Whether `target` fits a network output of length `output_len`.
    ///
    /// Requests check every target up front, so `value` and `gradient` may
    /// assume this holds.
    fn accepts_target(&self, output_len: usize, target: &Self::Target) -> bool {
        let _ = (output_len, target);
        true
    }

    /// Whether a factor recipe is available.
    fn supports(&self, recipe: FactorRecipe) -> bool {
        let _ = recipe;
        false
    }

    /// Exact factor columns with `Σ_k s_k s_kᵀ = ∂²ℓ/∂f²`.
    fn sqrt_hessian(&self, output: &[F], target: &Self::Target) -> Option<Vec<Vec<F>>> {
        let _ = (output, target);
        None
    }

    /// `samples` Monte-Carlo factor columns, each already scaled by `1/√samples`.
    fn sampled_sqrt_hessian(
        &self,
        output: &[F],
        target: &Self::Target,
        samples: usize,
        rng: &mut dyn RngCore,
    ) -> Option<Vec<Vec<F>>> {
        let _ = (output, target, samples, rng);
        None
    }
}

/// Squared error `ℓ = Σ_c (f_c - y_c)²`.
#[derive(Clone, Copy, Debug, Default)]
pub struct MseLoss {
    pub reduction: Reduction,
}

impl MseLoss {
    pub fn new(reduction: Reduction) -> Self {
        MseLoss { reduction }
    }
}

impl<F: Float> Loss<F> for MseLoss {
    type Target = Vec<F>;

    fn name(&self) -> &str {
        "MSELoss"
    }

    fn reduction(&self) -> Reduction {
        self.reduction
    }

    fn value(&self, output: &[F], target: &Vec<F>) -> F {
        assert_eq!(output.len(), target.len(), "output and target lengths differ");
        output
            .iter()
            .zip(target)
            .fold(F::zero(), |acc, (&f, &y)| acc + (f - y) * (f - y))
    }

    fn gradient(&self, output: &[F], target: &Vec<F>) -> Vec<F> {
        assert_eq!(output.len(), target.len(), "output and target lengths differ");
        let two = F::lit(2.0);
        output.iter().zip(target).map(|(&f, &y)| two * (f - y)).collect()
    }

    fn accepts_target(&self, output_len: usize, target: &Vec<F>) -> bool {
        target.len() == output_len
    }

    fn supports(&self, _recipe: FactorRecipe) -> bool {
        true
    }

    /// `H = 2I`, factor `√2 · e_c`.
    fn sqrt_hessian(&self, output: &[F], _target: &Vec<F>) -> Option<Vec<Vec<F>>> {
        let c = output.len();
        let root_two = F::SQRT_2();
        Some(
            (0..c)
                .map(|k| {
                    let mut col = vec![F::zero(); c];
                    col[k] = root_two;
                    col
                })
                .collect(),
        )
    }

    /// `√2 · ε / √K` with `ε ~ N(0, I)`.
    fn sampled_sqrt_hessian(
        &self,
        output: &[F],
        _target: &Vec<F>,
        samples: usize,
        rng: &mut dyn RngCore,
    ) -> Option<Vec<Vec<F>>> {
        let c = output.len();
        let scale = F::SQRT_2() / F::count(samples).sqrt();
        Some(
            (0..samples)
                .map(|_| {
                    (0..c)
                        .map(|_| {
                            let eps: f64 = rng.sample(StandardNormal);
                            scale * F::lit(eps)
                        })
                        .collect()
                })
                .collect(),
        )
    }
}

/// Softmax cross-entropy `ℓ = log Σ_c exp(f_c) - f_y` with a class-index target.
#[derive(Clone, Copy, Debug, Default)]
pub struct CrossEntropyLoss {
    pub reduction: Reduction,
}

impl CrossEntropyLoss {
    pub fn new(reduction: Reduction) -> Self {
        CrossEntropyLoss { reduction }
    }
}

/// Numerically stable softmax.
pub fn softmax<F: Float>(logits: &[F]) -> Vec<F> {
    let max = logits
        .iter()
        .copied()
        .fold(F::neg_infinity(), |a, b| a.max(b));
    let exps: Vec<F> = logits.iter().map(|&z| (z - max).exp()).collect();
    let sum = exps.iter().fold(F::zero(), |a, &b| a + b);
    exps.into_iter().map(|e| e / sum).collect()
}

impl<F: Float> Loss<F> for CrossEntropyLoss {
    type Target = usize;

    fn name(&self) -> &str {
        "CrossEntropyLoss"
    }

    fn reduction(&self) -> Reduction {
        self.reduction
    }

    fn value(&self, output: &[F], target: &usize) -> F {
        assert!(*target < output.len(), "class index out of range");
        let max = output
            .iter()
            .copied()
            .fold(F::neg_infinity(), |a, b| a.max(b));
        let sum = output
            .iter()
            .fold(F::zero(), |acc, &z| acc + (z - max).exp());
        max + sum.ln() - output[*target]
    }

    fn gradient(&self, output: &[F], target: &usize) -> Vec<F> {
        assert!(*target < output.len(), "class index out of range");
        let mut p = softmax(output);
        p[*target] = p[*target] - F::one();
        p
    }

    fn accepts_target(&self, output_len: usize, target: &usize) -> bool {
        *target < output_len
    }

    fn supports(&self, _recipe: FactorRecipe) -> bool {
        true
    }

    /// `H = diag(p) - ppᵀ`, factor columns `√p_c (e_c - p)`.
    fn sqrt_hessian(&self, output: &[F], _target: &usize) -> Option<Vec<Vec<F>>> {
        let p = softmax(output);
        Some(
            (0..p.len())
                .map(|c| {
                    let root = p[c].sqrt();
                    let mut col: Vec<F> = p.iter().map(|&pj| -root * pj).collect();
                    col[c] = col[c] + root;
                    col
                })
                .collect(),
        )
    }

    /// `(p - e_y) / √K` with labels `y ~ Cat(p)` drawn from the model's own
    /// predictive distribution.
    fn sampled_sqrt_hessian(
        &self,
        output: &[F],
        _target: &usize,
        samples: usize,
        rng: &mut dyn RngCore,
    ) -> Option<Vec<Vec<F>>> {
        let p = softmax(output);
        let scale = F::one() / F::count(samples).sqrt();
        Some(
            (0..samples)
                .map(|_| {
                    let y = sample_categorical(&p, rng);
                    let mut col: Vec<F> = p.iter().map(|&pj| scale * pj).collect();
                    col[y] = col[y] - scale;
                    col
                })
                .collect(),
        )
    }
}

fn sample_categorical<F: Float>(p: &[F], rng: &mut dyn RngCore) -> usize {
    let u: f64 = rng.gen();
    let mut acc = 0.0;
    for (c, &pc) in p.iter().enumerate() {
        acc += pc.to_f64().unwrap_or(0.0);
        if u < acc {
            return c;
        }
    }
    // rounding left `acc` slightly below one
    p.len() - 1
}
