//! Damping policies.
//!
//! A policy maps the first- and second-order directional derivatives along
//! each Newton direction to a damping `δ_i` added to the curvature before
//! inversion.

use rand::Rng;

use lowrank::sampling::{stream, Stream};
use lowrank::{DirectionalDerivatives, Float};

/// Chooses one damping per direction.
pub trait Damping<F: Float>: Sync {
    /// `first` and `second` hold one row per direction, in the same order.
    fn dampings(
        &self,
        first: &DirectionalDerivatives<F>,
        second: &DirectionalDerivatives<F>,
    ) -> Vec<F>;
}

/// The same damping along every direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantDamping<F> {
    pub damping: F,
}

impl<F> ConstantDamping<F> {
    pub fn new(damping: F) -> Self {
        ConstantDamping { damping }
    }
}

impl<F: Float> Damping<F> for ConstantDamping<F> {
    fn dampings(
        &self,
        first: &DirectionalDerivatives<F>,
        _second: &DirectionalDerivatives<F>,
    ) -> Vec<F> {
        vec![self.damping; first.value.len()]
    }
}

/// Grid search over candidate dampings, scored on bootstrap resamples.
///
/// For direction `i` and resample `b`, the per-sample first- and second-order
/// values are resampled with replacement and reduced to `γ̂_b`, `λ̂_b`. A
/// candidate `δ` proposes `τ_b = -γ̂_b / (λ̂_b + δ)` and is scored by the
/// improvement `-(γ τ_b + ½ λ τ_b²)` it achieves on the quadratic model built
/// from the full-sample estimates `γ`, `λ`, averaged over resamples.
/// Resamples with `λ̂_b + δ <= 0` contribute no improvement. The candidate
/// with the highest mean improvement wins; ties go to the earlier candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapDamping<F> {
    pub candidates: Vec<F>,
    /// Bootstrap resamples per direction (default: 100).
    pub resamples: usize,
    /// Seed of the resampling streams; direction `i` reads `Stream::User(i)`.
    pub seed: u64,
}

impl<F: Float> BootstrapDamping<F> {
    /// # Panics
    ///
    /// Panics if `candidates` is empty.
    pub fn new(candidates: Vec<F>) -> Self {
        assert!(!candidates.is_empty(), "at least one damping candidate");
        BootstrapDamping {
            candidates,
            resamples: 100,
            seed: 0,
        }
    }

    /// Candidates `10^lo, 10^(lo+1), ..., 10^hi`.
    pub fn log_grid(lo: i32, hi: i32) -> Self {
        assert!(lo <= hi, "empty damping grid");
        Self::new((lo..=hi).map(|e| F::lit(10f64.powi(e))).collect())
    }

    pub fn with_resamples(mut self, resamples: usize) -> Self {
        self.resamples = resamples;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn resample<R: Rng>(row: &[F], scale: F, rng: &mut R) -> F {
        let n = row.len();
        let mut sum = F::zero();
        for _ in 0..n {
            sum = sum + row[rng.gen_range(0..n)];
        }
        scale * sum / F::count(n)
    }

    fn select(
        &self,
        i: usize,
        first: &DirectionalDerivatives<F>,
        second: &DirectionalDerivatives<F>,
    ) -> F {
        let (gammas, lambdas) = (&first.per_sample[i], &second.per_sample[i]);
        if gammas.is_empty() || lambdas.is_empty() || self.resamples == 0 {
            return self.candidates[0];
        }
        let mut rng = stream(self.seed, Stream::User(i as u64));
        let draws: Vec<(F, F)> = (0..self.resamples)
            .map(|_| {
                (
                    Self::resample(gammas, first.scale, &mut rng),
                    Self::resample(lambdas, second.scale, &mut rng),
                )
            })
            .collect();

        let (gamma, lambda) = (first.value[i], second.value[i]);
        let half = F::lit(0.5);
        let mut best = self.candidates[0];
        let mut best_score = F::neg_infinity();
        for &delta in &self.candidates {
            let total = draws.iter().fold(F::zero(), |acc, &(g, l)| {
                let curvature = l + delta;
                if curvature <= F::zero() {
                    return acc;
                }
                let tau = -g / curvature;
                acc - (gamma * tau + half * lambda * tau * tau)
            });
            let score = total / F::count(draws.len());
            if score > best_score {
                best = delta;
                best_score = score;
            }
        }
        tracing::trace!(direction = i, damping = %best, score = %best_score, "bootstrap damping");
        best
    }
}

impl<F: Float> Damping<F> for BootstrapDamping<F> {
    fn dampings(
        &self,
        first: &DirectionalDerivatives<F>,
        second: &DirectionalDerivatives<F>,
    ) -> Vec<F> {
        (0..first.value.len())
            .map(|i| self.select(i, first, second))
            .collect()
    }
}
