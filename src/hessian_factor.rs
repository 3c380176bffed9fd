//! Per-sample square-root factors of the loss Hessian.

use std::marker::PhantomData;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, CurvatureError, NumericalError};
use crate::loss::{FactorRecipe, Loss};
use crate::sampling::{stream, Stream};
use crate::Float;

/// Which square-root Hessian recipe to use and how many Monte-Carlo draws.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FactorConfig {
    /// Requested recipe (default: exact).
    pub recipe: FactorRecipe,
    /// Number of Monte-Carlo columns `K` per sample (default: 1).
    pub mc_samples: usize,
}

impl Default for FactorConfig {
    fn default() -> Self {
        FactorConfig {
            recipe: FactorRecipe::Exact,
            mc_samples: 1,
        }
    }
}

impl FactorConfig {
    pub fn monte_carlo(mc_samples: usize) -> Self {
        FactorConfig {
            recipe: FactorRecipe::MonteCarlo,
            mc_samples,
        }
    }
}

/// Loss-Hessian factor source bound to one loss, one recipe and one seed.
///
/// Monte-Carlo draws for sample `n` come from a stream keyed by `n`, so the
/// factor of a sample does not depend on which other samples are requested.
pub struct HessianFactorProvider<'a, F, L: ?Sized> {
    loss: &'a L,
    recipe: FactorRecipe,
    mc_samples: usize,
    seed: u64,
    _float: PhantomData<F>,
}

impl<'a, F: Float, L: Loss<F> + ?Sized> HessianFactorProvider<'a, F, L> {
    /// Pick a recipe the loss supports.
    ///
    /// An unavailable exact recipe falls back to Monte-Carlo when the loss has
    /// one; otherwise the loss is rejected.
    pub fn resolve(loss: &'a L, config: &FactorConfig, seed: u64) -> Result<Self, ConfigurationError> {
        let recipe = match config.recipe {
            FactorRecipe::Exact if loss.supports(FactorRecipe::Exact) => FactorRecipe::Exact,
            FactorRecipe::Exact if loss.supports(FactorRecipe::MonteCarlo) => {
                tracing::warn!(
                    loss = loss.name(),
                    "no exact square-root Hessian, falling back to Monte-Carlo"
                );
                FactorRecipe::MonteCarlo
            }
            FactorRecipe::MonteCarlo if loss.supports(FactorRecipe::MonteCarlo) => {
                FactorRecipe::MonteCarlo
            }
            requested => {
                return Err(ConfigurationError::UnsupportedLoss {
                    loss: loss.name().to_string(),
                    recipe: requested,
                })
            }
        };
        if recipe == FactorRecipe::MonteCarlo && config.mc_samples == 0 {
            return Err(ConfigurationError::InvalidMonteCarloSamples);
        }
        Ok(HessianFactorProvider {
            loss,
            recipe,
            mc_samples: config.mc_samples,
            seed,
            _float: PhantomData,
        })
    }

    /// The recipe actually in use.
    pub fn recipe(&self) -> FactorRecipe {
        self.recipe
    }

    /// Factor columns of sample `sample` (unscaled by the batch reduction).
    ///
    /// A loss that claims the recipe but yields no factor is rejected as
    /// unsupported.
    pub fn factor(
        &self,
        output: &[F],
        target: &L::Target,
        sample: usize,
    ) -> Result<Vec<Vec<F>>, CurvatureError> {
        let columns = match self.recipe {
            FactorRecipe::Exact => self.loss.sqrt_hessian(output, target),
            FactorRecipe::MonteCarlo => {
                let mut rng = stream(self.seed, Stream::MonteCarlo(sample));
                self.loss
                    .sampled_sqrt_hessian(output, target, self.mc_samples, &mut rng)
            }
        };
        let columns = columns.ok_or_else(|| ConfigurationError::UnsupportedLoss {
            loss: self.loss.name().to_string(),
            recipe: self.recipe,
        })?;
        if columns.iter().flatten().any(|v| !v.is_finite()) {
            return Err(NumericalError::NonFinite {
                what: "loss Hessian factor",
            }
            .into());
        }
        Ok(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::{CrossEntropyLoss, MseLoss, Reduction};

    /// Loss with a Monte-Carlo recipe only.
    struct SampledOnly;

    impl Loss<f64> for SampledOnly {
        type Target = ();
        fn name(&self) -> &str {
            "SampledOnly"
        }
        fn reduction(&self) -> Reduction {
            Reduction::Mean
        }
        fn value(&self, output: &[f64], _: &()) -> f64 {
            output.iter().map(|x| x * x).sum()
        }
        fn gradient(&self, output: &[f64], _: &()) -> Vec<f64> {
            output.iter().map(|x| 2.0 * x).collect()
        }
        fn supports(&self, recipe: FactorRecipe) -> bool {
            recipe == FactorRecipe::MonteCarlo
        }
        fn sampled_sqrt_hessian(
            &self,
            output: &[f64],
            _: &(),
            samples: usize,
            rng: &mut dyn rand::RngCore,
        ) -> Option<Vec<Vec<f64>>> {
            let zeros = vec![0.0; output.len()];
            MseLoss::default().sampled_sqrt_hessian(output, &zeros, samples, rng)
        }
    }

    /// Loss with no factor recipe at all.
    struct Opaque;

    impl Loss<f64> for Opaque {
        type Target = ();
        fn name(&self) -> &str {
            "Opaque"
        }
        fn reduction(&self) -> Reduction {
            Reduction::Mean
        }
        fn value(&self, _: &[f64], _: &()) -> f64 {
            0.0
        }
        fn gradient(&self, output: &[f64], _: &()) -> Vec<f64> {
            vec![0.0; output.len()]
        }
    }

    /// Claims both recipes but never produces a factor.
    struct Hollow;

    impl Loss<f64> for Hollow {
        type Target = ();
        fn name(&self) -> &str {
            "Hollow"
        }
        fn reduction(&self) -> Reduction {
            Reduction::Mean
        }
        fn value(&self, _: &[f64], _: &()) -> f64 {
            0.0
        }
        fn gradient(&self, output: &[f64], _: &()) -> Vec<f64> {
            vec![0.0; output.len()]
        }
        fn supports(&self, _: FactorRecipe) -> bool {
            true
        }
    }

    #[test]
    fn claimed_recipe_without_factor_is_unsupported() {
        for (config, recipe) in [
            (FactorConfig::default(), FactorRecipe::Exact),
            (FactorConfig::monte_carlo(3), FactorRecipe::MonteCarlo),
        ] {
            let provider = HessianFactorProvider::<f64, _>::resolve(&Hollow, &config, 0).unwrap();
            assert_eq!(
                provider.factor(&[0.5, -0.5], &(), 0).unwrap_err(),
                CurvatureError::Configuration(ConfigurationError::UnsupportedLoss {
                    loss: "Hollow".into(),
                    recipe,
                })
            );
        }
    }

    #[test]
    fn exact_falls_back_to_monte_carlo() {
        let loss = SampledOnly;
        let provider =
            HessianFactorProvider::<f64, _>::resolve(&loss, &FactorConfig::default(), 0).unwrap();
        assert_eq!(provider.recipe(), FactorRecipe::MonteCarlo);
    }

    #[test]
    fn no_recipe_is_unsupported() {
        let loss = Opaque;
        let err = HessianFactorProvider::<f64, _>::resolve(&loss, &FactorConfig::default(), 0)
            .err()
            .unwrap();
        assert_eq!(
            err,
            ConfigurationError::UnsupportedLoss {
                loss: "Opaque".into(),
                recipe: FactorRecipe::Exact
            }
        );
    }

    #[test]
    fn zero_monte_carlo_samples_rejected() {
        let loss = MseLoss::default();
        let result =
            HessianFactorProvider::<f64, _>::resolve(&loss, &FactorConfig::monte_carlo(0), 0);
        assert!(matches!(
            result.err(),
            Some(ConfigurationError::InvalidMonteCarloSamples)
        ));
    }

    #[test]
    fn monte_carlo_draws_are_keyed_by_sample() {
        let loss = CrossEntropyLoss::default();
        let provider =
            HessianFactorProvider::<f64, _>::resolve(&loss, &FactorConfig::monte_carlo(8), 11)
                .unwrap();
        let logits = [0.2, -0.4, 1.0];
        let a = provider.factor(&logits, &1, 3).unwrap();
        let b = provider.factor(&logits, &1, 3).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn exact_factor_passes_through() {
        let loss = MseLoss::default();
        let provider =
            HessianFactorProvider::<f64, _>::resolve(&loss, &FactorConfig::default(), 0).unwrap();
        let cols = provider.factor(&[1.0, 2.0], &vec![0.0, 0.0], 0).unwrap();
        assert_eq!(cols.len(), 2);
        assert!((cols[1][1] - 2f64.sqrt()).abs() < 1e-15);
    }
}
