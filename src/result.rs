use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::directional::{DirectionalDerivatives, NewtonStep};
use crate::error::CurvatureError;
use crate::loss::FactorRecipe;
use crate::partition::Block;
use crate::sampling::ResolvedSplit;

/// Curvature of one block.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BlockCurvature<F> {
    /// Kept eigenvalues, largest first.
    pub eigenvalues: Vec<F>,
    /// Unit eigenvectors in block coordinates, aligned with `eigenvalues`.
    pub eigenvectors: Option<Vec<Vec<F>>>,
    pub first_order: Option<DirectionalDerivatives<F>>,
    pub second_order: Option<DirectionalDerivatives<F>>,
    pub newton_step: Option<NewtonStep<F>>,
    /// `‖VVᵀu - λu‖ / max(1, |λ|)` per eigenpair, when requested.
    pub residuals: Option<Vec<F>>,
    /// Dimension of the Gram matrix.
    pub rank: usize,
    /// Eigenvalues dropped as numerically zero.
    pub dropped: usize,
}

/// Outcome of one block; failures in one block leave the others intact.
#[derive(Clone, Debug)]
pub struct BlockReport<F> {
    pub block: Block,
    pub outcome: Result<BlockCurvature<F>, CurvatureError>,
}

/// Result of a curvature request.
#[derive(Clone, Debug)]
pub struct CurvatureResult<F> {
    pub blocks: Vec<BlockReport<F>>,
    /// Loss over the whole batch.
    pub loss: F,
    pub batch_size: usize,
    /// Square-root Hessian recipe actually used.
    pub recipe: FactorRecipe,
    /// Samples used for directions, first- and second-order derivatives.
    pub split: ResolvedSplit,
}

impl<F> CurvatureResult<F> {
    /// Successful blocks with their curvature.
    pub fn successful(&self) -> impl Iterator<Item = (&Block, &BlockCurvature<F>)> + '_ {
        self.blocks
            .iter()
            .filter_map(|r| r.outcome.as_ref().ok().map(|c| (&r.block, c)))
    }

    /// Failed blocks with their error.
    pub fn failures(&self) -> impl Iterator<Item = (&Block, &CurvatureError)> + '_ {
        self.blocks
            .iter()
            .filter_map(|r| r.outcome.as_ref().err().map(|e| (&r.block, e)))
    }

    /// Curvature of block `index`.
    pub fn block(&self, index: usize) -> Option<&Result<BlockCurvature<F>, CurvatureError>> {
        self.blocks.get(index).map(|r| &r.outcome)
    }
}

impl<F: fmt::Display> fmt::Display for CurvatureResult<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "loss {} over {} samples ({} factor)",
            self.loss, self.batch_size, self.recipe
        )?;
        for report in &self.blocks {
            match &report.outcome {
                Ok(c) => {
                    write!(f, "  block {}: rank {}, eigenvalues [", report.block.index, c.rank)?;
                    for (i, v) in c.eigenvalues.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{v}")?;
                    }
                    writeln!(f, "]")?;
                }
                Err(e) => writeln!(f, "  block {}: {e}", report.block.index)?,
            }
        }
        Ok(())
    }
}
