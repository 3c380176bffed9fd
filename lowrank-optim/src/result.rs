use std::fmt;

use lowrank::linalg::norm;
use lowrank::{Block, CurvatureError, Float};

/// What happened to one block in a step.
#[derive(Debug, Clone)]
pub enum BlockStatus<F> {
    /// The damped Newton update was computed (and applied by
    /// [`DampedNewton::step`](crate::DampedNewton::step)).
    Applied {
        /// Update in block coordinates, before the learning rate.
        update: Vec<F>,
        /// Damping used along each direction.
        dampings: Vec<F>,
        /// Directions left out because their damped curvature was not positive.
        skipped: Vec<usize>,
    },
    /// Curvature or step assembly failed; the block's parameters are unchanged.
    Failed(CurvatureError),
}

/// Per-block outcome of one optimizer step.
#[derive(Debug, Clone)]
pub struct BlockStep<F> {
    pub block: Block,
    pub status: BlockStatus<F>,
}

/// Outcome of one optimizer step.
#[derive(Debug, Clone)]
pub struct StepReport<F> {
    /// Loss at the parameters the step was computed at.
    pub loss: F,
    pub blocks: Vec<BlockStep<F>>,
}

impl<F: Float> StepReport<F> {
    /// Number of blocks whose update was computed.
    pub fn applied(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| matches!(b.status, BlockStatus::Applied { .. }))
            .count()
    }

    /// Blocks that failed, with their error.
    pub fn failures(&self) -> impl Iterator<Item = (&Block, &CurvatureError)> + '_ {
        self.blocks.iter().filter_map(|b| match &b.status {
            BlockStatus::Failed(e) => Some((&b.block, e)),
            BlockStatus::Applied { .. } => None,
        })
    }

    /// Euclidean norm of the combined update, before the learning rate.
    pub fn update_norm(&self) -> F {
        self.blocks
            .iter()
            .filter_map(|b| match &b.status {
                BlockStatus::Applied { update, .. } => Some(norm(update)),
                BlockStatus::Failed(_) => None,
            })
            .fold(F::zero(), |acc, n| acc + n * n)
            .sqrt()
    }
}

/// Result of a [`damped_newton`](crate::damped_newton) run.
///
/// The optimized parameters live in the host.
#[derive(Debug, Clone)]
pub struct OptimResult<F> {
    /// Loss before the first step.
    pub initial_value: F,
    /// Loss at the final parameters.
    pub value: F,
    /// Loss after every step.
    pub history: Vec<F>,
    /// Number of steps applied.
    pub iterations: usize,
    /// Total number of forward passes (curvature requests and loss evaluations).
    pub func_evals: usize,
    /// Block failures summed over all steps.
    pub block_failures: usize,
    /// Reason for termination.
    pub termination: TerminationReason,
    /// The error that ended the run, if any.
    pub error: Option<CurvatureError>,
}

/// Why the optimizer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Step size fell below tolerance.
    StepSize,
    /// Change in loss fell below tolerance.
    FunctionChange,
    /// Reached the maximum number of iterations.
    MaxIterations,
    /// No block produced an update.
    NoDirections,
    /// A request failed as a whole (configuration or host error, or a
    /// numerical error under a global partition).
    CurvatureFailed,
    /// The loss became non-finite.
    NumericalError,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::StepSize => write!(f, "step size below tolerance"),
            TerminationReason::FunctionChange => write!(f, "loss change below tolerance"),
            TerminationReason::MaxIterations => write!(f, "maximum iterations reached"),
            TerminationReason::NoDirections => write!(f, "no block produced an update"),
            TerminationReason::CurvatureFailed => write!(f, "curvature request failed"),
            TerminationReason::NumericalError => write!(f, "numerical error"),
        }
    }
}
