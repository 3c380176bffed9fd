//! Error taxonomy for curvature requests.
//!
//! Configuration errors are raised before the backward pass starts. Numerical
//! errors are local to one block and can be recovered from by adjusting
//! damping or thresholds. Host integration errors signal that the host's
//! backward pass disagrees with the layers it reported.

use thiserror::Error;

use crate::layer::{LayerId, ParamId};
use crate::loss::FactorRecipe;

/// Top-level error of a curvature request.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum CurvatureError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("numerical error: {0}")]
    Numerical(#[from] NumericalError),
    #[error("host integration error: {0}")]
    HostIntegration(#[from] HostIntegrationError),
}

impl CurvatureError {
    /// True if the caller can retry with different damping or thresholds.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CurvatureError::Numerical(_))
    }
}

/// Invalid request: detected before any backward pass runs.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("{layer} has unsupported type `{kind}`")]
    UnsupportedLayer { layer: LayerId, kind: String },
    #[error("loss `{loss}` has no {recipe} square-root Hessian")]
    UnsupportedLoss { loss: String, recipe: FactorRecipe },
    #[error("parameter group is empty")]
    EmptyParameterGroup,
    #[error("{param} is not a parameter of the host network")]
    UnknownParameter { param: ParamId },
    #[error("{param} appears more than once")]
    DuplicateParameter { param: ParamId },
    #[error("{param} is not assigned to any block")]
    UncoveredParameter { param: ParamId },
    #[error("block {block} has no parameters")]
    EmptyBlock { block: usize },
    #[error("cannot select {requested} samples from a batch of {available}")]
    InvalidSubsample { requested: usize, available: usize },
    #[error("sample index {index} is out of range for a batch of {available}")]
    SampleOutOfRange { index: usize, available: usize },
    #[error("batch is empty")]
    EmptyBatch,
    #[error("batch has {inputs} inputs but {targets} targets")]
    BatchMismatch { inputs: usize, targets: usize },
    #[error("sample {sample} has input length {found}, network expects {expected}")]
    InputShape {
        sample: usize,
        expected: usize,
        found: usize,
    },
    #[error("target of sample {sample} does not fit loss `{loss}` on {outputs} outputs")]
    TargetShape {
        sample: usize,
        loss: String,
        outputs: usize,
    },
    #[error("number of Monte-Carlo samples must be positive")]
    InvalidMonteCarloSamples,
    #[error("extraction hooks are already registered on this host")]
    HooksAlreadyRegistered,
}

/// Numerically unusable curvature in one block.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum NumericalError {
    #[error("damped curvature {curvature:e} along direction {direction} is below the zero threshold")]
    ZeroCurvature { direction: usize, curvature: f64 },
    #[error("damped curvature {curvature:e} along direction {direction} is not positive")]
    NonPositiveCurvature { direction: usize, curvature: f64 },
    #[error("symmetric eigensolver did not converge within {sweeps} sweeps")]
    EigensolverDidNotConverge { sweeps: usize },
    #[error("non-finite value in {what}")]
    NonFinite { what: &'static str },
    #[error("no eigenvalue above the zero threshold")]
    NoCurvatureDirections,
}

/// The host's backward pass does not match the layers it reported.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum HostIntegrationError {
    #[error("backward pass did not visit {layer}")]
    LayerNotVisited { layer: LayerId },
    #[error("backward pass visited {layer} more than once")]
    LayerVisitedTwice { layer: LayerId },
    #[error("backward pass visited {layer}, which has no registered extractor")]
    UnexpectedLayer { layer: LayerId },
    #[error("{layer}: {what} has length {found}, expected {expected}")]
    ShapeMismatch {
        layer: LayerId,
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("network output for sample {sample} has length {found}, expected {expected}")]
    OutputShape {
        sample: usize,
        expected: usize,
        found: usize,
    },
    #[error("host returned {found} outputs for {expected} samples")]
    OutputCount { expected: usize, found: usize },
    #[error("backward pass requested before a forward pass over {samples} samples")]
    MissingForward { samples: usize },
    #[error("{param} was not captured by the backward pass")]
    MissingParameter { param: ParamId },
}
