pub mod api;
pub mod config;
pub mod directional;
pub mod error;
pub mod extractors;
pub mod factor;
pub mod float;
pub mod gram;
pub mod hessian_factor;
pub mod host;
pub mod layer;
pub mod linalg;
pub mod loss;
pub mod partition;
pub mod result;
pub mod sampling;
pub mod sequential;

#[cfg(feature = "nalgebra")]
pub mod nalgebra_support;

pub use api::{compute_curvature, compute_curvature_with, evaluate_loss, Batch};
pub use config::{CurvatureConfig, EigenConfig, NewtonStepConfig, Outputs};
pub use directional::{DirectionalDerivatives, NewtonStep};
pub use error::{ConfigurationError, CurvatureError, HostIntegrationError, NumericalError};
pub use float::Float;
pub use gram::Eigenpair;
pub use hessian_factor::FactorConfig;
pub use host::{BackwardHost, BackwardSeeds, HookSlot, LayerVisit, Parameters};
pub use layer::{LayerId, LayerInfo, LayerKind, ParamId, ParamSlot};
pub use linalg::{Jacobi, SymmetricEigen, SymmetricEigensolver};
pub use loss::{CrossEntropyLoss, FactorRecipe, Loss, MseLoss, Reduction};
pub use partition::{Block, BlockPartition};
pub use result::{BlockCurvature, BlockReport, CurvatureResult};
pub use sampling::{SampleSplit, Subsample};
pub use sequential::{Activation, Module, Sequential};

/// Curvature result over `f64`.
pub type CurvatureResult64 = CurvatureResult<f64>;
/// Curvature result over `f32`.
pub type CurvatureResult32 = CurvatureResult<f32>;
