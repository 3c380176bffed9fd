pub mod convergence;
pub mod damped_newton;
pub mod damping;
pub mod result;

pub use convergence::ConvergenceParams;
pub use damped_newton::{damped_newton, DampedNewton};
pub use damping::{BootstrapDamping, ConstantDamping, Damping};
pub use result::{BlockStatus, BlockStep, OptimResult, StepReport, TerminationReason};
