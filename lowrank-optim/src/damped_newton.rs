use lowrank::directional::newton_step;
use lowrank::{
    compute_curvature, evaluate_loss, BackwardHost, Batch, BlockCurvature, CurvatureConfig,
    CurvatureError, Eigenpair, Float, HostIntegrationError, Loss, Outputs, Parameters,
};

use crate::convergence::ConvergenceParams;
use crate::damping::Damping;
use crate::result::{BlockStatus, BlockStep, OptimResult, StepReport, TerminationReason};

/// Newton optimizer along the leading GGN eigendirections of every block,
/// damped per direction by a [`Damping`] policy.
///
/// Each step runs one curvature request with first- and second-order
/// directional derivatives and moves every block's parameters by
/// `lr · (-Σ_i γ_i / (λ_i + δ_i) u_i)`. Blocks whose curvature fails are left
/// unchanged and reported.
#[derive(Debug, Clone)]
pub struct DampedNewton<F, D> {
    damping: D,
    config: CurvatureConfig<F>,
}

impl<F: Float, D: Damping<F>> DampedNewton<F, D> {
    /// Optimizer over `config`'s parameter group and partition.
    ///
    /// The requested outputs are replaced by what the step needs. Without an
    /// explicit `top_k`, the two leading eigenvalues of each block are kept.
    pub fn new(damping: D, mut config: CurvatureConfig<F>) -> Self {
        config.outputs = Outputs {
            eigenvectors: true,
            first_order: true,
            second_order: true,
            newton_step: false,
        };
        if config.eigen.top_k.is_none() {
            config.eigen.top_k = Some(2);
        }
        DampedNewton { damping, config }
    }

    /// Keep the `k` leading directions per block.
    pub fn with_top_k(mut self, k: usize) -> Self {
        self.config.eigen.top_k = Some(k);
        self
    }

    pub fn config(&self) -> &CurvatureConfig<F> {
        &self.config
    }

    pub fn damping(&self) -> &D {
        &self.damping
    }

    /// Compute the damped Newton update of every block without applying it.
    pub fn compute_step<H, L>(
        &self,
        host: &mut H,
        loss: &L,
        batch: Batch<'_, F, L::Target>,
    ) -> Result<StepReport<F>, CurvatureError>
    where
        H: BackwardHost<F> + ?Sized,
        L: Loss<F> + ?Sized,
    {
        let result = compute_curvature(host, loss, batch, &self.config)?;
        let blocks = result
            .blocks
            .into_iter()
            .map(|report| {
                let status = match report.outcome {
                    Ok(curvature) => self.block_update(curvature),
                    Err(e) => BlockStatus::Failed(e),
                };
                BlockStep {
                    block: report.block,
                    status,
                }
            })
            .collect();
        Ok(StepReport {
            loss: result.loss,
            blocks,
        })
    }

    fn block_update(&self, curvature: BlockCurvature<F>) -> BlockStatus<F> {
        let (Some(vectors), Some(first), Some(second)) = (
            curvature.eigenvectors,
            curvature.first_order,
            curvature.second_order,
        ) else {
            // outputs are fixed in `new`
            unreachable!("directional derivatives were requested");
        };
        let directions: Vec<Eigenpair<F>> = curvature
            .eigenvalues
            .into_iter()
            .zip(vectors)
            .map(|(value, vector)| Eigenpair { value, vector })
            .collect();
        let dampings = self.damping.dampings(&first, &second);
        match newton_step(
            &directions,
            &first.value,
            &second.value,
            &dampings,
            &self.config.newton,
        ) {
            Ok(step) => BlockStatus::Applied {
                update: step.step,
                dampings,
                skipped: step.skipped,
            },
            Err(e) => BlockStatus::Failed(e.into()),
        }
    }

    /// Compute the damped Newton update and add `lr` times it to the host's
    /// parameters.
    pub fn step<H, L>(
        &self,
        host: &mut H,
        loss: &L,
        batch: Batch<'_, F, L::Target>,
        lr: F,
    ) -> Result<StepReport<F>, CurvatureError>
    where
        H: BackwardHost<F> + Parameters<F> + ?Sized,
        L: Loss<F> + ?Sized,
    {
        let report = self.compute_step(host, loss, batch)?;
        let writes: Vec<_> = report
            .blocks
            .iter()
            .filter_map(|block_step| match &block_step.status {
                BlockStatus::Applied { update, .. } => Some(block_step.block.split(update)),
                _ => None,
            })
            .flatten()
            .collect();
        // all or nothing: a missing tensor leaves every parameter untouched
        if let Some(&(id, _)) = writes.iter().find(|(id, _)| host.parameter(*id).is_none()) {
            return Err(HostIntegrationError::MissingParameter { param: id }.into());
        }
        for (id, segment) in writes {
            let param = host
                .parameter_mut(id)
                .ok_or(HostIntegrationError::MissingParameter { param: id })?;
            for (p, &u) in param.iter_mut().zip(segment) {
                *p = *p + lr * u;
            }
        }
        for (block, e) in report.failures() {
            tracing::warn!(block = block.index, error = %e, "block left unchanged");
        }
        tracing::debug!(
            loss = %report.loss,
            applied = report.applied(),
            update_norm = %report.update_norm(),
            "damped Newton step"
        );
        Ok(report)
    }
}

/// Repeat [`DampedNewton::step`] on one batch until a convergence criterion
/// holds.
pub fn damped_newton<F, H, L, D>(
    optimizer: &DampedNewton<F, D>,
    host: &mut H,
    loss: &L,
    batch: Batch<'_, F, L::Target>,
    lr: F,
    params: &ConvergenceParams<F>,
) -> OptimResult<F>
where
    F: Float,
    H: BackwardHost<F> + Parameters<F> + ?Sized,
    L: Loss<F> + ?Sized,
    D: Damping<F>,
{
    let initial = match evaluate_loss(host, loss, batch) {
        Ok(v) => v,
        Err(e) => {
            return OptimResult {
                initial_value: F::nan(),
                value: F::nan(),
                history: Vec::new(),
                iterations: 0,
                func_evals: 0,
                block_failures: 0,
                termination: TerminationReason::CurvatureFailed,
                error: Some(e),
            }
        }
    };
    let mut result = OptimResult {
        initial_value: initial,
        value: initial,
        history: Vec::new(),
        iterations: 0,
        func_evals: 1,
        block_failures: 0,
        termination: TerminationReason::MaxIterations,
        error: None,
    };

    for _ in 0..params.max_iter {
        let report = match optimizer.step(host, loss, batch, lr) {
            Ok(report) => report,
            Err(e) => {
                result.termination = TerminationReason::CurvatureFailed;
                result.error = Some(e);
                return result;
            }
        };
        result.func_evals += 1;
        result.block_failures += report.failures().count();
        if report.applied() == 0 {
            result.termination = TerminationReason::NoDirections;
            result.error = report.failures().next().map(|(_, e)| e.clone());
            return result;
        }

        let previous = result.value;
        let current = match evaluate_loss(host, loss, batch) {
            Ok(v) => v,
            Err(e) => {
                result.termination = TerminationReason::CurvatureFailed;
                result.error = Some(e);
                return result;
            }
        };
        result.func_evals += 1;
        result.iterations += 1;
        result.history.push(current);
        result.value = current;

        if !current.is_finite() {
            result.termination = TerminationReason::NumericalError;
            return result;
        }
        if params.step_converged(lr.abs() * report.update_norm()) {
            result.termination = TerminationReason::StepSize;
            return result;
        }
        if params.loss_converged(previous, current) {
            result.termination = TerminationReason::FunctionChange;
            return result;
        }
    }
    result
}
