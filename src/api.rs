use crate::config::CurvatureConfig;
use crate::directional::{first_order, newton_step, second_order};
use crate::error::{ConfigurationError, CurvatureError, HostIntegrationError, NumericalError};
use crate::extractors::ExtractorTable;
use crate::factor::{CaptureIndex, LowRankFactor};
use crate::float::Float;
use crate::gram::{gram_eigen, residual};
use crate::hessian_factor::HessianFactorProvider;
use crate::host::{BackwardHost, BackwardSeeds, HookGuard};
use crate::linalg::{Jacobi, SymmetricEigensolver};
use crate::loss::{Loss, Reduction};
use crate::partition::{Block, ParameterGroup};
use crate::result::{BlockCurvature, BlockReport, CurvatureResult};
use crate::sampling::ResolvedSplit;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Inputs and targets of one mini-batch.
#[derive(Debug)]
pub struct Batch<'a, F, T> {
    pub inputs: &'a [Vec<F>],
    pub targets: &'a [T],
}

// manual impls: `T` need not be `Clone`
impl<F, T> Clone for Batch<'_, F, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<F, T> Copy for Batch<'_, F, T> {}

impl<'a, F, T> Batch<'a, F, T> {
    pub fn new(inputs: &'a [Vec<F>], targets: &'a [T]) -> Result<Self, ConfigurationError> {
        if inputs.is_empty() {
            return Err(ConfigurationError::EmptyBatch);
        }
        if inputs.len() != targets.len() {
            return Err(ConfigurationError::BatchMismatch {
                inputs: inputs.len(),
                targets: targets.len(),
            });
        }
        Ok(Batch { inputs, targets })
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Compute GGN curvature of `loss` on `batch` with the built-in Jacobi solver.
///
/// Runs one forward and one backward pass on `host`. Configuration errors are
/// reported before the forward pass. Under a block-diagonal partition a
/// failing block is reported in its [`BlockReport`] and the other blocks are
/// still computed; with [`BlockPartition::Global`](crate::BlockPartition::Global)
/// any failure is returned as the error of the whole request.
///
/// ```
/// use lowrank::{compute_curvature, Batch, CurvatureConfig, MseLoss, Sequential};
///
/// let mut net = Sequential::<f64>::mlp(&[2, 3, 1], true, 7);
/// let inputs = vec![vec![0.5, -1.0], vec![1.5, 0.2], vec![-0.3, 0.8]];
/// let targets = vec![vec![1.0], vec![0.0], vec![0.5]];
/// let batch = Batch::new(&inputs, &targets).unwrap();
///
/// let result = compute_curvature(&mut net, &MseLoss::default(), batch, &CurvatureConfig::default())
///     .unwrap();
/// let (_, global) = result.successful().next().unwrap();
/// assert!(global.eigenvalues.windows(2).all(|w| w[0] >= w[1]));
/// ```
pub fn compute_curvature<F, H, L>(
    host: &mut H,
    loss: &L,
    batch: Batch<'_, F, L::Target>,
    config: &CurvatureConfig<F>,
) -> Result<CurvatureResult<F>, CurvatureError>
where
    F: Float,
    H: BackwardHost<F> + ?Sized,
    L: Loss<F> + ?Sized,
{
    compute_curvature_with(host, loss, batch, config, &Jacobi::default())
}

/// [`compute_curvature`] with a caller-supplied symmetric eigensolver.
pub fn compute_curvature_with<F, H, L>(
    host: &mut H,
    loss: &L,
    batch: Batch<'_, F, L::Target>,
    config: &CurvatureConfig<F>,
    solver: &dyn SymmetricEigensolver<F>,
) -> Result<CurvatureResult<F>, CurvatureError>
where
    F: Float,
    H: BackwardHost<F> + ?Sized,
    L: Loss<F> + ?Sized,
{
    // Everything that can be rejected up front is rejected here.
    let layers = host.layers();
    let table = ExtractorTable::for_layers(&layers)?;
    let group = ParameterGroup::resolve(&layers, config.params.as_deref())?;
    let blocks = config.partition.resolve(&group)?;
    let provider = HessianFactorProvider::resolve(loss, &config.factor, config.seed)?;
    let batch_size = batch.len();
    let split = config.samples.resolve(batch_size, config.seed)?;
    check_inputs(batch, host.input_len())?;
    check_targets(loss, batch, host.output_len())?;
    if host.hooks().is_installed() {
        return Err(ConfigurationError::HooksAlreadyRegistered.into());
    }
    tracing::debug!(
        batch_size,
        blocks = blocks.len(),
        dim = group.dim(),
        recipe = %provider.recipe(),
        "curvature request"
    );

    let outputs = forward_checked(host, batch)?;
    let values: Vec<F> = outputs
        .iter()
        .zip(batch.targets)
        .map(|(f, y)| loss.value(f, y))
        .collect();
    let reduction = loss.reduction();
    let loss_value = reduction.aggregate(&values, batch_size);

    let mut seeds = BackwardSeeds {
        gradients: outputs
            .iter()
            .zip(batch.targets)
            .map(|(f, y)| loss.gradient(f, y))
            .collect(),
        factors: vec![Vec::new(); batch_size],
    };
    for n in split.factor_samples() {
        seeds.factors[n] = provider.factor(&outputs[n], &batch.targets[n], n)?;
    }

    let captures = {
        let mut guard = HookGuard::<F, H>::install(host, table)?;
        guard.backward(&seeds)?
    };
    let index = CaptureIndex::new(&captures);

    let job = |block: &Block| BlockReport {
        block: block.clone(),
        outcome: compute_block(block, &index, &split, reduction, solver, config),
    };
    #[cfg(feature = "parallel")]
    let reports: Vec<BlockReport<F>> = blocks.par_iter().map(job).collect();
    #[cfg(not(feature = "parallel"))]
    let reports: Vec<BlockReport<F>> = blocks.iter().map(job).collect();

    for report in &reports {
        if let Err(e) = &report.outcome {
            if config.partition.is_global() {
                return Err(e.clone());
            }
            tracing::warn!(block = report.block.index, error = %e, "block failed");
        }
    }

    Ok(CurvatureResult {
        blocks: reports,
        loss: loss_value,
        batch_size,
        recipe: provider.recipe(),
        split,
    })
}

/// Reduced loss of `batch` under the host's current parameters.
pub fn evaluate_loss<F, H, L>(
    host: &mut H,
    loss: &L,
    batch: Batch<'_, F, L::Target>,
) -> Result<F, CurvatureError>
where
    F: Float,
    H: BackwardHost<F> + ?Sized,
    L: Loss<F> + ?Sized,
{
    check_inputs(batch, host.input_len())?;
    check_targets(loss, batch, host.output_len())?;
    let outputs = forward_checked(host, batch)?;
    let values: Vec<F> = outputs
        .iter()
        .zip(batch.targets)
        .map(|(f, y)| loss.value(f, y))
        .collect();
    Ok(loss.reduction().aggregate(&values, batch.len()))
}

fn check_inputs<F, T>(batch: Batch<'_, F, T>, input_len: usize) -> Result<(), ConfigurationError> {
    match batch
        .inputs
        .iter()
        .enumerate()
        .find(|(_, x)| x.len() != input_len)
    {
        Some((sample, x)) => Err(ConfigurationError::InputShape {
            sample,
            expected: input_len,
            found: x.len(),
        }),
        None => Ok(()),
    }
}

fn check_targets<F, L>(
    loss: &L,
    batch: Batch<'_, F, L::Target>,
    output_len: usize,
) -> Result<(), ConfigurationError>
where
    F: Float,
    L: Loss<F> + ?Sized,
{
    match batch
        .targets
        .iter()
        .position(|y| !loss.accepts_target(output_len, y))
    {
        Some(sample) => Err(ConfigurationError::TargetShape {
            sample,
            loss: loss.name().to_string(),
            outputs: output_len,
        }),
        None => Ok(()),
    }
}

fn forward_checked<F, H, T>(
    host: &mut H,
    batch: Batch<'_, F, T>,
) -> Result<Vec<Vec<F>>, CurvatureError>
where
    F: Float,
    H: BackwardHost<F> + ?Sized,
{
    let outputs = host.forward(batch.inputs)?;
    let expected = host.output_len();
    if outputs.len() != batch.len() {
        return Err(HostIntegrationError::OutputCount {
            expected: batch.len(),
            found: outputs.len(),
        }
        .into());
    }
    if let Some((sample, f)) = outputs.iter().enumerate().find(|(_, f)| f.len() != expected) {
        return Err(HostIntegrationError::OutputShape {
            sample,
            expected,
            found: f.len(),
        }
        .into());
    }
    if outputs.iter().flatten().any(|v| !v.is_finite()) {
        return Err(NumericalError::NonFinite {
            what: "network output",
        }
        .into());
    }
    Ok(outputs)
}

fn compute_block<F: Float>(
    block: &Block,
    index: &CaptureIndex<'_, F>,
    split: &ResolvedSplit,
    reduction: Reduction,
    solver: &dyn SymmetricEigensolver<F>,
    config: &CurvatureConfig<F>,
) -> Result<BlockCurvature<F>, CurvatureError> {
    let batch_size = split.batch_size;
    let jacobian = index.block(block)?;
    let weight: F = reduction.weight(split.directions.len(), batch_size);
    let factor = LowRankFactor::new(&jacobian, &split.directions, weight.sqrt())?;
    let eig = gram_eigen(&factor, solver, &config.eigen)?;
    tracing::debug!(
        block = block.index,
        rank = eig.rank,
        kept = eig.len(),
        dropped = eig.dropped,
        "block eigendecomposition"
    );

    let outputs = &config.outputs;
    let mut curvature = BlockCurvature {
        eigenvalues: eig.values.clone(),
        eigenvectors: None,
        first_order: None,
        second_order: None,
        newton_step: None,
        residuals: None,
        rank: eig.rank,
        dropped: eig.dropped,
    };
    if !outputs.needs_vectors() && !config.eigen.check_residuals {
        return Ok(curvature);
    }

    let pairs = eig.transfer(&factor, config.eigen.normalize);
    if config.eigen.check_residuals {
        curvature.residuals = Some(pairs.iter().map(|p| residual(&factor, p)).collect());
    }
    if outputs.first_order || outputs.newton_step {
        curvature.first_order = Some(first_order(
            &jacobian,
            &pairs,
            &split.first_order,
            reduction,
            batch_size,
        ));
    }
    if outputs.second_order || outputs.newton_step {
        curvature.second_order = Some(second_order(
            &jacobian,
            &pairs,
            &split.second_order,
            reduction,
            batch_size,
        ));
    }
    if outputs.newton_step {
        if let (Some(first), Some(second)) = (&curvature.first_order, &curvature.second_order) {
            let dampings = vec![config.newton.damping; pairs.len()];
            curvature.newton_step = Some(newton_step(
                &pairs,
                &first.value,
                &second.value,
                &dampings,
                &config.newton,
            )?);
        }
    }
    if outputs.eigenvectors {
        curvature.eigenvectors = Some(pairs.into_iter().map(|p| p.vector).collect());
    }
    if !outputs.first_order {
        curvature.first_order = None;
    }
    if !outputs.second_order {
        curvature.second_order = None;
    }
    Ok(curvature)
}
