//! Interface to the host backpropagation engine and scoped hook registration.
//!
//! The host owns the network and its backward pass. During one backward pass
//! it calls [`HookSlot::dispatch`] once for every parameterized layer, handing
//! over the layer's per-sample inputs, the factor columns and loss gradients
//! backpropagated to the layer output. An installed [`ExtractorTable`] turns
//! each visit into a [`LayerCapture`].
//!
//! Hooks are installed through a [`HookGuard`], which uninstalls them (and
//! drops every capture) when it goes out of scope, on success and failure
//! alike.

use std::collections::HashSet;

use crate::error::{ConfigurationError, CurvatureError, HostIntegrationError};
use crate::extractors::{ExtractorTable, LayerCapture};
use crate::layer::{LayerId, LayerInfo, ParamId};
use crate::Float;

/// Quantities the host seeds its backward pass with, per sample.
#[derive(Clone, Debug, Default)]
pub struct BackwardSeeds<F> {
    /// `∂ℓ_n/∂f_n` for every sample of the batch.
    pub gradients: Vec<Vec<F>>,
    /// Loss-Hessian factor columns per sample; empty for samples whose factor
    /// is not needed.
    pub factors: Vec<Vec<Vec<F>>>,
}

impl<F> BackwardSeeds<F> {
    pub fn num_samples(&self) -> usize {
        self.gradients.len()
    }
}

/// Everything the host exposes about one layer during the backward pass.
#[derive(Clone, Copy, Debug)]
pub struct LayerVisit<'a, F> {
    pub layer: LayerId,
    /// Layer input per sample (as seen in the forward pass).
    pub inputs: &'a [Vec<F>],
    /// Factor columns backpropagated to the layer output, per sample.
    pub backprop: &'a [Vec<Vec<F>>],
    /// Loss gradient backpropagated to the layer output, per sample.
    pub gradients: &'a [Vec<F>],
}

/// A backpropagation engine curvature can ride on.
pub trait BackwardHost<F: Float> {
    /// Parameterized layers in forward order.
    fn layers(&self) -> Vec<LayerInfo>;

    fn input_len(&self) -> usize;

    fn output_len(&self) -> usize;

    /// Evaluate the network on every sample and keep what the backward pass needs.
    fn forward(&mut self, inputs: &[Vec<F>]) -> Result<Vec<Vec<F>>, CurvatureError>;

    /// Run one backward pass from `seeds`, dispatching every parameterized
    /// layer to [`BackwardHost::hooks`] exactly once.
    fn run_backward(&mut self, seeds: &BackwardSeeds<F>) -> Result<(), CurvatureError>;

    /// The host's hook registration point.
    fn hooks(&mut self) -> &mut HookSlot<F>;
}

/// Read/write access to parameter tensors.
pub trait Parameters<F> {
    fn parameter(&self, id: ParamId) -> Option<&[F]>;
    fn parameter_mut(&mut self, id: ParamId) -> Option<&mut [F]>;
}

/// Hook registration point owned by a host.
///
/// Holds at most one installed extractor table and the captures of the
/// current backward pass.
pub struct HookSlot<F> {
    table: Option<ExtractorTable>,
    captures: Vec<LayerCapture<F>>,
    visited: HashSet<LayerId>,
    failure: Option<CurvatureError>,
}

impl<F> Default for HookSlot<F> {
    fn default() -> Self {
        HookSlot {
            table: None,
            captures: Vec::new(),
            visited: HashSet::new(),
            failure: None,
        }
    }
}

impl<F: Float> HookSlot<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_installed(&self) -> bool {
        self.table.is_some()
    }

    pub fn install(&mut self, table: ExtractorTable) -> Result<(), ConfigurationError> {
        if self.table.is_some() {
            return Err(ConfigurationError::HooksAlreadyRegistered);
        }
        self.table = Some(table);
        self.captures.clear();
        self.visited.clear();
        self.failure = None;
        Ok(())
    }

    /// Remove the table and drop every capture.
    pub fn uninstall(&mut self) {
        self.table = None;
        self.captures.clear();
        self.visited.clear();
        self.failure = None;
    }

    /// Called by the host for each parameterized layer. A no-op when nothing
    /// is installed.
    ///
    /// The first failure is also remembered so that a host which ignores the
    /// returned error still cannot produce a partial set of captures.
    pub fn dispatch(&mut self, visit: LayerVisit<'_, F>) -> Result<(), CurvatureError> {
        let Some(table) = &self.table else {
            return Ok(());
        };
        let result = if !self.visited.insert(visit.layer) {
            Err(HostIntegrationError::LayerVisitedTwice { layer: visit.layer }.into())
        } else {
            table.capture(visit).map(|capture| {
                tracing::trace!(layer = visit.layer.0, "captured layer");
                self.captures.push(capture);
            })
        };
        if let Err(e) = &result {
            self.failure.get_or_insert_with(|| e.clone());
        }
        result
    }

    /// Hand over the captures of a completed backward pass.
    ///
    /// Fails if any dispatch failed or a layer of the table was not visited.
    pub fn take_captures(&mut self) -> Result<Vec<LayerCapture<F>>, CurvatureError> {
        if let Some(e) = self.failure.take() {
            return Err(e);
        }
        let Some(table) = &self.table else {
            return Ok(Vec::new());
        };
        if let Some(layer) = table.layers().find(|l| !self.visited.contains(l)) {
            return Err(HostIntegrationError::LayerNotVisited { layer }.into());
        }
        self.visited.clear();
        Ok(std::mem::take(&mut self.captures))
    }
}

/// Extraction hooks installed on a host for the lifetime of the guard.
pub struct HookGuard<'h, F: Float, H: BackwardHost<F> + ?Sized> {
    host: &'h mut H,
    _float: std::marker::PhantomData<F>,
}

impl<'h, F: Float, H: BackwardHost<F> + ?Sized> HookGuard<'h, F, H> {
    /// Install `table` on `host`; fails if hooks are already installed.
    pub fn install(host: &'h mut H, table: ExtractorTable) -> Result<Self, ConfigurationError> {
        host.hooks().install(table)?;
        Ok(HookGuard {
            host,
            _float: std::marker::PhantomData,
        })
    }

    /// Run the host's backward pass and collect one capture per layer.
    pub fn backward(&mut self, seeds: &BackwardSeeds<F>) -> Result<Vec<LayerCapture<F>>, CurvatureError> {
        self.host.run_backward(seeds)?;
        self.host.hooks().take_captures()
    }
}

impl<F: Float, H: BackwardHost<F> + ?Sized> Drop for HookGuard<'_, F, H> {
    fn drop(&mut self) {
        self.host.hooks().uninstall();
    }
}
