//! Per-layer parameter Jacobians, captured during the backward pass.
//!
//! For every sample `n` a supported layer exposes the Jacobian `J_n` of its
//! output with respect to one of its parameter tensors as an implicit
//! operator: `jvp` applies `J_n`, `vjp` applies `J_nᵀ`, and `kernel`
//! evaluates `xᵀ J_n J_mᵀ y` directly from layer inputs, which is what makes
//! Gram matrices cheap to assemble.
//!
//! The set of supported layer kinds is closed. Anything else is rejected when
//! the [`ExtractorTable`] is built, before any pass over the data.

mod affine;
mod conv1d;
mod linear;

pub use affine::ScaleJacobian;
pub use conv1d::{Conv1dBiasJacobian, Conv1dGeometry, Conv1dWeightJacobian};
pub use linear::{BiasJacobian, LinearWeightJacobian};

use crate::error::{ConfigurationError, CurvatureError, HostIntegrationError};
use crate::host::LayerVisit;
use crate::layer::{LayerId, LayerInfo, LayerKind, ParamId, ParamSlot};
use crate::linalg::dot;
use crate::Float;

/// Implicit per-sample Jacobian of a layer output w.r.t. one parameter tensor.
pub trait ParamJacobian<F: Float>: Send + Sync {
    /// Number of parameter entries.
    fn param_len(&self) -> usize;

    /// Dimension of the layer output.
    fn output_len(&self) -> usize;

    fn num_samples(&self) -> usize;

    /// `J_n θ`.
    fn jvp(&self, sample: usize, theta: &[F]) -> Vec<F>;

    /// `J_nᵀ v`.
    fn vjp(&self, sample: usize, v: &[F]) -> Vec<F>;

    /// `xᵀ J_n J_mᵀ y`.
    fn kernel(&self, n: usize, m: usize, x: &[F], y: &[F]) -> F {
        dot(&self.vjp(n, x), &self.vjp(m, y))
    }

    /// `kernel(n, m, xs[i], ys[j])` for all column pairs.
    ///
    /// Implementations override this to share the sample-pair work across
    /// columns.
    fn kernel_block(&self, n: usize, m: usize, xs: &[Vec<F>], ys: &[Vec<F>]) -> Vec<Vec<F>> {
        xs.iter()
            .map(|x| ys.iter().map(|y| self.kernel(n, m, x, y)).collect())
            .collect()
    }
}

/// Extraction recipe for one supported layer kind.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Extractor {
    Linear {
        out_features: usize,
        bias: bool,
    },
    ElementwiseAffine {
        features: usize,
        shift: bool,
    },
    Conv1d {
        geometry: Conv1dGeometry,
        bias: bool,
    },
}

impl Extractor {
    fn for_layer(info: &LayerInfo) -> Result<Self, ConfigurationError> {
        let unsupported = || ConfigurationError::UnsupportedLayer {
            layer: info.id,
            kind: info.kind.name().to_string(),
        };
        match info.kind {
            LayerKind::Linear {
                out_features, bias, ..
            } => Ok(Extractor::Linear { out_features, bias }),
            LayerKind::ElementwiseAffine { features, shift } => {
                Ok(Extractor::ElementwiseAffine { features, shift })
            }
            LayerKind::Conv1d {
                in_channels,
                out_channels,
                kernel_size,
                stride,
                input_len,
                bias,
            } => {
                let positions = info.kind.conv_positions().ok_or_else(unsupported)?;
                Ok(Extractor::Conv1d {
                    geometry: Conv1dGeometry {
                        in_channels,
                        out_channels,
                        kernel_size,
                        stride,
                        input_len,
                        positions,
                    },
                    bias,
                })
            }
            LayerKind::Opaque { .. } => Err(unsupported()),
        }
    }

    fn jacobians<F: Float>(
        &self,
        layer: LayerId,
        inputs: &[Vec<F>],
    ) -> Vec<(ParamId, Box<dyn ParamJacobian<F>>)> {
        let id = |slot| ParamId { layer, slot };
        let samples = inputs.len();
        let mut out: Vec<(ParamId, Box<dyn ParamJacobian<F>>)> = Vec::with_capacity(2);
        match *self {
            Extractor::Linear { out_features, bias } => {
                out.push((
                    id(ParamSlot::Weight),
                    Box::new(LinearWeightJacobian::new(inputs.to_vec(), out_features)),
                ));
                if bias {
                    out.push((
                        id(ParamSlot::Bias),
                        Box::new(BiasJacobian::new(out_features, samples)),
                    ));
                }
            }
            Extractor::ElementwiseAffine { features, shift } => {
                out.push((
                    id(ParamSlot::Weight),
                    Box::new(ScaleJacobian::new(inputs.to_vec())),
                ));
                if shift {
                    out.push((
                        id(ParamSlot::Bias),
                        Box::new(BiasJacobian::new(features, samples)),
                    ));
                }
            }
            Extractor::Conv1d { geometry, bias } => {
                out.push((
                    id(ParamSlot::Weight),
                    Box::new(Conv1dWeightJacobian::new(inputs.to_vec(), geometry)),
                ));
                if bias {
                    out.push((
                        id(ParamSlot::Bias),
                        Box::new(Conv1dBiasJacobian::new(geometry, samples)),
                    ));
                }
            }
        }
        out
    }
}

/// Extractors for every parameterized layer of a host, keyed by layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractorTable {
    entries: Vec<(LayerInfo, Extractor)>,
}

impl ExtractorTable {
    /// Build extractors for `layers`, failing on the first unsupported kind.
    pub fn for_layers(layers: &[LayerInfo]) -> Result<Self, ConfigurationError> {
        let entries = layers
            .iter()
            .map(|info| Extractor::for_layer(info).map(|e| (info.clone(), e)))
            .collect::<Result<_, _>>()?;
        Ok(ExtractorTable { entries })
    }

    pub fn layers(&self) -> impl Iterator<Item = LayerId> + '_ {
        self.entries.iter().map(|(info, _)| info.id)
    }

    /// Turn one layer visit into a capture, validating every shape.
    pub fn capture<F: Float>(&self, visit: LayerVisit<'_, F>) -> Result<LayerCapture<F>, CurvatureError> {
        let (info, extractor) = self
            .entries
            .iter()
            .find(|(info, _)| info.id == visit.layer)
            .ok_or(HostIntegrationError::UnexpectedLayer { layer: visit.layer })?;

        let mismatch = |what, expected, found| HostIntegrationError::ShapeMismatch {
            layer: info.id,
            what,
            expected,
            found,
        };
        let samples = visit.inputs.len();
        if visit.backprop.len() != samples {
            return Err(mismatch("per-sample factor columns", samples, visit.backprop.len()).into());
        }
        if visit.gradients.len() != samples {
            return Err(mismatch("per-sample gradients", samples, visit.gradients.len()).into());
        }
        if let Some(x) = visit.inputs.iter().find(|x| x.len() != info.input_len) {
            return Err(mismatch("layer input", info.input_len, x.len()).into());
        }
        if let Some(g) = visit.gradients.iter().find(|g| g.len() != info.output_len) {
            return Err(mismatch("output gradient", info.output_len, g.len()).into());
        }
        if let Some(c) = visit
            .backprop
            .iter()
            .flatten()
            .find(|c| c.len() != info.output_len)
        {
            return Err(mismatch("backpropagated factor column", info.output_len, c.len()).into());
        }

        Ok(LayerCapture {
            layer: info.id,
            jacobians: extractor.jacobians(info.id, visit.inputs),
            backprop: visit.backprop.to_vec(),
            gradients: visit.gradients.to_vec(),
        })
    }
}

/// What extraction keeps from one layer visit.
pub struct LayerCapture<F> {
    pub layer: LayerId,
    pub jacobians: Vec<(ParamId, Box<dyn ParamJacobian<F>>)>,
    /// Factor columns at the layer output, per sample.
    pub backprop: Vec<Vec<Vec<F>>>,
    /// Loss gradient at the layer output, per sample.
    pub gradients: Vec<Vec<F>>,
}

impl<F> std::fmt::Debug for LayerCapture<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerCapture")
            .field("layer", &self.layer)
            .field(
                "params",
                &self.jacobians.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            )
            .field("samples", &self.gradients.len())
            .finish()
    }
}
