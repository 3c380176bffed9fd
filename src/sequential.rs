//! A small feed-forward host network with its own backward pass.
//!
//! `Sequential` is the reference [`BackwardHost`]: it caches layer inputs in
//! the forward pass and, in the backward pass, pushes the loss gradient and
//! every loss-Hessian factor column through the network in reverse order,
//! dispatching each parameterized module to the installed hooks.

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::error::{ConfigurationError, CurvatureError, HostIntegrationError};
use crate::host::{BackwardHost, BackwardSeeds, HookSlot, LayerVisit, Parameters};
use crate::layer::{LayerId, LayerInfo, LayerKind, ParamId, ParamInfo, ParamSlot};
use crate::linalg::dot;
use crate::sampling::{stream, Stream};
use crate::Float;

/// Elementwise nonlinearity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    ReLU,
    Sigmoid,
    Tanh,
}

impl Activation {
    fn apply<F: Float>(self, x: F) -> F {
        match self {
            Activation::ReLU => x.max(F::zero()),
            Activation::Sigmoid => F::one() / (F::one() + (-x).exp()),
            Activation::Tanh => x.tanh(),
        }
    }

    fn derivative<F: Float>(self, x: F) -> F {
        match self {
            Activation::ReLU => {
                if x > F::zero() {
                    F::one()
                } else {
                    F::zero()
                }
            }
            Activation::Sigmoid => {
                let s = self.apply(x);
                s * (F::one() - s)
            }
            Activation::Tanh => {
                let t = x.tanh();
                F::one() - t * t
            }
        }
    }
}

/// One stage of a [`Sequential`] network.
#[derive(Clone, Debug, PartialEq)]
pub enum Module<F> {
    Linear {
        in_features: usize,
        out_features: usize,
        /// Row-major `out × in`.
        weight: Vec<F>,
        bias: Option<Vec<F>>,
    },
    ElementwiseAffine {
        scale: Vec<F>,
        shift: Option<Vec<F>>,
    },
    Conv1d {
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        input_len: usize,
        /// Row-major `out × in × kernel_size`.
        weight: Vec<F>,
        bias: Option<Vec<F>>,
    },
    Activation(Activation),
    /// A parameterized layer without curvature support. Acts as identity.
    Opaque { name: String, weight: Vec<F> },
}

impl<F: Float> Module<F> {
    /// Linear layer with weights and bias drawn from `U(-1/√in, 1/√in)`.
    pub fn linear(in_features: usize, out_features: usize, bias: bool, rng: &mut ChaCha8Rng) -> Self {
        let bound = 1.0 / (in_features.max(1) as f64).sqrt();
        let mut draw = |n: usize| -> Vec<F> {
            (0..n)
                .map(|_| F::lit(rng.gen_range(-bound..bound)))
                .collect()
        };
        let weight = draw(in_features * out_features);
        let bias = bias.then(|| draw(out_features));
        Module::Linear {
            in_features,
            out_features,
            weight,
            bias,
        }
    }

    /// Elementwise affine layer initialized to the identity.
    pub fn affine(features: usize, shift: bool) -> Self {
        Module::ElementwiseAffine {
            scale: vec![F::one(); features],
            shift: shift.then(|| vec![F::zero(); features]),
        }
    }

    /// Convolution with weights and bias drawn from `U(-1/√(C·K), 1/√(C·K))`.
    pub fn conv1d(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        input_len: usize,
        bias: bool,
        rng: &mut ChaCha8Rng,
    ) -> Self {
        let bound = 1.0 / ((in_channels * kernel_size).max(1) as f64).sqrt();
        let mut draw = |n: usize| -> Vec<F> {
            (0..n)
                .map(|_| F::lit(rng.gen_range(-bound..bound)))
                .collect()
        };
        let weight = draw(out_channels * in_channels * kernel_size);
        let bias = bias.then(|| draw(out_channels));
        Module::Conv1d {
            in_channels,
            out_channels,
            kernel_size,
            stride,
            input_len,
            weight,
            bias,
        }
    }

    fn kind(&self) -> Option<LayerKind> {
        match self {
            Module::Linear {
                in_features,
                out_features,
                bias,
                ..
            } => Some(LayerKind::Linear {
                in_features: *in_features,
                out_features: *out_features,
                bias: bias.is_some(),
            }),
            Module::ElementwiseAffine { scale, shift } => Some(LayerKind::ElementwiseAffine {
                features: scale.len(),
                shift: shift.is_some(),
            }),
            Module::Conv1d {
                in_channels,
                out_channels,
                kernel_size,
                stride,
                input_len,
                bias,
                ..
            } => Some(LayerKind::Conv1d {
                in_channels: *in_channels,
                out_channels: *out_channels,
                kernel_size: *kernel_size,
                stride: *stride,
                input_len: *input_len,
                bias: bias.is_some(),
            }),
            Module::Opaque { name, .. } => Some(LayerKind::Opaque { name: name.clone() }),
            Module::Activation(_) => None,
        }
    }

    /// Output length for an input of length `input_len`, if the module accepts it.
    fn output_len(&self, input_len: usize) -> Option<usize> {
        match self {
            Module::Linear {
                in_features,
                out_features,
                ..
            } => (*in_features == input_len).then_some(*out_features),
            Module::ElementwiseAffine { scale, .. } => (scale.len() == input_len).then_some(input_len),
            Module::Conv1d {
                in_channels,
                out_channels,
                input_len: len,
                ..
            } => {
                let positions = self.kind()?.conv_positions()?;
                (in_channels * len == input_len).then_some(out_channels * positions)
            }
            Module::Activation(_) => Some(input_len),
            Module::Opaque { weight, .. } => (weight.len() == input_len).then_some(input_len),
        }
    }

    fn forward(&self, x: &[F]) -> Vec<F> {
        match self {
            Module::Linear {
                in_features,
                weight,
                bias,
                ..
            } => {
                let mut y: Vec<F> = weight
                    .chunks_exact((*in_features).max(1))
                    .map(|row| dot(row, x))
                    .collect();
                if let Some(b) = bias {
                    crate::linalg::axpy(F::one(), b, &mut y);
                }
                y
            }
            Module::ElementwiseAffine { scale, shift } => {
                let mut y: Vec<F> = scale.iter().zip(x).map(|(&g, &xi)| g * xi).collect();
                if let Some(b) = shift {
                    crate::linalg::axpy(F::one(), b, &mut y);
                }
                y
            }
            Module::Conv1d {
                in_channels,
                out_channels,
                kernel_size,
                stride,
                input_len,
                weight,
                bias,
            } => {
                let positions = (input_len - kernel_size) / stride + 1;
                let mut y = vec![F::zero(); out_channels * positions];
                for o in 0..*out_channels {
                    for t in 0..positions {
                        let mut s = bias.as_ref().map_or(F::zero(), |b| b[o]);
                        for c in 0..*in_channels {
                            let w = &weight[(o * in_channels + c) * kernel_size..][..*kernel_size];
                            let xs = &x[c * input_len + t * stride..][..*kernel_size];
                            s = s + dot(w, xs);
                        }
                        y[o * positions + t] = s;
                    }
                }
                y
            }
            Module::Activation(a) => x.iter().map(|&xi| a.apply(xi)).collect(),
            Module::Opaque { .. } => x.to_vec(),
        }
    }

    /// Pull a vector at the module output back to the module input, given the
    /// module input `x`.
    fn backward(&self, x: &[F], v: &[F]) -> Vec<F> {
        match self {
            Module::Linear {
                in_features,
                weight,
                ..
            } => {
                let mut out = vec![F::zero(); *in_features];
                for (row, &vo) in weight.chunks_exact((*in_features).max(1)).zip(v) {
                    crate::linalg::axpy(vo, row, &mut out);
                }
                out
            }
            Module::ElementwiseAffine { scale, .. } => {
                scale.iter().zip(v).map(|(&g, &vi)| g * vi).collect()
            }
            Module::Conv1d {
                in_channels,
                out_channels,
                kernel_size,
                stride,
                input_len,
                weight,
                ..
            } => {
                let positions = (input_len - kernel_size) / stride + 1;
                let mut out = vec![F::zero(); in_channels * input_len];
                for o in 0..*out_channels {
                    for t in 0..positions {
                        let vot = v[o * positions + t];
                        for c in 0..*in_channels {
                            let w = &weight[(o * in_channels + c) * kernel_size..][..*kernel_size];
                            let base = c * input_len + t * stride;
                            for (k, &wk) in w.iter().enumerate() {
                                out[base + k] = out[base + k] + vot * wk;
                            }
                        }
                    }
                }
                out
            }
            Module::Activation(a) => x
                .iter()
                .zip(v)
                .map(|(&xi, &vi)| a.derivative(xi) * vi)
                .collect(),
            Module::Opaque { .. } => v.to_vec(),
        }
    }

    fn param(&self, slot: ParamSlot) -> Option<&Vec<F>> {
        match (self, slot) {
            (Module::Linear { weight, .. }, ParamSlot::Weight)
            | (Module::Conv1d { weight, .. }, ParamSlot::Weight)
            | (Module::Opaque { weight, .. }, ParamSlot::Weight)
            | (Module::ElementwiseAffine { scale: weight, .. }, ParamSlot::Weight) => Some(weight),
            (Module::Linear { bias, .. }, ParamSlot::Bias)
            | (Module::Conv1d { bias, .. }, ParamSlot::Bias)
            | (Module::ElementwiseAffine { shift: bias, .. }, ParamSlot::Bias) => bias.as_ref(),
            _ => None,
        }
    }

    fn param_mut(&mut self, slot: ParamSlot) -> Option<&mut Vec<F>> {
        match (self, slot) {
            (Module::Linear { weight, .. }, ParamSlot::Weight)
            | (Module::Conv1d { weight, .. }, ParamSlot::Weight)
            | (Module::Opaque { weight, .. }, ParamSlot::Weight)
            | (Module::ElementwiseAffine { scale: weight, .. }, ParamSlot::Weight) => Some(weight),
            (Module::Linear { bias, .. }, ParamSlot::Bias)
            | (Module::Conv1d { bias, .. }, ParamSlot::Bias)
            | (Module::ElementwiseAffine { shift: bias, .. }, ParamSlot::Bias) => bias.as_mut(),
            _ => None,
        }
    }
}

/// Feed-forward chain of modules.
pub struct Sequential<F> {
    modules: Vec<Module<F>>,
    /// Input length of each module, plus the network output length last.
    dims: Vec<usize>,
    /// `cache[i][n]`: input of module `i` for sample `n` in the last forward pass.
    cache: Vec<Vec<Vec<F>>>,
    hooks: HookSlot<F>,
}

impl<F: Float> Sequential<F> {
    /// Chain `modules` on inputs of length `input_len`.
    ///
    /// # Panics
    ///
    /// Panics if consecutive modules disagree on shapes.
    pub fn new(input_len: usize, modules: Vec<Module<F>>) -> Self {
        let mut dims = Vec::with_capacity(modules.len() + 1);
        dims.push(input_len);
        for (i, m) in modules.iter().enumerate() {
            let prev = dims[dims.len() - 1];
            let next = m
                .output_len(prev)
                .unwrap_or_else(|| panic!("module {i} does not accept inputs of length {prev}"));
            dims.push(next);
        }
        Sequential {
            modules,
            dims,
            cache: Vec::new(),
            hooks: HookSlot::new(),
        }
    }

    /// Multi-layer perceptron with `Tanh` between linear layers, seeded.
    pub fn mlp(sizes: &[usize], bias: bool, seed: u64) -> Self {
        assert!(sizes.len() >= 2, "an MLP needs input and output sizes");
        let mut rng = stream(seed, Stream::User(0));
        let mut modules = Vec::new();
        for (i, w) in sizes.windows(2).enumerate() {
            if i > 0 {
                modules.push(Module::Activation(Activation::Tanh));
            }
            modules.push(Module::linear(w[0], w[1], bias, &mut rng));
        }
        Sequential::new(sizes[0], modules)
    }

    pub fn modules(&self) -> &[Module<F>] {
        &self.modules
    }

    /// Evaluate without caching anything.
    pub fn predict(&self, x: &[F]) -> Vec<F> {
        self.modules
            .iter()
            .fold(x.to_vec(), |acc, m| m.forward(&acc))
    }

    fn module_mut(&mut self, id: ParamId) -> Option<&mut Vec<F>> {
        self.modules.get_mut(id.layer.0)?.param_mut(id.slot)
    }
}

impl<F: Float> Parameters<F> for Sequential<F> {
    fn parameter(&self, id: ParamId) -> Option<&[F]> {
        self.modules
            .get(id.layer.0)?
            .param(id.slot)
            .map(Vec::as_slice)
    }

    fn parameter_mut(&mut self, id: ParamId) -> Option<&mut [F]> {
        self.module_mut(id).map(Vec::as_mut_slice)
    }
}

impl<F: Float> BackwardHost<F> for Sequential<F> {
    fn layers(&self) -> Vec<LayerInfo> {
        self.modules
            .iter()
            .enumerate()
            .filter_map(|(i, m)| {
                let kind = m.kind()?;
                let id = LayerId(i);
                LayerInfo::from_kind(id, kind.clone()).or_else(|| {
                    // opaque: report shapes from the module itself
                    let len = m.param(ParamSlot::Weight).map_or(0, Vec::len);
                    Some(LayerInfo {
                        id,
                        kind,
                        params: vec![ParamInfo {
                            id: ParamId::weight(i),
                            len,
                        }],
                        input_len: self.dims[i],
                        output_len: self.dims[i + 1],
                    })
                })
            })
            .collect()
    }

    fn input_len(&self) -> usize {
        self.dims[0]
    }

    fn output_len(&self) -> usize {
        self.dims[self.dims.len() - 1]
    }

    fn forward(&mut self, inputs: &[Vec<F>]) -> Result<Vec<Vec<F>>, CurvatureError> {
        if let Some((sample, x)) = inputs
            .iter()
            .enumerate()
            .find(|(_, x)| x.len() != self.dims[0])
        {
            return Err(ConfigurationError::InputShape {
                sample,
                expected: self.dims[0],
                found: x.len(),
            }
            .into());
        }
        let mut cache = Vec::with_capacity(self.modules.len());
        let mut current: Vec<Vec<F>> = inputs.to_vec();
        for m in &self.modules {
            let next = current.iter().map(|x| m.forward(x)).collect();
            cache.push(std::mem::replace(&mut current, next));
        }
        self.cache = cache;
        Ok(current)
    }

    fn run_backward(&mut self, seeds: &BackwardSeeds<F>) -> Result<(), CurvatureError> {
        let samples = seeds.num_samples();
        if self.cache.len() != self.modules.len()
            || self.cache.first().map_or(samples > 0, |c| c.len() != samples)
        {
            return Err(HostIntegrationError::MissingForward { samples }.into());
        }
        let mut gradients = seeds.gradients.clone();
        let mut columns = seeds.factors.clone();
        columns.resize(samples, Vec::new());

        for (i, module) in self.modules.iter().enumerate().rev() {
            let inputs = &self.cache[i];
            if module.kind().is_some() {
                self.hooks.dispatch(LayerVisit {
                    layer: LayerId(i),
                    inputs,
                    backprop: &columns,
                    gradients: &gradients,
                })?;
            }
            if i == 0 {
                break;
            }
            for n in 0..samples {
                let x = &inputs[n];
                gradients[n] = module.backward(x, &gradients[n]);
                for col in columns[n].iter_mut() {
                    *col = module.backward(x, col);
                }
            }
        }
        Ok(())
    }

    fn hooks(&mut self) -> &mut HookSlot<F> {
        &mut self.hooks
    }
}
