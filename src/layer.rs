//! Identifiers and shape descriptions for the layers a host network exposes.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Position of a layer in the host network (forward order).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LayerId(pub usize);

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer {}", self.0)
    }
}

/// Which tensor of a layer a parameter is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ParamSlot {
    /// Weight matrix, convolution kernel or elementwise scale.
    Weight,
    /// Additive bias or elementwise shift.
    Bias,
}

impl fmt::Display for ParamSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamSlot::Weight => write!(f, "weight"),
            ParamSlot::Bias => write!(f, "bias"),
        }
    }
}

/// A single trainable parameter tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ParamId {
    pub layer: LayerId,
    pub slot: ParamSlot,
}

impl ParamId {
    pub fn weight(layer: usize) -> Self {
        ParamId {
            layer: LayerId(layer),
            slot: ParamSlot::Weight,
        }
    }

    pub fn bias(layer: usize) -> Self {
        ParamId {
            layer: LayerId(layer),
            slot: ParamSlot::Bias,
        }
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.layer, self.slot)
    }
}

/// Layer types the host can report.
///
/// Layouts are row-major and flat: `Linear` weights are `out × in`,
/// `Conv1d` inputs are `in_channels × input_len`, outputs are
/// `out_channels × positions` and kernels are `out × in × kernel_size`.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LayerKind {
    /// `y = W x + b`.
    Linear {
        in_features: usize,
        out_features: usize,
        bias: bool,
    },
    /// `y = γ ⊙ x + β`.
    ElementwiseAffine { features: usize, shift: bool },
    /// One-dimensional cross-correlation without padding.
    Conv1d {
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        input_len: usize,
        bias: bool,
    },
    /// A parameterized layer the host knows but curvature extraction does not.
    Opaque { name: String },
}

impl LayerKind {
    /// Human-readable type name.
    pub fn name(&self) -> &str {
        match self {
            LayerKind::Linear { .. } => "Linear",
            LayerKind::ElementwiseAffine { .. } => "ElementwiseAffine",
            LayerKind::Conv1d { .. } => "Conv1d",
            LayerKind::Opaque { name } => name,
        }
    }

    /// Number of output positions of a `Conv1d` layer; `None` for other kinds
    /// or when the kernel does not fit the input.
    pub fn conv_positions(&self) -> Option<usize> {
        match *self {
            LayerKind::Conv1d {
                kernel_size,
                stride,
                input_len,
                ..
            } if stride > 0 && kernel_size > 0 && kernel_size <= input_len => {
                Some((input_len - kernel_size) / stride + 1)
            }
            _ => None,
        }
    }
}

/// Shape of one parameter tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ParamInfo {
    pub id: ParamId,
    /// Number of scalar entries.
    pub len: usize,
}

/// A parameterized layer as reported by the host.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LayerInfo {
    pub id: LayerId,
    pub kind: LayerKind,
    pub params: Vec<ParamInfo>,
    pub input_len: usize,
    pub output_len: usize,
}

impl LayerInfo {
    /// Describe a layer of a known kind; parameter sizes follow from the kind.
    ///
    /// Returns `None` for [`LayerKind::Opaque`], whose shapes only the host knows.
    pub fn from_kind(id: LayerId, kind: LayerKind) -> Option<Self> {
        let (input_len, output_len, params) = match kind {
            LayerKind::Linear {
                in_features,
                out_features,
                bias,
            } => {
                let mut params = vec![(ParamSlot::Weight, out_features * in_features)];
                if bias {
                    params.push((ParamSlot::Bias, out_features));
                }
                (in_features, out_features, params)
            }
            LayerKind::ElementwiseAffine { features, shift } => {
                let mut params = vec![(ParamSlot::Weight, features)];
                if shift {
                    params.push((ParamSlot::Bias, features));
                }
                (features, features, params)
            }
            LayerKind::Conv1d {
                in_channels,
                out_channels,
                kernel_size,
                input_len,
                bias,
                ..
            } => {
                let positions = kind.conv_positions()?;
                let mut params = vec![(ParamSlot::Weight, out_channels * in_channels * kernel_size)];
                if bias {
                    params.push((ParamSlot::Bias, out_channels));
                }
                (in_channels * input_len, out_channels * positions, params)
            }
            LayerKind::Opaque { .. } => return None,
        };
        let params = params
            .into_iter()
            .map(|(slot, len)| ParamInfo {
                id: ParamId { layer: id, slot },
                len,
            })
            .collect();
        Some(LayerInfo {
            id,
            kind,
            params,
            input_len,
            output_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_shapes() {
        let info = LayerInfo::from_kind(
            LayerId(2),
            LayerKind::Linear {
                in_features: 3,
                out_features: 4,
                bias: true,
            },
        )
        .unwrap();
        assert_eq!(info.input_len, 3);
        assert_eq!(info.output_len, 4);
        assert_eq!(
            info.params,
            vec![
                ParamInfo {
                    id: ParamId::weight(2),
                    len: 12
                },
                ParamInfo {
                    id: ParamId::bias(2),
                    len: 4
                },
            ]
        );
    }

    #[test]
    fn conv_positions_with_stride() {
        let kind = LayerKind::Conv1d {
            in_channels: 2,
            out_channels: 3,
            kernel_size: 3,
            stride: 2,
            input_len: 8,
            bias: false,
        };
        // windows start at 0, 2 and 4
        assert_eq!(kind.conv_positions(), Some(3));
        let info = LayerInfo::from_kind(LayerId(0), kind).unwrap();
        assert_eq!(info.output_len, 9);
        assert_eq!(
            info.params,
            vec![ParamInfo {
                id: ParamId::weight(0),
                len: 18
            }]
        );
    }

    #[test]
    fn opaque_has_no_derived_shape() {
        let kind = LayerKind::Opaque {
            name: "BatchNorm1d".into(),
        };
        assert_eq!(kind.name(), "BatchNorm1d");
        assert!(LayerInfo::from_kind(LayerId(0), kind).is_none());
    }

    #[test]
    fn display() {
        assert_eq!(ParamId::bias(1).to_string(), "layer 1 bias");
    }
}
