//! Parameter groups and their block-diagonal partitioning.
//!
//! A parameter group fixes the coordinate space of eigenvectors: the
//! concatenation of its tensors in group order. A partition splits the group
//! into disjoint blocks; each block gets its own low-rank factor, Gram matrix
//! and eigenpairs, and cross-block curvature is ignored.

use std::collections::HashMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::layer::{LayerInfo, ParamId, ParamInfo};

/// How the parameter group is split into independently treated blocks.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BlockPartition {
    /// One block covering the whole group. Any failure aborts the request.
    #[default]
    Global,
    /// One block per layer.
    PerLayer,
    /// One block per parameter tensor.
    PerParameter,
    /// Caller-defined groups; together they must cover the group exactly once.
    Groups(Vec<Vec<ParamId>>),
}

impl BlockPartition {
    pub fn is_global(&self) -> bool {
        matches!(self, BlockPartition::Global)
    }

    /// Split `group` into blocks.
    pub fn resolve(&self, group: &ParameterGroup) -> Result<Vec<Block>, ConfigurationError> {
        let members: Vec<Vec<ParamId>> = match self {
            BlockPartition::Global => vec![group.params().map(|p| p.id).collect()],
            BlockPartition::PerParameter => group.params().map(|p| vec![p.id]).collect(),
            BlockPartition::PerLayer => {
                let mut blocks: Vec<Vec<ParamId>> = Vec::new();
                for p in group.params() {
                    match blocks.iter_mut().find(|b| b[0].layer == p.id.layer) {
                        Some(block) => block.push(p.id),
                        None => blocks.push(vec![p.id]),
                    }
                }
                blocks
            }
            BlockPartition::Groups(groups) => {
                let mut seen = HashMap::new();
                for (b, ids) in groups.iter().enumerate() {
                    if ids.is_empty() {
                        return Err(ConfigurationError::EmptyBlock { block: b });
                    }
                    for &id in ids {
                        if group.len_of(id).is_none() {
                            return Err(ConfigurationError::UnknownParameter { param: id });
                        }
                        if seen.insert(id, b).is_some() {
                            return Err(ConfigurationError::DuplicateParameter { param: id });
                        }
                    }
                }
                if let Some(p) = group.params().find(|p| !seen.contains_key(&p.id)) {
                    return Err(ConfigurationError::UncoveredParameter { param: p.id });
                }
                groups.clone()
            }
        };
        Ok(members
            .into_iter()
            .enumerate()
            .map(|(index, ids)| Block::new(index, group, &ids))
            .collect())
    }
}

/// One tensor of a block with its position in the block's flat vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ParamSegment {
    pub id: ParamId,
    pub offset: usize,
    pub len: usize,
}

/// A set of parameters whose curvature is computed jointly.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Block {
    pub index: usize,
    pub segments: Vec<ParamSegment>,
}

impl Block {
    fn new(index: usize, group: &ParameterGroup, ids: &[ParamId]) -> Self {
        let mut offset = 0;
        let segments = ids
            .iter()
            .map(|&id| {
                let len = group.len_of(id).unwrap_or(0);
                let seg = ParamSegment { id, offset, len };
                offset += len;
                seg
            })
            .collect();
        Block { index, segments }
    }

    /// Dimension of the block's parameter space.
    pub fn dim(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    /// Split a flat block vector into per-tensor slices.
    pub fn split<'v, F>(&self, v: &'v [F]) -> Vec<(ParamId, &'v [F])> {
        assert_eq!(v.len(), self.dim(), "vector does not match block dimension");
        self.segments
            .iter()
            .map(|s| (s.id, &v[s.offset..s.offset + s.len]))
            .collect()
    }
}

/// Ordered, validated collection of parameter tensors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParameterGroup {
    entries: Vec<ParamInfo>,
}

impl ParameterGroup {
    /// Resolve a requested parameter list against the host's layers.
    ///
    /// `None` selects every parameter in forward order.
    pub fn resolve(
        layers: &[LayerInfo],
        requested: Option<&[ParamId]>,
    ) -> Result<Self, ConfigurationError> {
        let all: Vec<_> = layers.iter().flat_map(|l| l.params.iter().copied()).collect();
        let entries = match requested {
            None => all,
            Some(ids) => {
                let mut entries = Vec::with_capacity(ids.len());
                for &id in ids {
                    let info = all
                        .iter()
                        .find(|p| p.id == id)
                        .ok_or(ConfigurationError::UnknownParameter { param: id })?;
                    if entries.iter().any(|e: &ParamInfo| e.id == id) {
                        return Err(ConfigurationError::DuplicateParameter { param: id });
                    }
                    entries.push(*info);
                }
                entries
            }
        };
        if entries.is_empty() {
            return Err(ConfigurationError::EmptyParameterGroup);
        }
        Ok(ParameterGroup { entries })
    }

    pub fn params(&self) -> impl Iterator<Item = &ParamInfo> + '_ {
        self.entries.iter()
    }

    pub fn len_of(&self, id: ParamId) -> Option<usize> {
        self.entries.iter().find(|p| p.id == id).map(|p| p.len)
    }

    pub fn dim(&self) -> usize {
        self.entries.iter().map(|p| p.len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{LayerId, LayerKind};

    fn layers() -> Vec<LayerInfo> {
        vec![
            LayerInfo::from_kind(
                LayerId(0),
                LayerKind::Linear {
                    in_features: 3,
                    out_features: 2,
                    bias: true,
                },
            )
            .unwrap(),
            LayerInfo::from_kind(
                LayerId(2),
                LayerKind::Linear {
                    in_features: 2,
                    out_features: 1,
                    bias: false,
                },
            )
            .unwrap(),
        ]
    }

    #[test]
    fn default_group_is_forward_order() {
        let group = ParameterGroup::resolve(&layers(), None).unwrap();
        let ids: Vec<_> = group.params().map(|p| p.id).collect();
        assert_eq!(ids, vec![ParamId::weight(0), ParamId::bias(0), ParamId::weight(2)]);
        assert_eq!(group.dim(), 6 + 2 + 2);
    }

    #[test]
    fn per_layer_and_per_parameter() {
        let group = ParameterGroup::resolve(&layers(), None).unwrap();
        let blocks = BlockPartition::PerLayer.resolve(&group).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].dim(), 8);
        assert_eq!(blocks[0].segments[1].offset, 6);
        assert_eq!(BlockPartition::PerParameter.resolve(&group).unwrap().len(), 3);
    }

    #[test]
    fn group_validation() {
        let layers = layers();
        assert_eq!(
            ParameterGroup::resolve(&layers, Some(&[ParamId::bias(2)][..])),
            Err(ConfigurationError::UnknownParameter {
                param: ParamId::bias(2)
            })
        );
        assert_eq!(
            ParameterGroup::resolve(&layers, Some(&[ParamId::weight(0), ParamId::weight(0)][..])),
            Err(ConfigurationError::DuplicateParameter {
                param: ParamId::weight(0)
            })
        );
        assert_eq!(
            ParameterGroup::resolve(&layers, Some(&[][..])),
            Err(ConfigurationError::EmptyParameterGroup)
        );
    }

    #[test]
    fn custom_groups_must_cover_exactly() {
        let group = ParameterGroup::resolve(&layers(), None).unwrap();
        let uncovered =
            BlockPartition::Groups(vec![vec![ParamId::weight(0)], vec![ParamId::weight(2)]]);
        assert_eq!(
            uncovered.resolve(&group),
            Err(ConfigurationError::UncoveredParameter {
                param: ParamId::bias(0)
            })
        );
        let empty = BlockPartition::Groups(vec![vec![]]);
        assert_eq!(
            empty.resolve(&group),
            Err(ConfigurationError::EmptyBlock { block: 0 })
        );
        let ok = BlockPartition::Groups(vec![
            vec![ParamId::weight(2), ParamId::weight(0)],
            vec![ParamId::bias(0)],
        ]);
        let blocks = ok.resolve(&group).unwrap();
        assert_eq!(blocks[0].segments[1].offset, 2);
        assert_eq!(blocks[1].dim(), 2);
    }

    #[test]
    fn split_vector() {
        let group = ParameterGroup::resolve(&layers(), None).unwrap();
        let block = &BlockPartition::Global.resolve(&group).unwrap()[0];
        let v: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let parts = block.split(&v);
        assert_eq!(parts[1].0, ParamId::bias(0));
        assert_eq!(parts[1].1, &[6.0, 7.0]);
    }
}
