// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{DestructorId, FieldId};

/// One entry of an ordering constraint, listed fastest varying first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DimensionKind {
    /// Spatial dimension by index: 0 is X, 1 is Y, and so on.
    Spatial(u8),
    /// The field dimension.
    Field,
    /// Inner dimension produced by a split.
    Inner(u8),
}

impl DimensionKind {
    pub const X: DimensionKind = DimensionKind::Spatial(0);
    pub const Y: DimensionKind = DimensionKind::Spatial(1);
    pub const Z: DimensionKind = DimensionKind::Spatial(2);
    pub const F: DimensionKind = DimensionKind::Field;
}

/// A reduction operator: fields of a reduction instance hold right-hand side values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReductionOp {
    pub id: u32,
    pub lhs_size: usize,
    pub rhs_size: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecializedConstraint {
    #[default]
    Normal,
    Affine,
    Compact,
    AffineReduction(ReductionOp),
    CompactReduction(ReductionOp),
    Virtual,
}

impl SpecializedConstraint {
    pub fn reduction(&self) -> Option<ReductionOp> {
        match self {
            SpecializedConstraint::AffineReduction(op)
            | SpecializedConstraint::CompactReduction(op) => Some(*op),
            _ => None,
        }
    }

    pub fn is_compact(&self) -> bool {
        matches!(
            self,
            SpecializedConstraint::Compact | SpecializedConstraint::CompactReduction(_)
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldConstraint {
    pub fields: Vec<FieldId>,
    pub contiguous: bool,
    pub inorder: bool,
}

impl FieldConstraint {
    pub fn new(fields: impl IntoIterator<Item = FieldId>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
            contiguous: false,
            inorder: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderingConstraint {
    pub ordering: Vec<DimensionKind>,
    pub contiguous: bool,
}

impl OrderingConstraint {
    pub fn new(ordering: impl IntoIterator<Item = DimensionKind>) -> Self {
        Self {
            ordering: ordering.into_iter().collect(),
            contiguous: false,
        }
    }

    /// Struct-of-arrays: every spatial dimension, then the field dimension.
    pub fn soa(dims: u8) -> Self {
        Self::new((0..dims).map(DimensionKind::Spatial).chain([DimensionKind::Field]))
    }

    /// Array-of-structs: the field dimension, then every spatial dimension.
    pub fn aos(dims: u8) -> Self {
        Self::new([DimensionKind::Field].into_iter().chain((0..dims).map(DimensionKind::Spatial)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SplittingConstraint {
    pub kind: DimensionKind,
    pub chunks: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlignmentConstraint {
    pub field: FieldId,
    pub alignment: usize,
}

/// The full set of constraints a new physical instance must satisfy.
#[derive(Clone, Debug, Default, Builder, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[builder(default)]
pub struct LayoutConstraintSet {
    pub specialized: SpecializedConstraint,
    pub fields: FieldConstraint,
    pub ordering: OrderingConstraint,
    pub splitting: Vec<SplittingConstraint>,
    pub alignment: Vec<AlignmentConstraint>,
}

impl LayoutConstraintSet {
    pub fn builder() -> LayoutConstraintSetBuilder {
        LayoutConstraintSetBuilder::default()
    }
}

/// Per-field metadata owned by the field space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldInfo {
    pub size: usize,
    pub destructor: Option<DestructorId>,
}

/// The set of fields allocations can be built from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpace {
    fields: BTreeMap<FieldId, FieldInfo>,
}

impl FieldSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, field: FieldId, size: usize) -> Self {
        self.add_field(field, size, None);
        self
    }

    pub fn add_field(&mut self, field: FieldId, size: usize, destructor: Option<DestructorId>) {
        self.fields.insert(field, FieldInfo { size, destructor });
    }

    pub fn field(&self, field: FieldId) -> Option<&FieldInfo> {
        self.fields.get(&field)
    }
}

/// The index-space extent an instance covers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Domain {
    extents: Vec<u64>,
}

impl Domain {
    /// A dense rectangle with the given extent per dimension, X first.
    pub fn dense(extents: impl IntoIterator<Item = u64>) -> Self {
        Self {
            extents: extents.into_iter().collect(),
        }
    }

    pub fn dims(&self) -> u8 {
        self.extents.len() as u8
    }

    pub fn extent(&self, dim: u8) -> u64 {
        self.extents.get(dim as usize).copied().unwrap_or(1)
    }

    /// Number of points in the domain, saturating at `u64::MAX`.
    pub fn volume(&self) -> u64 {
        self.checked_volume().unwrap_or(u64::MAX)
    }

    /// Number of points in the domain, or `None` if it overflows.
    pub fn checked_volume(&self) -> Option<u64> {
        self.extents
            .iter()
            .try_fold(1u64, |acc, extent| acc.checked_mul(*extent))
    }
}
