// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Physical layouts.
//!
//! A [`LayoutDescription`] is the immutable field to offset/size map of a
//! physical instance. Descriptions are computed from a [`LayoutConstraintSet`]
//! by the [`InstanceBuilder`](crate::builder::InstanceBuilder) and shared by
//! every manager built with the same layout.

mod constraints;

pub use constraints::{
    AlignmentConstraint, DimensionKind, Domain, FieldConstraint, FieldInfo, FieldSpace,
    LayoutConstraintSet, LayoutConstraintSetBuilder, OrderingConstraint, ReductionOp,
    SpecializedConstraint, SplittingConstraint,
};

use serde::{Deserialize, Serialize};

use crate::error::{AllocationFailure, ConfigurationError, ConstraintKind};
use crate::types::{DestructorId, FieldId};

/// How fields are interleaved with the spatial dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayoutKind {
    /// Field dimension slowest: one contiguous block per field.
    StructOfArrays,
    /// Field dimension fastest: fields of one point are adjacent.
    ArrayOfStructs,
    /// Field dimension in the middle: per-field blocks within outer tiles.
    Hybrid,
}

/// Placement of one field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldLayout {
    pub field: FieldId,
    /// Byte offset of the field's first element.
    pub offset: usize,
    /// Size of one element of the field.
    pub size: usize,
    /// Byte distance between consecutive elements along the fastest dimension.
    pub pitch: usize,
    pub destructor: Option<DestructorId>,
}

/// A field whose elements need a custom destructor when the allocation is freed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DestroyedField {
    pub field: FieldId,
    pub offset: usize,
    pub size: usize,
    pub destructor: DestructorId,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayoutDescription {
    fields: Vec<FieldLayout>,
    ordering: Vec<DimensionKind>,
    kind: LayoutKind,
    num_dims: u8,
    element_count: u64,
    footprint: usize,
    specialized: SpecializedConstraint,
}

impl LayoutDescription {
    pub fn fields(&self) -> &[FieldLayout] {
        &self.fields
    }

    pub fn ordering(&self) -> &[DimensionKind] {
        &self.ordering
    }

    pub fn kind(&self) -> LayoutKind {
        self.kind
    }

    pub fn num_dims(&self) -> u8 {
        self.num_dims
    }

    pub fn element_count(&self) -> u64 {
        self.element_count
    }

    /// Total bytes the allocation needs.
    pub fn footprint(&self) -> usize {
        self.footprint
    }

    pub fn specialized(&self) -> SpecializedConstraint {
        self.specialized
    }

    pub fn has_field(&self, field: FieldId) -> bool {
        self.find_field_info(field).is_some()
    }

    pub fn find_field_info(&self, field: FieldId) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.field == field)
    }

    /// Sum of the element sizes of every field.
    pub fn total_field_size(&self) -> usize {
        self.fields.iter().map(|f| f.size).sum()
    }

    /// Fields that carry a custom destructor.
    pub fn compute_destroyed_fields(&self) -> Vec<DestroyedField> {
        self.fields
            .iter()
            .filter_map(|f| {
                f.destructor.map(|destructor| DestroyedField {
                    field: f.field,
                    offset: f.offset,
                    size: f.size,
                    destructor,
                })
            })
            .collect()
    }

    /// True if an instance with `other`'s layout could be used in place of this one.
    pub fn match_layout(&self, other: &LayoutDescription) -> bool {
        if self.num_dims != other.num_dims || self.ordering != other.ordering {
            return false;
        }
        if self.fields.len() != other.fields.len() {
            return false;
        }
        self.fields
            .iter()
            .zip(other.fields.iter())
            .all(|(a, b)| a.field == b.field && a.size == b.size)
    }

    /// True if this layout satisfies `constraints` for a `num_dims`-dimensional domain.
    pub fn satisfies(&self, constraints: &LayoutConstraintSet, num_dims: u8) -> bool {
        if self.num_dims != num_dims || self.specialized != constraints.specialized {
            return false;
        }
        if !constraints.fields.fields.iter().all(|field| self.has_field(*field)) {
            return false;
        }
        if constraints.ordering.ordering.is_empty() {
            return true;
        }
        match normalize_ordering(&constraints.ordering.ordering, num_dims) {
            Ok(ordering) => ordering == self.ordering,
            Err(_) => false,
        }
    }

    /// Compute a layout for `fields` (field, element size, destructor) over `domain`.
    ///
    /// `ordering` must already be normalized with [`normalize_ordering`].
    pub(crate) fn compute(
        domain: &Domain,
        ordering: Vec<DimensionKind>,
        fields: &[(FieldId, usize, Option<DestructorId>)],
        alignments: &[AlignmentConstraint],
        specialized: SpecializedConstraint,
    ) -> Result<Self, AllocationFailure> {
        for (index, constraint) in alignments.iter().enumerate() {
            if !constraint.alignment.is_power_of_two() {
                return Err(AllocationFailure::new(
                    ConstraintKind::Alignment,
                    index,
                    format!(
                        "alignment {} of field {} is not a power of two",
                        constraint.alignment, constraint.field
                    ),
                ));
            }
        }
        let alignment_of = |field: FieldId| {
            alignments
                .iter()
                .filter(|a| a.field == field)
                .map(|a| a.alignment)
                .max()
                .unwrap_or(1)
        };

        let field_pos = ordering.iter().position(|d| *d == DimensionKind::Field);
        let kind = match field_pos {
            Some(0) => LayoutKind::ArrayOfStructs,
            Some(pos) if pos + 1 == ordering.len() => LayoutKind::StructOfArrays,
            _ => LayoutKind::Hybrid,
        };

        let overflow = || {
            AllocationFailure::new(
                ConstraintKind::Memory,
                0,
                "instance size overflows the address space",
            )
        };
        let volume = domain
            .checked_volume()
            .and_then(|volume| usize::try_from(volume).ok())
            .ok_or_else(overflow)?;
        // Points in one tile: the spatial dimensions listed before the field dimension
        let inner_volume = ordering
            .iter()
            .take(field_pos.unwrap_or(ordering.len()))
            .filter_map(|d| match d {
                DimensionKind::Spatial(i) => Some(domain.extent(*i)),
                _ => None,
            })
            .try_fold(1usize, |acc, extent| {
                acc.checked_mul(usize::try_from(extent).ok()?)
            })
            .ok_or_else(overflow)?;
        let max_alignment = fields
            .iter()
            .map(|(field, _, _)| alignment_of(*field))
            .max()
            .unwrap_or(1);

        // Place each field after the previous one; `count` elements per field
        let place = |count: usize| -> Result<(Vec<PlacedField>, usize), AllocationFailure> {
            let mut placed = Vec::with_capacity(fields.len());
            let mut cursor = 0usize;
            for (field, size, destructor) in fields {
                let offset = align_up(cursor, alignment_of(*field)).ok_or_else(overflow)?;
                cursor = size
                    .checked_mul(count)
                    .and_then(|bytes| offset.checked_add(bytes))
                    .ok_or_else(overflow)?;
                placed.push((*field, offset, *size, *destructor));
            }
            Ok((placed, cursor))
        };

        let (placed, footprint) = match kind {
            LayoutKind::ArrayOfStructs => {
                let (placed, cursor) = place(1)?;
                let stride = align_up(cursor, max_alignment).ok_or_else(overflow)?;
                let footprint = stride.checked_mul(volume).ok_or_else(overflow)?;
                let fields = placed
                    .into_iter()
                    .map(|(field, offset, size, destructor)| FieldLayout {
                        field,
                        offset,
                        size,
                        pitch: stride,
                        destructor,
                    })
                    .collect::<Vec<_>>();
                return Ok(Self::assemble(
                    fields,
                    ordering,
                    kind,
                    domain,
                    footprint,
                    specialized,
                ));
            }
            LayoutKind::StructOfArrays => place(volume)?,
            LayoutKind::Hybrid => {
                let tiles = volume.checked_div(inner_volume).unwrap_or(0);
                let (placed, cursor) = place(inner_volume)?;
                let footprint = align_up(cursor, max_alignment)
                    .and_then(|tile| tile.checked_mul(tiles))
                    .ok_or_else(overflow)?;
                (placed, footprint)
            }
        };

        let fields = placed
            .into_iter()
            .map(|(field, offset, size, destructor)| FieldLayout {
                field,
                offset,
                size,
                pitch: size,
                destructor,
            })
            .collect();
        Ok(Self::assemble(
            fields,
            ordering,
            kind,
            domain,
            footprint,
            specialized,
        ))
    }

    fn assemble(
        fields: Vec<FieldLayout>,
        ordering: Vec<DimensionKind>,
        kind: LayoutKind,
        domain: &Domain,
        footprint: usize,
        specialized: SpecializedConstraint,
    ) -> Self {
        Self {
            fields,
            ordering,
            kind,
            num_dims: domain.dims(),
            element_count: domain.volume(),
            footprint,
            specialized,
        }
    }

    /// An empty layout, used by virtual managers.
    pub(crate) fn empty() -> Self {
        Self {
            fields: Vec::new(),
            ordering: Vec::new(),
            kind: LayoutKind::StructOfArrays,
            num_dims: 0,
            element_count: 0,
            footprint: 0,
            specialized: SpecializedConstraint::Virtual,
        }
    }
}

/// Field id, offset, element size and destructor of a placed field.
type PlacedField = (FieldId, usize, usize, Option<DestructorId>);

fn align_up(value: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());
    Some(value.checked_add(alignment - 1)? & !(alignment - 1))
}

/// Normalize an ordering constraint against the instance dimensionality.
///
/// Dimensions beyond `num_dims` are dropped. Missing spatial dimensions are
/// appended after a leading field dimension (array-of-structs) or prepended
/// before a trailing one (struct-of-arrays). Without a field dimension the
/// spatial dimensions come first, then the fields.
pub fn normalize_ordering(
    ordering: &[DimensionKind],
    num_dims: u8,
) -> Result<Vec<DimensionKind>, ConfigurationError> {
    let mut seen = vec![false; num_dims as usize];
    let mut has_field = false;
    let mut result = Vec::with_capacity(num_dims as usize + 1);

    for dim in ordering {
        match *dim {
            DimensionKind::Inner(_) => return Err(ConfigurationError::InnerDimensionUnsupported),
            DimensionKind::Field => {
                if has_field {
                    return Err(ConfigurationError::DuplicateFieldDimension);
                }
                has_field = true;
                result.push(DimensionKind::Field);
            }
            DimensionKind::Spatial(index) => {
                if index >= num_dims {
                    continue;
                }
                if seen[index as usize] {
                    return Err(ConfigurationError::DuplicateDimension(index));
                }
                seen[index as usize] = true;
                result.push(DimensionKind::Spatial(index));
            }
        }
    }

    let missing: Vec<DimensionKind> = (0..num_dims)
        .filter(|i| !seen[*i as usize])
        .map(DimensionKind::Spatial)
        .collect();

    if !has_field {
        result.extend(missing);
        result.push(DimensionKind::Field);
        return Ok(result);
    }
    if missing.is_empty() {
        return Ok(result);
    }

    let field_pos = result
        .iter()
        .position(|d| *d == DimensionKind::Field)
        .unwrap_or(0);
    if field_pos == 0 {
        result.extend(missing);
    } else if field_pos + 1 == result.len() {
        result.splice(0..0, missing);
    } else {
        return Err(ConfigurationError::IncompleteHybridOrdering);
    }
    Ok(result)
}
