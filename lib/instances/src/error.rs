// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy.
//!
//! Configuration errors are fatal programmer errors; allocation failures are
//! recoverable and tell the caller which constraint could not be satisfied.
//! A garbage-collection race is an invariant violation and aborts through
//! [`fatal_gc_race`] instead of being returned.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::types::{Did, FieldId, MemoryId, NodeId};

/// Kinds of layout constraints, used to report which one was unsatisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ConstraintKind {
    Specialized,
    Memory,
    Field,
    Ordering,
    Splitting,
    Dimension,
    Alignment,
    Offset,
}

/// Contradictory or unsupported layout constraints.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("splitting constraints are not supported for physical instances")]
    SplittingUnsupported,

    #[error("inner split dimensions are not supported in ordering constraints")]
    InnerDimensionUnsupported,

    #[error("ordering constraint contains multiple field dimensions")]
    DuplicateFieldDimension,

    #[error("ordering constraint contains dimension {0} more than once")]
    DuplicateDimension(u8),

    #[error("hybrid ordering places the field dimension in the middle but omits spatial dimensions")]
    IncompleteHybridOrdering,

    #[error("virtual specialization cannot back a physical instance")]
    VirtualSpecialization,

    #[error(
        "field {field} has size {actual} but reduction operator {redop} expects a left-hand side of {expected}"
    )]
    ReductionSizeMismatch {
        field: FieldId,
        redop: u32,
        expected: usize,
        actual: usize,
    },

    #[error("field {0} is not part of the field space")]
    UnknownField(FieldId),

    #[error("field {0} appears more than once in the field constraint")]
    DuplicateField(FieldId),
}

/// The allocator could not satisfy a request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unsatisfied {kind} constraint at index {index}: {reason}")]
pub struct AllocationFailure {
    pub kind: ConstraintKind,
    pub index: usize,
    pub reason: String,
}

impl AllocationFailure {
    pub fn new(kind: ConstraintKind, index: usize, reason: impl Into<String>) -> Self {
        Self {
            kind,
            index,
            reason: reason.into(),
        }
    }

    /// Insufficient capacity in the target memory.
    pub fn out_of_memory(memory: MemoryId, requested: usize, available: usize) -> Self {
        Self::new(
            ConstraintKind::Memory,
            0,
            format!("{memory} has {available} bytes free, {requested} requested"),
        )
    }
}

/// Failure of [`InstanceBuilder`](crate::builder::InstanceBuilder).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("invalid layout constraints: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("allocation failed: {0}")]
    Allocation(#[from] AllocationFailure),
}

impl BuildError {
    /// Fatal errors must not be retried with a different target.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BuildError::Configuration(_))
    }
}

/// Message delivery failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("no route to {0}")]
    UnknownNode(NodeId),

    #[error("inbox of {0} is closed")]
    Closed(NodeId),
}

/// Abort on a garbage-collection race.
///
/// A valid reference was granted on an object that the protocol already
/// decided to collect. Nothing can recover from this.
#[track_caller]
pub fn fatal_gc_race(did: Did, node: NodeId, detail: &str) -> ! {
    tracing::error!(%did, %node, detail, "fatal garbage collection race");
    panic!("garbage collection race on {did} at {node}: {detail}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_failure_reports_constraint() {
        let failure = AllocationFailure::out_of_memory(MemoryId(1), 128, 64);
        assert_eq!(failure.kind, ConstraintKind::Memory);
        assert_eq!(failure.index, 0);
        assert!(failure.to_string().contains("memory constraint"));

        let err = BuildError::from(failure);
        assert!(!err.is_fatal());
        assert!(BuildError::from(ConfigurationError::SplittingUnsupported).is_fatal());
    }

    #[test]
    #[should_panic(expected = "garbage collection race")]
    fn gc_race_panics() {
        fatal_gc_race(Did::new(NodeId(0), 1), NodeId(1), "test");
    }
}
