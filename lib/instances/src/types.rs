// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Identity and small value types shared across the crate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One participant process in the distributed runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

const NODE_BITS: u32 = 16;
const LOCAL_BITS: u32 = 48;
const NODE_SHIFT: u32 = LOCAL_BITS;
const LOCAL_MASK: u64 = (1u64 << LOCAL_BITS) - 1;

/// Globally unique distributed-object identity.
///
/// Layout (64 bits total):
/// - Upper 16 bits: owner node
/// - Lower 48 bits: per-node sequence number
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Did(u64);

impl Did {
    pub fn new(owner: NodeId, local: u64) -> Self {
        debug_assert!(owner.0 < (1u32 << NODE_BITS), "node id exceeds 16 bits");
        debug_assert!(local <= LOCAL_MASK, "local index exceeds 48 bits");
        Self(((owner.0 as u64) << NODE_SHIFT) | (local & LOCAL_MASK))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    /// The node authoritative for this object's GC decisions.
    pub fn owner(&self) -> NodeId {
        NodeId((self.0 >> NODE_SHIFT) as u32)
    }

    pub fn local_index(&self) -> u64 {
        self.0 & LOCAL_MASK
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "did:{}.{}", self.owner().0, self.local_index())
    }
}

/// A memory that allocations can be placed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryId(pub u64);

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mem{:#x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MapperId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessorId(pub u64);

/// Identifies a context that caches views of instances.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(pub u64);

/// Locally generated id correlating a response with its caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req{}", self.0)
    }
}

/// Garbage-collection priority. Lower values are collected first;
/// [`GcPriority::NEVER_GC`] pins an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GcPriority(pub i32);

impl GcPriority {
    pub const NEVER_GC: GcPriority = GcPriority(i32::MIN);
    pub const DEFAULT: GcPriority = GcPriority(0);

    pub fn is_never(&self) -> bool {
        *self == Self::NEVER_GC
    }
}

impl Default for GcPriority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for GcPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            f.write_str("never")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Identifies a custom per-field destructor run when an allocation is freed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DestructorId(pub u32);

pub type FieldId = u32;
