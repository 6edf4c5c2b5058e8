// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Distributed physical-instance lifecycle and garbage collection.
//!
//! # Overview
//!
//! A physical instance is a memory allocation backing a logical data region.
//! Copies of its bookkeeping live on every node that uses it, and exactly one
//! node, the owner, decides when the allocation may be reclaimed.
//!
//! - [`InstanceBuilder`] turns layout constraints into an allocation and a manager
//! - [`InstanceManager`] tracks valid and resource references and runs the
//!   acquire, collect, priority and teardown protocols
//! - [`InstanceNode`] hosts one node's [`Directory`] and dispatches protocol messages
//! - [`InProcessFabric`] connects nodes within one process
//!
//! Garbage-collection races are invariant violations: they are logged and abort
//! through [`fatal_gc_race`] instead of being returned as errors.

pub mod allocator;
pub mod builder;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod layout;
pub mod logging;
pub mod manager;
pub mod messages;
pub mod node;
pub mod pending;
pub mod transport;
pub mod types;

// ── Re-exports ───────────────────────────────────────────────────────

pub use allocator::{AllocationHandle, Allocator, MemoryPoolAllocator, PoolStats};
pub use builder::{BuildOutcome, CollectiveRequest, InstanceBuilder};
pub use config::{CollectiveConfig, ConfigError, GcConfig, InstancesConfig};
pub use directory::{Directory, LocalDirectory, Lookup};
pub use error::{
    AllocationFailure, BuildError, ConfigurationError, ConstraintKind, TransportError,
    fatal_gc_race,
};
pub use events::{CompletionEvent, CompletionHandle, EventPoison, EventStatus, merge_completions};
pub use manager::{
    CollectOutcome, GcState, IndividualKind, InstanceContext, InstanceManager, InstanceView,
    PhysicalManager, ReferenceSource,
};
pub use messages::TeardownAction;
pub use node::{InstanceNode, NodeContext};
pub use transport::{InProcessFabric, Transport};
pub use types::{ContextId, Did, GcPriority, MapperId, MemoryId, NodeId, ProcessorId};
