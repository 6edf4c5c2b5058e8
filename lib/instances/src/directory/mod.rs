// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Distributed object directory.
//!
//! Maps a [`Did`] to the local representative manager, tracks which nodes hold
//! remote copies, and sends messages on behalf of managers. Managers receive
//! their directory through the node context; nothing looks it up globally.

mod local;

pub use local::LocalDirectory;

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::TransportError;
use crate::events::CompletionHandle;
use crate::manager::InstanceManager;
use crate::messages::InstanceMessage;
use crate::types::{Did, NodeId};

/// Result of a directory lookup.
pub enum Lookup {
    Found(Arc<InstanceManager>),
    /// An announcement was requested and has not arrived yet.
    Pending(CompletionHandle),
    Missing,
}

pub trait Directory: Send + Sync {
    fn local_node(&self) -> NodeId;

    /// Register the local representative of `manager.did()`.
    fn register(&self, manager: Arc<InstanceManager>);

    fn unregister(&self, did: Did) -> Option<Arc<InstanceManager>>;

    fn find(&self, did: Did) -> Lookup;

    /// Mark `did` as requested from its owner.
    ///
    /// Returns the handle that fires on registration and whether this call
    /// created the request (the caller must then send it).
    fn expect_announcement(&self, did: Did) -> (CompletionHandle, bool);

    /// Nodes other than this one known to hold a copy of `did`.
    fn remote_copy_set(&self, did: Did) -> BTreeSet<NodeId>;

    /// Record that `node` holds a copy. Returns `false` if already recorded.
    fn add_remote_copy(&self, did: Did, node: NodeId) -> bool;

    fn send(&self, target: NodeId, message: InstanceMessage) -> Result<(), TransportError>;

    /// Every locally registered manager.
    fn managers(&self) -> Vec<Arc<InstanceManager>>;
}
