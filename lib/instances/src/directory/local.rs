// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use super::{Directory, Lookup};
use crate::error::TransportError;
use crate::events::{CompletionEvent, CompletionHandle};
use crate::manager::InstanceManager;
use crate::messages::InstanceMessage;
use crate::transport::Transport;
use crate::types::{Did, NodeId};

/// Directory for one node, backed by concurrent maps and a [`Transport`].
pub struct LocalDirectory {
    node: NodeId,
    transport: Arc<dyn Transport>,
    managers: DashMap<Did, Arc<InstanceManager>>,
    pending: DashMap<Did, CompletionEvent>,
    remote_copies: DashMap<Did, BTreeSet<NodeId>>,
}

impl LocalDirectory {
    pub fn new(node: NodeId, transport: Arc<dyn Transport>) -> Self {
        Self {
            node,
            transport,
            managers: DashMap::new(),
            pending: DashMap::new(),
            remote_copies: DashMap::new(),
        }
    }
}

impl Directory for LocalDirectory {
    fn local_node(&self) -> NodeId {
        self.node
    }

    fn register(&self, manager: Arc<InstanceManager>) {
        let did = manager.did();
        debug!(%did, node = %self.node, "register manager");
        self.managers.insert(did, manager);
        if let Some((_, waiting)) = self.pending.remove(&did) {
            waiting.trigger();
        }
    }

    fn unregister(&self, did: Did) -> Option<Arc<InstanceManager>> {
        self.remote_copies.remove(&did);
        self.managers.remove(&did).map(|(_, manager)| manager)
    }

    fn find(&self, did: Did) -> Lookup {
        if let Some(manager) = self.managers.get(&did) {
            return Lookup::Found(Arc::clone(manager.value()));
        }
        match self.pending.get(&did) {
            Some(event) => Lookup::Pending(event.handle()),
            None => Lookup::Missing,
        }
    }

    fn expect_announcement(&self, did: Did) -> (CompletionHandle, bool) {
        let mut created = false;
        let entry = self.pending.entry(did).or_insert_with(|| {
            created = true;
            CompletionEvent::new()
        });
        let handle = entry.handle();
        drop(entry);

        // Registration may have raced with the request
        if self.managers.contains_key(&did) {
            if let Some((_, event)) = self.pending.remove(&did) {
                event.trigger();
            }
            return (CompletionHandle::ready(), false);
        }
        (handle, created)
    }

    fn remote_copy_set(&self, did: Did) -> BTreeSet<NodeId> {
        self.remote_copies
            .get(&did)
            .map(|set| set.iter().copied().filter(|n| *n != self.node).collect())
            .unwrap_or_default()
    }

    fn add_remote_copy(&self, did: Did, node: NodeId) -> bool {
        if node == self.node {
            return false;
        }
        self.remote_copies.entry(did).or_default().insert(node)
    }

    fn send(&self, target: NodeId, message: InstanceMessage) -> Result<(), TransportError> {
        self.transport.send(self.node, target, message)
    }

    fn managers(&self) -> Vec<Arc<InstanceManager>> {
        self.managers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}
