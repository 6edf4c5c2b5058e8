// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::task::TaskTracker;

use crate::allocator::Allocator;
use crate::config::InstancesConfig;
use crate::directory::Directory;
use crate::error::TransportError;
use crate::messages::{InstanceMessage, MessageBody};
use crate::pending::{PendingRequests, Response};
use crate::types::{Did, NodeId, RequestId};

/// Services a node provides to its managers.
///
/// Managers receive the context at construction and reach the directory,
/// allocator and pending-request table only through it.
pub struct NodeContext {
    node: NodeId,
    directory: Arc<dyn Directory>,
    allocator: Arc<dyn Allocator>,
    config: InstancesConfig,
    pending: PendingRequests,
    tasks: TaskTracker,
    next_did: AtomicU64,
}

impl NodeContext {
    pub fn new(
        directory: Arc<dyn Directory>,
        allocator: Arc<dyn Allocator>,
        config: InstancesConfig,
    ) -> Self {
        Self {
            node: directory.local_node(),
            directory,
            allocator,
            config,
            pending: PendingRequests::new(),
            tasks: TaskTracker::new(),
            next_did: AtomicU64::new(1),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    pub fn config(&self) -> &InstancesConfig {
        &self.config
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// A fresh identity owned by this node.
    pub fn allocate_did(&self) -> Did {
        Did::new(self.node, self.next_did.fetch_add(1, Ordering::Relaxed))
    }

    pub fn send(&self, target: NodeId, did: Did, body: MessageBody) -> Result<(), TransportError> {
        self.directory.send(target, InstanceMessage::new(did, body))
    }

    /// Send a request built around a fresh [`RequestId`] and wait for its response.
    pub async fn request<F>(&self, target: NodeId, did: Did, build: F) -> Result<Response>
    where
        F: FnOnce(RequestId) -> MessageBody,
    {
        let awaiter = self.pending.register();
        let request = awaiter.request_id();
        if let Err(e) = self.send(target, did, build(request)) {
            self.pending.cancel(request);
            return Err(e.into());
        }
        Ok(awaiter.recv().await?)
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(future);
    }
}
