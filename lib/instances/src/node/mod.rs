// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! One node of the instance fabric.
//!
//! An [`InstanceNode`] owns the node's directory and context and runs the
//! dispatcher that applies incoming protocol messages to local managers.

mod context;
mod handlers;

pub use context::NodeContext;

use anyhow::{Result, bail};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::allocator::{AllocationHandle, Allocator};
use crate::builder::{BuildOutcome, CollectiveRequest, InstanceBuilder};
use crate::config::InstancesConfig;
use crate::directory::{Directory, LocalDirectory, Lookup};
use crate::error::BuildError;
use crate::events::CompletionHandle;
use crate::layout::LayoutDescription;
use crate::manager::{
    GcState, IndividualKind, IndividualManager, InstanceManager, ManagerKind, VirtualManager,
};
use crate::messages::{Envelope, MessageBody};
use crate::transport::Transport;
use crate::types::{Did, MemoryId, NodeId};

pub struct InstanceNode {
    context: Arc<NodeContext>,
    cancel: CancellationToken,
}

impl InstanceNode {
    pub fn new(
        node: NodeId,
        transport: Arc<dyn Transport>,
        allocator: Arc<dyn Allocator>,
        config: InstancesConfig,
    ) -> Arc<Self> {
        let directory: Arc<dyn Directory> = Arc::new(LocalDirectory::new(node, transport));
        Arc::new(Self {
            context: Arc::new(NodeContext::new(directory, allocator, config)),
            cancel: CancellationToken::new(),
        })
    }

    /// Start dispatching messages from `inbox`.
    pub fn start(self: &Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
        let node = Arc::clone(self);
        let cancel = self.cancel.clone();
        self.context.spawn(async move {
            debug!(node = %node.node_id(), "dispatcher started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    envelope = inbox.recv() => match envelope {
                        Some(envelope) => node.dispatch(envelope),
                        None => break,
                    },
                }
            }
            debug!(node = %node.node_id(), "dispatcher stopped");
        });
    }

    pub fn node_id(&self) -> NodeId {
        self.context.node_id()
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.context
    }

    pub fn find_manager(&self, did: Did) -> Option<Arc<InstanceManager>> {
        match self.context.directory().find(did) {
            Lookup::Found(manager) => Some(manager),
            Lookup::Pending(_) | Lookup::Missing => None,
        }
    }

    /// The local manager for `did`, requesting an announcement from the owner
    /// if this node has none yet.
    pub async fn find_or_request_manager(&self, did: Did) -> Result<Arc<InstanceManager>> {
        let directory = self.context.directory();
        let arrival = match directory.find(did) {
            Lookup::Found(manager) => return Ok(manager),
            Lookup::Pending(arrival) => arrival,
            Lookup::Missing => {
                if did.owner() == self.node_id() {
                    bail!("{did} is not registered on its owner");
                }
                let (arrival, created) = directory.expect_announcement(did);
                if created {
                    self.context
                        .send(did.owner(), did, MessageBody::ManagerRequest)?;
                }
                arrival
            }
        };
        arrival.wait().await?;
        match self.find_manager(did) {
            Some(manager) => Ok(manager),
            None => bail!("{did} was announced and released before it could be used"),
        }
    }

    /// Build an instance from `builder` in this node's memory.
    pub fn create_physical_instance(&self, builder: &InstanceBuilder) -> Result<BuildOutcome, BuildError> {
        builder.create_physical_instance(&self.context)
    }

    /// Build one logical instance with an allocation on every member.
    pub fn create_collective_instance(
        &self,
        builder: &InstanceBuilder,
        request: &CollectiveRequest,
    ) -> Result<Arc<InstanceManager>, BuildError> {
        builder.create_collective_instance(&self.context, request)
    }

    /// An instance whose allocation will be bound later.
    ///
    /// Holds a resource reference until bound. Only `producer` may use the
    /// instance before the binding exists.
    pub fn create_unbound_instance(
        &self,
        layout: LayoutDescription,
        memory: MemoryId,
        producer: Option<CompletionHandle>,
    ) -> Arc<InstanceManager> {
        let footprint = layout.footprint();
        let manager = InstanceManager::new(
            Arc::clone(&self.context),
            self.context.allocate_did(),
            Arc::new(layout),
            None,
            footprint,
            ManagerKind::Individual(IndividualManager::unbound(memory, producer)),
            GcState::Collectable,
        );
        manager.add_resource_reference(1);
        self.context.directory().register(Arc::clone(&manager));
        manager
    }

    /// Wrap application-owned storage as an instance.
    pub fn attach_external_instance(
        &self,
        layout: LayoutDescription,
        allocation: AllocationHandle,
    ) -> Arc<InstanceManager> {
        let ready = self.context.allocator().attach_external(allocation);
        let footprint = layout.footprint();
        let manager = InstanceManager::new(
            Arc::clone(&self.context),
            self.context.allocate_did(),
            Arc::new(layout),
            None,
            footprint,
            ManagerKind::Individual(IndividualManager::bound(
                allocation.memory,
                allocation,
                IndividualKind::ExternalAttached,
                ready,
            )),
            GcState::Collectable,
        );
        self.context.directory().register(Arc::clone(&manager));
        manager
    }

    /// An instance with no storage that is never collected.
    pub fn create_virtual_manager(&self) -> Arc<InstanceManager> {
        let manager = InstanceManager::new(
            Arc::clone(&self.context),
            self.context.allocate_did(),
            Arc::new(LayoutDescription::empty()),
            None,
            0,
            ManagerKind::Virtual(VirtualManager),
            GcState::Collectable,
        );
        VirtualManager::pin(&manager);
        self.context.directory().register(Arc::clone(&manager));
        manager
    }

    /// Force-delete every owned instance, stop the dispatcher and wait for
    /// outstanding handlers.
    pub async fn shutdown(&self) {
        let mut deleted = 0usize;
        for manager in self.context.directory().managers() {
            if manager.is_owner() && !manager.is_virtual() && manager.gc_state() != GcState::Collected {
                manager.force_deletion();
                deleted += 1;
            }
        }
        self.cancel.cancel();
        let abandoned = self.context.pending().cancel_all();
        if abandoned > 0 {
            debug!(node = %self.node_id(), abandoned, "abandoned outstanding requests");
        }
        let tasks = self.context.tasks();
        tasks.close();
        tasks.wait().await;
        info!(node = %self.node_id(), deleted, "instance node shut down");
    }
}
