// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! One logical instance replicated across the nodes of a chain.
//!
//! The distinct member nodes form a tree of fan-out `radix` rooted at the
//! owner. Teardown requests travel leftward straight to the root, which
//! latches the first action, fans it out rightward, and completes once every
//! child has acknowledged with a finalize message.

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

use super::InstanceManager;
use crate::allocator::AllocationHandle;
use crate::events::{CompletionEvent, CompletionHandle, merge_completions};
use crate::messages::{AnnouncedKind, ChainDirection, MessageBody, TeardownAction};
use crate::pending::{Response, unexpected};
use crate::types::NodeId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CollectiveMember {
    pub node: NodeId,
    pub allocation: AllocationHandle,
}

#[derive(Default)]
struct ChainState {
    latched: Option<TeardownAction>,
    /// What a teardown call on this node returns once latched.
    outcome: Option<CompletionHandle>,
    local: Option<CompletionHandle>,
    finalize_received: usize,
    /// Root only: fires when the whole chain has finalized.
    complete: Option<CompletionEvent>,
    settled: bool,
}

pub struct CollectiveManager {
    members: Vec<CollectiveMember>,
    nodes: Vec<NodeId>,
    radix: usize,
    chain: Mutex<ChainState>,
}

impl CollectiveManager {
    pub(crate) fn new(owner: NodeId, members: Vec<CollectiveMember>, radix: usize) -> Self {
        let mut nodes = vec![owner];
        for member in &members {
            if !nodes.contains(&member.node) {
                nodes.push(member.node);
            }
        }
        Self {
            members,
            nodes,
            radix: radix.max(1),
            chain: Mutex::new(ChainState::default()),
        }
    }

    pub fn members(&self) -> &[CollectiveMember] {
        &self.members
    }

    /// Distinct nodes in chain order; the root comes first.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn radix(&self) -> usize {
        self.radix
    }

    /// Root of the chain.
    pub fn left_node(&self) -> NodeId {
        self.nodes[0]
    }

    pub fn position(&self, node: NodeId) -> Option<usize> {
        self.nodes.iter().position(|candidate| *candidate == node)
    }

    /// Children of `node` in the fan-out tree.
    pub fn right_nodes(&self, node: NodeId) -> Vec<NodeId> {
        let Some(position) = self.position(node) else {
            return Vec::new();
        };
        let first = position * self.radix + 1;
        (first..first + self.radix)
            .filter_map(|child| self.nodes.get(child).copied())
            .collect()
    }

    pub fn parent_node(&self, node: NodeId) -> Option<NodeId> {
        match self.position(node)? {
            0 => None,
            position => Some(self.nodes[(position - 1) / self.radix]),
        }
    }

    pub fn local_allocations(&self, node: NodeId) -> Vec<AllocationHandle> {
        self.members
            .iter()
            .filter(|member| member.node == node)
            .map(|member| member.allocation)
            .collect()
    }

    /// Finalize acknowledgements received from children.
    pub fn finalize_count(&self) -> usize {
        self.chain.lock().finalize_received
    }

    pub fn latched_action(&self) -> Option<TeardownAction> {
        self.chain.lock().latched
    }

    /// The local teardown ran and every child finalized.
    pub(crate) fn is_settled(&self) -> bool {
        self.chain.lock().settled
    }

    pub(crate) fn announce(&self) -> AnnouncedKind {
        AnnouncedKind::Collective {
            members: self
                .members
                .iter()
                .map(|member| (member.node, member.allocation))
                .collect(),
            radix: self.radix,
        }
    }

    /// Start a teardown from the root. Later calls return the first outcome.
    pub(crate) fn start_teardown(
        &self,
        manager: &InstanceManager,
        action: TeardownAction,
    ) -> CompletionHandle {
        debug_assert_eq!(manager.context().node_id(), self.left_node());
        let outcome = {
            let mut chain = self.chain.lock();
            if let Some(outcome) = &chain.outcome {
                return outcome.clone();
            }
            let complete = CompletionEvent::new();
            let outcome = complete.handle();
            chain.latched = Some(action);
            chain.outcome = Some(outcome.clone());
            chain.complete = Some(complete);
            outcome
        };
        debug!(did = %manager.did(), action = <&str>::from(action), "starting chain teardown");

        let local = self.local_teardown(manager, action);
        self.chain.lock().local = Some(local);
        self.fan_out(manager, action);
        self.try_settle(manager);
        outcome
    }

    /// Teardown requested on any node of the chain.
    pub(crate) async fn teardown(
        &self,
        manager: &InstanceManager,
        action: TeardownAction,
    ) -> Result<CompletionHandle> {
        let context = manager.context();
        if context.node_id() == self.left_node() {
            return Ok(self.start_teardown(manager, action));
        }
        let latched = self.chain.lock().outcome.clone();
        if let Some(outcome) = latched {
            return Ok(outcome);
        }

        let response = context
            .request(self.left_node(), manager.did(), |request| {
                MessageBody::ChainTeardown {
                    action,
                    direction: ChainDirection::Leftward,
                    request: Some(request),
                }
            })
            .await?;
        match response {
            Response::Teardown(done) => Ok(done),
            other => Err(unexpected("teardown", &other).into()),
        }
    }

    /// Teardown arriving from this node's parent. Duplicates are ignored.
    pub(crate) fn handle_rightward(&self, manager: &InstanceManager, action: TeardownAction) {
        {
            let mut chain = self.chain.lock();
            if chain.latched.is_some() {
                debug!(did = %manager.did(), "ignoring duplicate chain teardown");
                return;
            }
            chain.latched = Some(action);
        }

        let local = self.local_teardown(manager, action);
        {
            let mut chain = self.chain.lock();
            chain.local = Some(local.clone());
            chain.outcome = Some(local);
        }
        self.fan_out(manager, action);
        self.try_settle(manager);
    }

    pub(crate) fn handle_finalize(&self, manager: &InstanceManager) {
        self.chain.lock().finalize_received += 1;
        self.try_settle(manager);
    }

    fn fan_out(&self, manager: &InstanceManager, action: TeardownAction) {
        let context = manager.context();
        for child in self.right_nodes(context.node_id()) {
            let message = MessageBody::ChainTeardown {
                action,
                direction: ChainDirection::Rightward,
                request: None,
            };
            if let Err(e) = context.send(child, manager.did(), message) {
                warn!(did = %manager.did(), %child, "failed to send chain teardown: {}", e);
                // An unreachable child will never finalize
                self.chain.lock().finalize_received += 1;
            }
        }
    }

    fn local_teardown(&self, manager: &InstanceManager, action: TeardownAction) -> CompletionHandle {
        let context = manager.context();
        let allocator = Arc::clone(context.allocator());
        let allocations = self.local_allocations(context.node_id());

        match action {
            TeardownAction::Detach => {
                manager.mark_collected();
                merge_completions(
                    allocations
                        .into_iter()
                        .map(|allocation| allocator.detach_external(allocation)),
                )
            }
            TeardownAction::Delete | TeardownAction::ForceDelete => {
                let after = if action == TeardownAction::Delete {
                    manager.outstanding_uses_precondition()
                } else {
                    manager.take_gc_events();
                    CompletionHandle::ready()
                };
                manager.mark_collected();
                let fields = manager.layout().compute_destroyed_fields();
                merge_completions(
                    allocations
                        .into_iter()
                        .map(|allocation| allocator.destroy(allocation, &fields, after.clone())),
                )
            }
        }
    }

    fn try_settle(&self, manager: &InstanceManager) {
        let node = manager.context().node_id();
        let expected = self.right_nodes(node).len();
        let (action, complete, local) = {
            let mut chain = self.chain.lock();
            let (Some(action), Some(local)) = (chain.latched, chain.local.clone()) else {
                return;
            };
            if chain.settled || chain.finalize_received < expected {
                return;
            }
            chain.settled = true;
            (action, chain.complete.take(), local)
        };

        match self.parent_node(node) {
            None => {
                if let Some(complete) = complete {
                    complete.trigger_after(&local);
                }
            }
            Some(parent) => {
                if let Err(e) = manager
                    .context()
                    .send(parent, manager.did(), MessageBody::Finalize { action })
                {
                    warn!(did = %manager.did(), %parent, "failed to send finalize: {}", e);
                }
            }
        }
        debug!(did = %manager.did(), %node, "chain teardown settled");
        manager.release_if_unreferenced();
    }
}
