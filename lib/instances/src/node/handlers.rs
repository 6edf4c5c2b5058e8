// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Message handlers.
//!
//! Handlers that never wait run inline on the dispatcher, which keeps the
//! per-sender delivery order. Handlers that wait on other nodes are spawned.

use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::InstanceNode;
use crate::events::CompletionHandle;
use crate::manager::{CollectOutcome, InstanceManager};
use crate::messages::{
    ChainDirection, Envelope, GuardState, InstanceMessage, ManagerAnnouncement, MessageBody,
    TeardownAction,
};
use crate::pending::Response;
use crate::types::{Did, GcPriority, NodeId, RequestId};

impl InstanceNode {
    pub(super) fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        let Envelope {
            source,
            message: InstanceMessage { did, body },
        } = envelope;
        trace!(node = %self.node_id(), %source, %did, message = body.name(), "dispatch");

        let pending = self.context.pending();
        match body {
            MessageBody::ManagerRequest => self.on_manager_request(source, did),
            MessageBody::ManagerAnnouncement(announcement) => self.on_announcement(did, *announcement),

            MessageBody::AcquireRequest { request } => self.spawn_acquire(source, did, request),
            MessageBody::AcquireResponse {
                request,
                granted,
                ack,
            } => {
                pending.complete(request, Response::Acquire { granted, ack });
            }
            MessageBody::AcquireApplied { ack } => {
                pending.complete(ack, Response::AcquireApplied);
            }

            MessageBody::CollectRequest { request } => self.spawn_collect(source, did, request),
            MessageBody::CollectResponse {
                request,
                completion,
            } => {
                pending.complete(request, Response::Collect(completion));
            }

            MessageBody::AcquireGuardRequest { request } => self.on_guard_request(source, did, request),
            MessageBody::AcquireGuardResponse { request, guard } => {
                pending.complete(request, Response::Guard(guard));
            }

            MessageBody::PriorityUpdate { request, priority } => {
                self.spawn_priority_update(source, did, request, priority)
            }
            MessageBody::PriorityDone { request } => {
                pending.complete(request, Response::PriorityDone);
            }

            MessageBody::RecordUse { request, event } => {
                match self.find_manager(did) {
                    Some(manager) => manager.handle_record_use(event),
                    None => debug!(%did, "use recorded for an unknown instance"),
                }
                self.reply(source, did, MessageBody::RecordUseDone { request });
            }
            MessageBody::RecordUseDone { request } => {
                pending.complete(request, Response::RecordUseDone);
            }

            MessageBody::GcDebugRequest { request } => {
                let acquired = self
                    .find_manager(did)
                    .is_some_and(|manager| manager.handle_gc_debug());
                self.reply(source, did, MessageBody::GcDebugResponse { request, acquired });
            }
            MessageBody::GcDebugResponse { request, acquired } => {
                pending.complete(request, Response::GcDebug(acquired));
            }

            MessageBody::BindingUpdate {
                allocation,
                kind,
                footprint,
            } => {
                let Some(manager) = self.find_manager(did) else {
                    warn!(%did, "binding update for an unknown instance");
                    return;
                };
                match manager.as_individual() {
                    Some(individual) => {
                        if let Err(e) = individual.bind(&manager, allocation, kind, footprint) {
                            debug!(%did, "ignoring binding update: {}", e);
                        }
                    }
                    None => warn!(%did, "binding update for a non-individual instance"),
                }
            }

            MessageBody::ChainTeardown {
                action,
                direction,
                request,
            } => self.on_chain_teardown(source, did, action, direction, request),
            MessageBody::ChainTeardownDone {
                request,
                completion,
            } => {
                pending.complete(request, Response::Teardown(completion));
            }
            MessageBody::Finalize { .. } => match self.find_collective(did) {
                Some(manager) => {
                    if let Some(collective) = manager.as_collective() {
                        collective.handle_finalize(&manager);
                    }
                }
                None => warn!(%did, %source, "finalize for an unknown collective instance"),
            },
        }
    }

    fn reply(&self, target: NodeId, did: Did, body: MessageBody) {
        let name = body.name();
        if let Err(e) = self.context.send(target, did, body) {
            warn!(%did, %target, message = name, "failed to send reply: {}", e);
        }
    }

    fn find_collective(&self, did: Did) -> Option<Arc<InstanceManager>> {
        self.find_manager(did)
            .filter(|manager| manager.as_collective().is_some())
    }

    // ── Announcements ──

    fn on_manager_request(&self, source: NodeId, did: Did) {
        let Some(manager) = self.find_manager(did) else {
            warn!(%did, %source, "manager requested for an unknown instance");
            return;
        };
        if let Err(e) = manager.send_manager(source) {
            warn!(%did, %source, "failed to announce manager: {}", e);
        }
    }

    fn on_announcement(&self, did: Did, announcement: ManagerAnnouncement) {
        if self.find_manager(did).is_some() {
            debug!(%did, "ignoring duplicate announcement");
            return;
        }
        let manager = InstanceManager::from_announcement(Arc::clone(&self.context), did, announcement);
        debug!(%did, node = %self.node_id(), kind = manager.kind().name(), "registered remote copy");
        self.context.directory().register(manager);
    }

    // ── Owner requests ──

    fn spawn_acquire(self: &Arc<Self>, source: NodeId, did: Did, request: RequestId) {
        let node = Arc::clone(self);
        self.context.spawn(async move {
            match node.find_manager(did).filter(|manager| manager.is_owner()) {
                Some(manager) => {
                    if let Err(e) = manager.handle_remote_acquire(source, request).await {
                        warn!(%did, %source, "remote acquire failed: {}", e);
                    }
                }
                None => {
                    debug!(%did, %source, "denying acquire of an unknown instance");
                    node.reply(
                        source,
                        did,
                        MessageBody::AcquireResponse {
                            request,
                            granted: false,
                            ack: None,
                        },
                    );
                }
            }
        });
    }

    fn spawn_collect(self: &Arc<Self>, source: NodeId, did: Did, request: RequestId) {
        let node = Arc::clone(self);
        self.context.spawn(async move {
            let completion = match node.find_manager(did).filter(|manager| manager.is_owner()) {
                Some(manager) => match manager.collect().await {
                    Ok(CollectOutcome::Collected(done)) => Some(done),
                    Ok(CollectOutcome::Denied) => None,
                    Err(e) => {
                        warn!(%did, %source, "collection failed: {}", e);
                        None
                    }
                },
                // Already collected and released
                None => Some(CompletionHandle::ready()),
            };
            node.reply(source, did, MessageBody::CollectResponse { request, completion });
        });
    }

    fn on_guard_request(&self, source: NodeId, did: Did, request: RequestId) {
        let guard = match self.find_manager(did) {
            Some(manager) => manager.handle_guard_request(source),
            // A released copy holds nothing
            None => Some(GuardState::default()),
        };
        self.reply(source, did, MessageBody::AcquireGuardResponse { request, guard });
    }

    fn spawn_priority_update(
        self: &Arc<Self>,
        source: NodeId,
        did: Did,
        request: RequestId,
        priority: GcPriority,
    ) {
        let node = Arc::clone(self);
        self.context.spawn(async move {
            if let Some(manager) = node.find_manager(did) {
                if let Err(e) = manager.handle_priority_update(source, priority).await {
                    warn!(%did, %source, "priority update failed: {}", e);
                }
            }
            node.reply(source, did, MessageBody::PriorityDone { request });
        });
    }

    // ── Collective chains ──

    fn on_chain_teardown(
        &self,
        source: NodeId,
        did: Did,
        action: TeardownAction,
        direction: ChainDirection,
        request: Option<RequestId>,
    ) {
        let manager = self.find_collective(did);
        match direction {
            ChainDirection::Leftward => {
                let completion = match &manager {
                    Some(manager) => match manager.as_collective() {
                        Some(collective) if collective.left_node() == self.node_id() => {
                            collective.start_teardown(manager, action)
                        }
                        _ => {
                            warn!(%did, %source, "leftward teardown reached a non-root node");
                            CompletionHandle::ready()
                        }
                    },
                    None => CompletionHandle::ready(),
                };
                if let Some(request) = request {
                    self.reply(source, did, MessageBody::ChainTeardownDone { request, completion });
                }
            }
            ChainDirection::Rightward => match &manager {
                Some(manager) => {
                    if let Some(collective) = manager.as_collective() {
                        collective.handle_rightward(manager, action);
                    }
                }
                None => warn!(%did, %source, "chain teardown for an unknown collective instance"),
            },
        }
    }
}
