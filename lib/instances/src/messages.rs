// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Messages exchanged between nodes about one distributed instance.
//!
//! Every message names the instance it concerns. Requests that expect an
//! answer carry a [`RequestId`] generated by the sender; the answer echoes it
//! so the sender's [`PendingRequests`](crate::pending::PendingRequests) table
//! can resume the caller.

use std::sync::Arc;

use strum::IntoStaticStr;

use crate::allocator::AllocationHandle;
use crate::events::CompletionHandle;
use crate::layout::LayoutDescription;
use crate::manager::{GcState, IndividualKind};
use crate::types::{Did, GcPriority, MemoryId, NodeId, RequestId};

#[derive(Clone, Debug)]
pub struct InstanceMessage {
    pub did: Did,
    pub body: MessageBody,
}

impl InstanceMessage {
    pub fn new(did: Did, body: MessageBody) -> Self {
        Self { did, body }
    }
}

/// A message together with the node that sent it.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub source: NodeId,
    pub message: InstanceMessage,
}

/// Outstanding uses and valid-reference transfer counts reported by a remote
/// copy that agreed to a collection attempt.
#[derive(Clone, Debug, Default)]
pub struct GuardState {
    pub gc_events: Vec<CompletionHandle>,
    pub sent_valid_references: u64,
    pub received_valid_references: u64,
}

/// Local teardown applied along a collective chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum TeardownAction {
    Delete,
    ForceDelete,
    Detach,
}

/// Direction a chain teardown message travels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChainDirection {
    /// Toward the chain initiator.
    Leftward,
    /// Fanned out from a parent to its children.
    Rightward,
}

/// Variant-specific part of a manager announcement.
#[derive(Clone, Debug)]
pub enum AnnouncedKind {
    Individual {
        allocation: Option<AllocationHandle>,
        memory: MemoryId,
        kind: IndividualKind,
    },
    Collective {
        members: Vec<(NodeId, AllocationHandle)>,
        radix: usize,
    },
    Virtual,
}

/// Everything a node needs to build a remote copy of a manager.
#[derive(Clone, Debug)]
pub struct ManagerAnnouncement {
    pub owner: NodeId,
    pub footprint: usize,
    pub layout: Arc<LayoutDescription>,
    pub redop: Option<u32>,
    pub gc_state: GcState,
    pub kind: AnnouncedKind,
}

#[derive(Clone, Debug, IntoStaticStr)]
pub enum MessageBody {
    /// Ask the owner to send an announcement of the instance.
    ManagerRequest,
    ManagerAnnouncement(Box<ManagerAnnouncement>),

    AcquireRequest {
        request: RequestId,
    },
    /// `ack` is set when granted: the requester confirms with
    /// [`MessageBody::AcquireApplied`] once its own reference is in place.
    AcquireResponse {
        request: RequestId,
        granted: bool,
        ack: Option<RequestId>,
    },
    AcquireApplied {
        ack: RequestId,
    },

    CollectRequest {
        request: RequestId,
    },
    /// `None` when the owner denied the collection.
    CollectResponse {
        request: RequestId,
        completion: Option<CompletionHandle>,
    },

    AcquireGuardRequest {
        request: RequestId,
    },
    /// `None` when the remote copy holds valid references.
    AcquireGuardResponse {
        request: RequestId,
        guard: Option<GuardState>,
    },

    PriorityUpdate {
        request: RequestId,
        priority: GcPriority,
    },
    PriorityDone {
        request: RequestId,
    },

    RecordUse {
        request: RequestId,
        event: CompletionHandle,
    },
    RecordUseDone {
        request: RequestId,
    },

    /// Verify with the owner that a remote valid reference is legitimate.
    GcDebugRequest {
        request: RequestId,
    },
    GcDebugResponse {
        request: RequestId,
        acquired: bool,
    },

    BindingUpdate {
        allocation: AllocationHandle,
        kind: IndividualKind,
        footprint: usize,
    },

    ChainTeardown {
        action: TeardownAction,
        direction: ChainDirection,
        /// Set when a non-initiator forwarded the request and waits for the outcome.
        request: Option<RequestId>,
    },
    ChainTeardownDone {
        request: RequestId,
        completion: CompletionHandle,
    },
    Finalize {
        action: TeardownAction,
    },
}

impl MessageBody {
    pub fn name(&self) -> &'static str {
        self.into()
    }
}
