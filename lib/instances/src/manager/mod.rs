// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Distributed instance managers.
//!
//! An [`InstanceManager`] is the local representative of one distributed
//! physical instance. Every variant shares one reference-counting core
//! ([`GcState`], valid and resource references, priorities, outstanding uses,
//! active contexts) guarded by a single lock, and specializes allocation and
//! teardown through [`ManagerKind`]:
//!
//! - [`IndividualManager`]: one allocation on one node, possibly bound later.
//! - [`CollectiveManager`]: one logical instance replicated along a chain of nodes.
//! - [`VirtualManager`]: no allocation, never collected.
//!
//! Only the owner node decides collection. Other nodes reach the owner through
//! the [`Directory`](crate::directory::Directory) held by their
//! [`NodeContext`](crate::node::NodeContext).

mod collective;
mod contexts;
mod gc;
mod individual;
mod state;
mod virtual_manager;

pub use collective::{CollectiveManager, CollectiveMember};
pub use contexts::{InstanceContext, InstanceView};
pub use individual::{IndividualKind, IndividualManager};
pub use state::{GcState, ReferenceSource};
pub use virtual_manager::VirtualManager;

use anyhow::{Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::allocator::AllocationHandle;
use crate::events::CompletionHandle;
use crate::layout::LayoutDescription;
use crate::messages::{AnnouncedKind, ManagerAnnouncement, TeardownAction};
use crate::node::NodeContext;
use crate::types::{Did, GcPriority, MapperId, NodeId, ProcessorId};
use state::GcCore;

/// Result of a collection attempt.
#[derive(Clone, Debug)]
pub enum CollectOutcome {
    /// The instance is collected; the handle fires once deallocation is visible.
    Collected(CompletionHandle),
    /// The instance is in use or a competing acquire won the race.
    Denied,
}

impl CollectOutcome {
    pub fn is_collected(&self) -> bool {
        matches!(self, CollectOutcome::Collected(_))
    }

    pub fn completion(&self) -> Option<&CompletionHandle> {
        match self {
            CollectOutcome::Collected(handle) => Some(handle),
            CollectOutcome::Denied => None,
        }
    }
}

/// Variant-specific state of a manager.
pub enum ManagerKind {
    Individual(IndividualManager),
    Collective(CollectiveManager),
    Virtual(VirtualManager),
}

impl ManagerKind {
    pub fn name(&self) -> &'static str {
        match self {
            ManagerKind::Individual(_) => "individual",
            ManagerKind::Collective(_) => "collective",
            ManagerKind::Virtual(_) => "virtual",
        }
    }
}

pub struct InstanceManager {
    did: Did,
    owner: NodeId,
    layout: Arc<LayoutDescription>,
    redop: Option<u32>,
    footprint: AtomicUsize,
    context: Arc<NodeContext>,
    core: Mutex<GcCore>,
    kind: ManagerKind,
    this: Weak<InstanceManager>,
}

impl InstanceManager {
    pub(crate) fn new(
        context: Arc<NodeContext>,
        did: Did,
        layout: Arc<LayoutDescription>,
        redop: Option<u32>,
        footprint: usize,
        kind: ManagerKind,
        state: GcState,
    ) -> Arc<Self> {
        let debug_references = context.config().gc.debug_references;
        Arc::new_cyclic(|this| Self {
            did,
            owner: did.owner(),
            layout,
            redop,
            footprint: AtomicUsize::new(footprint),
            context,
            core: Mutex::new(GcCore::new(state, debug_references)),
            kind,
            this: this.clone(),
        })
    }

    /// Build the local copy of a manager announced by its owner.
    pub(crate) fn from_announcement(
        context: Arc<NodeContext>,
        did: Did,
        announcement: ManagerAnnouncement,
    ) -> Arc<Self> {
        let ManagerAnnouncement {
            owner: _,
            footprint,
            layout,
            redop,
            gc_state,
            kind,
        } = announcement;
        let (kind, pending_binding) = match kind {
            AnnouncedKind::Individual {
                allocation,
                memory,
                kind,
            } => match allocation {
                Some(allocation) => (
                    ManagerKind::Individual(IndividualManager::bound(
                        memory,
                        allocation,
                        kind,
                        CompletionHandle::ready(),
                    )),
                    false,
                ),
                None => (
                    ManagerKind::Individual(IndividualManager::unbound(memory, None)),
                    true,
                ),
            },
            AnnouncedKind::Collective { members, radix } => (
                ManagerKind::Collective(CollectiveManager::new(
                    did.owner(),
                    members
                        .into_iter()
                        .map(|(node, allocation)| CollectiveMember { node, allocation })
                        .collect(),
                    radix,
                )),
                false,
            ),
            AnnouncedKind::Virtual => (ManagerKind::Virtual(VirtualManager), false),
        };

        let manager = Self::new(context, did, layout, redop, footprint, kind, gc_state);
        if pending_binding {
            manager.add_resource_reference(1);
        }
        if let ManagerKind::Virtual(_) = manager.kind {
            VirtualManager::pin(&manager);
        }
        manager
    }

    pub(crate) fn arc(&self) -> Option<Arc<Self>> {
        self.this.upgrade()
    }

    pub fn did(&self) -> Did {
        self.did
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub fn is_owner(&self) -> bool {
        self.owner == self.context.node_id()
    }

    pub fn layout(&self) -> &Arc<LayoutDescription> {
        &self.layout
    }

    /// Reduction operator the instance is specialized for.
    pub fn redop(&self) -> Option<u32> {
        self.redop
    }

    pub fn footprint(&self) -> usize {
        self.footprint.load(Ordering::Acquire)
    }

    pub fn kind(&self) -> &ManagerKind {
        &self.kind
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.context
    }

    pub fn as_individual(&self) -> Option<&IndividualManager> {
        match &self.kind {
            ManagerKind::Individual(individual) => Some(individual),
            _ => None,
        }
    }

    pub fn as_collective(&self) -> Option<&CollectiveManager> {
        match &self.kind {
            ManagerKind::Collective(collective) => Some(collective),
            _ => None,
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.kind, ManagerKind::Virtual(_))
    }

    pub fn gc_state(&self) -> GcState {
        self.core.lock().state
    }

    pub fn valid_references(&self) -> u64 {
        self.core.lock().valid_references
    }

    pub fn resource_references(&self) -> u64 {
        self.core.lock().resource_references
    }

    /// Per-source valid references, when `gc.debug_references` is enabled.
    pub fn detailed_references(&self) -> Option<BTreeMap<ReferenceSource, u64>> {
        self.core.lock().detailed_references.clone()
    }

    pub fn min_priority(&self) -> GcPriority {
        self.core.lock().min_priority
    }

    pub fn priority_of(&self, mapper: MapperId, processor: ProcessorId) -> Option<GcPriority> {
        self.core.lock().priorities.get(&(mapper, processor)).copied()
    }

    /// `(sent, received)` valid-reference transfer counters.
    pub fn transfer_counts(&self) -> (u64, u64) {
        let core = self.core.lock();
        (core.sent_valid_references, core.received_valid_references)
    }

    /// Outstanding uses that gate physical deletion.
    pub fn outstanding_uses(&self) -> usize {
        self.core.lock().gc_events.len()
    }

    pub fn active_context_count(&self) -> usize {
        self.core.lock().contexts.len()
    }

    /// True if `gc_state == VALID ⟺ valid_references > 0` holds.
    ///
    /// Only meaningful at quiescence, with no protocol messages in flight.
    pub fn check_valid_invariant(&self) -> bool {
        let core = self.core.lock();
        (core.state == GcState::Valid) == (core.valid_references > 0)
    }

    /// Use event for `user`; the binding producer never waits on its own binding.
    pub fn get_use_event(&self, user: Option<&CompletionHandle>) -> CompletionHandle {
        match &self.kind {
            ManagerKind::Individual(individual) => individual.get_use_event(user),
            ManagerKind::Collective(_) | ManagerKind::Virtual(_) => CompletionHandle::ready(),
        }
    }

    /// Free the physical allocation. Called once, when the instance is collected.
    pub fn perform_deletion(&self) -> CompletionHandle {
        match &self.kind {
            ManagerKind::Individual(individual) => individual.perform_deletion(self),
            ManagerKind::Collective(collective) => {
                collective.start_teardown(self, TeardownAction::Delete)
            }
            ManagerKind::Virtual(_) => CompletionHandle::ready(),
        }
    }

    /// Free the physical allocation immediately, ignoring outstanding uses.
    pub fn force_deletion(&self) {
        self.mark_collected();
        match &self.kind {
            ManagerKind::Individual(individual) => individual.force_deletion(self),
            ManagerKind::Collective(collective) => {
                collective.start_teardown(self, TeardownAction::ForceDelete);
            }
            ManagerKind::Virtual(_) => {}
        }
    }

    /// Chain-propagated deletion of a collective instance.
    pub async fn perform_delete(&self) -> Result<CompletionHandle> {
        self.chain_teardown(TeardownAction::Delete).await
    }

    /// Chain-propagated immediate deletion of a collective instance.
    pub async fn force_delete(&self) -> Result<CompletionHandle> {
        self.chain_teardown(TeardownAction::ForceDelete).await
    }

    /// Stop using externally attached storage without freeing it.
    pub async fn detach_external(&self) -> Result<CompletionHandle> {
        match &self.kind {
            ManagerKind::Individual(individual) => individual.detach_external(self),
            ManagerKind::Collective(_) => self.chain_teardown(TeardownAction::Detach).await,
            ManagerKind::Virtual(_) => bail!("virtual instances have no external storage"),
        }
    }

    async fn chain_teardown(&self, action: TeardownAction) -> Result<CompletionHandle> {
        let Some(collective) = self.as_collective() else {
            bail!(
                "{} is a {} instance, chain teardown needs a collective one",
                self.did,
                self.kind.name()
            );
        };
        collective.teardown(self, action).await
    }

    /// Bind the allocation of an instance created unbound.
    ///
    /// `footprint` is the size of the bound allocation, which replaces the
    /// estimate the instance was created with.
    pub fn bind(
        &self,
        allocation: AllocationHandle,
        kind: IndividualKind,
        footprint: usize,
    ) -> Result<()> {
        let Some(individual) = self.as_individual() else {
            bail!("{} is a {} instance and cannot be bound", self.did, self.kind.name());
        };
        individual.bind(self, allocation, kind, footprint)
    }

    /// Announcement of this manager for a new remote copy.
    pub(crate) fn pack_announcement(&self) -> ManagerAnnouncement {
        let kind = match &self.kind {
            ManagerKind::Individual(individual) => individual.announce(),
            ManagerKind::Collective(collective) => collective.announce(),
            ManagerKind::Virtual(_) => AnnouncedKind::Virtual,
        };
        self.announcement(kind)
    }

    pub(crate) fn announcement(&self, kind: AnnouncedKind) -> ManagerAnnouncement {
        let gc_state = self.core.lock().state.packed();
        ManagerAnnouncement {
            owner: self.owner,
            footprint: self.footprint(),
            layout: Arc::clone(&self.layout),
            redop: self.redop,
            gc_state,
            kind,
        }
    }

    pub(crate) fn set_footprint(&self, footprint: usize) {
        self.footprint.store(footprint, Ordering::Release);
    }
}

impl std::fmt::Debug for InstanceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceManager")
            .field("did", &self.did)
            .field("kind", &self.kind.name())
            .field("node", &self.context.node_id())
            .field("state", &self.gc_state())
            .finish()
    }
}

/// Capability surface of a physical instance shared by every manager variant.
#[async_trait]
pub trait PhysicalManager: Send + Sync {
    fn did(&self) -> Did;

    fn owner_node(&self) -> NodeId;

    fn footprint(&self) -> usize;

    fn gc_state(&self) -> GcState;

    fn layout(&self) -> &Arc<LayoutDescription>;

    /// Take a valid reference. `false` means the instance is gone.
    async fn acquire(&self, source: ReferenceSource) -> Result<bool>;

    /// Drop valid references. Returns `true` if the instance became collectable.
    fn remove_valid_reference(&self, source: ReferenceSource, count: u64) -> bool;

    async fn collect(&self) -> Result<CollectOutcome>;

    async fn set_priority(
        &self,
        mapper: MapperId,
        processor: ProcessorId,
        priority: GcPriority,
    ) -> Result<()>;

    /// Record an outstanding use that must finish before physical deletion.
    async fn record_instance_user(&self, event: CompletionHandle) -> Result<()>;

    fn get_use_event(&self, user: Option<&CompletionHandle>) -> CompletionHandle;

    fn perform_deletion(&self) -> CompletionHandle;

    fn force_deletion(&self);
}

#[async_trait]
impl PhysicalManager for InstanceManager {
    fn did(&self) -> Did {
        self.did
    }

    fn owner_node(&self) -> NodeId {
        self.owner
    }

    fn footprint(&self) -> usize {
        InstanceManager::footprint(self)
    }

    fn gc_state(&self) -> GcState {
        InstanceManager::gc_state(self)
    }

    fn layout(&self) -> &Arc<LayoutDescription> {
        &self.layout
    }

    async fn acquire(&self, source: ReferenceSource) -> Result<bool> {
        InstanceManager::acquire(self, source).await
    }

    fn remove_valid_reference(&self, source: ReferenceSource, count: u64) -> bool {
        InstanceManager::remove_valid_reference(self, source, count)
    }

    async fn collect(&self) -> Result<CollectOutcome> {
        InstanceManager::collect(self).await
    }

    async fn set_priority(
        &self,
        mapper: MapperId,
        processor: ProcessorId,
        priority: GcPriority,
    ) -> Result<()> {
        InstanceManager::set_priority(self, mapper, processor, priority).await
    }

    async fn record_instance_user(&self, event: CompletionHandle) -> Result<()> {
        InstanceManager::record_instance_user(self, event).await
    }

    fn get_use_event(&self, user: Option<&CompletionHandle>) -> CompletionHandle {
        InstanceManager::get_use_event(self, user)
    }

    fn perform_deletion(&self) -> CompletionHandle {
        InstanceManager::perform_deletion(self)
    }

    fn force_deletion(&self) {
        InstanceManager::force_deletion(self)
    }
}
