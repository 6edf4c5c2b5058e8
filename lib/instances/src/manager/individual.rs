// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! A physical instance backed by one allocation in one memory.

use anyhow::{Result, bail};
use parking_lot::Mutex;
use std::sync::Arc;
use strum::Display;
use tracing::{debug, warn};

use super::InstanceManager;
use super::state::GcState;
use crate::allocator::AllocationHandle;
use crate::events::{CompletionEvent, CompletionHandle};
use crate::messages::{AnnouncedKind, MessageBody};
use crate::types::{MemoryId, NodeId};

/// How the allocation of an individual instance came to exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum IndividualKind {
    /// Allocated by the runtime from a memory pool.
    Internal,
    /// Storage owned by the application and attached to the runtime.
    ExternalAttached,
    /// Carved from a memory's eager pool.
    Eager,
    /// Not bound to any allocation yet.
    Unbound,
}

struct Binding {
    allocation: Option<AllocationHandle>,
    kind: IndividualKind,
}

pub struct IndividualManager {
    memory: MemoryId,
    binding: Mutex<Binding>,
    /// Fires once the instance is bound and usable.
    use_ready: CompletionHandle,
    ready_event: Mutex<Option<CompletionEvent>>,
    /// Operation producing the binding; it never waits for its own result.
    producer: Option<CompletionHandle>,
}

impl IndividualManager {
    pub(crate) fn bound(
        memory: MemoryId,
        allocation: AllocationHandle,
        kind: IndividualKind,
        use_ready: CompletionHandle,
    ) -> Self {
        Self {
            memory,
            binding: Mutex::new(Binding {
                allocation: Some(allocation),
                kind,
            }),
            use_ready,
            ready_event: Mutex::new(None),
            producer: None,
        }
    }

    /// An instance whose allocation will be supplied later by `producer`.
    pub(crate) fn unbound(memory: MemoryId, producer: Option<CompletionHandle>) -> Self {
        let ready = CompletionEvent::new();
        Self {
            memory,
            binding: Mutex::new(Binding {
                allocation: None,
                kind: IndividualKind::Unbound,
            }),
            use_ready: ready.handle(),
            ready_event: Mutex::new(Some(ready)),
            producer,
        }
    }

    pub fn memory(&self) -> MemoryId {
        self.memory
    }

    pub fn allocation(&self) -> Option<AllocationHandle> {
        self.binding.lock().allocation
    }

    pub fn individual_kind(&self) -> IndividualKind {
        self.binding.lock().kind
    }

    pub fn is_bound(&self) -> bool {
        self.binding.lock().allocation.is_some()
    }

    pub(crate) fn get_use_event(&self, user: Option<&CompletionHandle>) -> CompletionHandle {
        match (&self.producer, user) {
            (Some(producer), Some(user)) if producer.same_as(user) => CompletionHandle::ready(),
            _ => self.use_ready.clone(),
        }
    }

    /// Bind the deferred allocation.
    ///
    /// The owner propagates the binding to every remote copy. Each copy drops
    /// the resource reference it held while unbound.
    pub(crate) fn bind(
        &self,
        manager: &InstanceManager,
        allocation: AllocationHandle,
        kind: IndividualKind,
        footprint: usize,
    ) -> Result<()> {
        {
            let mut binding = self.binding.lock();
            if let Some(existing) = binding.allocation {
                bail!("{} is already bound to {}", manager.did(), existing);
            }
            binding.allocation = Some(allocation);
            binding.kind = kind;
            manager.set_footprint(footprint);

            if manager.is_owner() {
                let context = manager.context();
                for node in context.directory().remote_copy_set(manager.did()) {
                    let update = MessageBody::BindingUpdate {
                        allocation,
                        kind,
                        footprint,
                    };
                    if let Err(e) = context.send(node, manager.did(), update) {
                        warn!(did = %manager.did(), %node, "failed to send binding update: {}", e);
                    }
                }
            }
        }
        debug!(did = %manager.did(), %allocation, %kind, "bound instance");

        if let Some(ready) = self.ready_event.lock().take() {
            ready.trigger();
        }
        manager.remove_resource_reference(1);
        Ok(())
    }

    pub(crate) fn announce(&self) -> AnnouncedKind {
        let binding = self.binding.lock();
        self.announced(&binding)
    }

    fn announced(&self, binding: &Binding) -> AnnouncedKind {
        AnnouncedKind::Individual {
            allocation: binding.allocation,
            memory: self.memory,
            kind: binding.kind,
        }
    }

    /// Send an announcement to `target`, ordered against binding updates.
    pub(crate) fn send_announcement(&self, manager: &InstanceManager, target: NodeId) -> Result<()> {
        let binding = self.binding.lock();
        let context = manager.context();
        context.directory().add_remote_copy(manager.did(), target);
        let announcement = manager.announcement(self.announced(&binding));
        context.send(
            target,
            manager.did(),
            MessageBody::ManagerAnnouncement(Box::new(announcement)),
        )?;
        Ok(())
    }

    /// Free the allocation once the outstanding uses finish.
    pub(crate) fn perform_deletion(&self, manager: &InstanceManager) -> CompletionHandle {
        if !self.is_bound() {
            return self.defer_deletion(manager);
        }
        let contexts = manager.take_active_contexts();
        let after = manager.outstanding_uses_precondition();
        let deleted = self.release(manager, after);
        manager.notify_contexts(contexts);
        deleted
    }

    /// Free the allocation immediately.
    pub(crate) fn force_deletion(&self, manager: &InstanceManager) {
        if !self.is_bound() {
            if let Some(ready) = self.ready_event.lock().take() {
                ready.poison("instance force deleted before binding");
            }
            return;
        }
        manager.take_gc_events();
        self.release(manager, CompletionHandle::ready());
    }

    /// Stop using attached storage without freeing it.
    pub(crate) fn detach_external(&self, manager: &InstanceManager) -> Result<CompletionHandle> {
        let kind = self.individual_kind();
        if kind != IndividualKind::ExternalAttached {
            bail!("{} is {}, only attached instances can be detached", manager.did(), kind);
        }
        if manager.gc_state() == GcState::Valid {
            bail!("{} is still valid and cannot be detached", manager.did());
        }
        let after = manager.outstanding_uses_precondition();
        manager.mark_collected();
        Ok(self.release(manager, after))
    }

    fn defer_deletion(&self, manager: &InstanceManager) -> CompletionHandle {
        let Some(this) = manager.arc() else {
            return CompletionHandle::ready();
        };
        debug!(did = %manager.did(), "deferring deletion until bound");
        let done = CompletionEvent::new();
        let deleted = done.handle();
        self.use_ready.when_complete(move |bound| match bound {
            Ok(()) => done.trigger_after(&this.perform_deletion()),
            Err(poison) => {
                done.poison(Arc::clone(poison.reason_arc()));
            }
        });
        deleted
    }

    fn release(&self, manager: &InstanceManager, after: CompletionHandle) -> CompletionHandle {
        let (allocation, kind) = {
            let binding = self.binding.lock();
            (binding.allocation, binding.kind)
        };
        let Some(allocation) = allocation else {
            return CompletionHandle::ready();
        };
        let allocator = Arc::clone(manager.context().allocator());
        match kind {
            IndividualKind::Eager => allocator.release_eager(allocation, after),
            IndividualKind::ExternalAttached => {
                let detached = CompletionEvent::new();
                let handle = detached.handle();
                after.when_complete(move |_| {
                    detached.trigger_after(&allocator.detach_external(allocation));
                });
                handle
            }
            IndividualKind::Internal | IndividualKind::Unbound => {
                let fields = manager.layout().compute_destroyed_fields();
                allocator.destroy(allocation, &fields, after)
            }
        }
    }
}
