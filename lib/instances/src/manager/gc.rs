// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Distributed reference counting and collection.
//!
//! The owner is the only node that decides collection. A collection round
//! asks every remote copy for a guard; a copy that agrees reports its
//! outstanding uses and valid-reference transfer counters. The round commits
//! only if every copy agreed, the counters balance, and no acquire raced it.

use anyhow::{Result, bail};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::contexts::{ActiveContext, InstanceContext, InstanceView};
use super::state::{GcState, ReferenceSource};
use super::{CollectOutcome, InstanceManager, ManagerKind};
use crate::error::fatal_gc_race;
use crate::events::{CompletionEvent, CompletionHandle, merge_completions};
use crate::messages::{GuardState, MessageBody};
use crate::pending::{Response, unexpected};
use crate::types::{ContextId, GcPriority, MapperId, NodeId, ProcessorId, RequestId};

impl InstanceManager {
    // ── Valid references ──

    /// Take a valid reference, asking the owner if this copy cannot decide.
    ///
    /// Returns `false` if the instance was collected. A copy that learns this
    /// from the owner marks itself collected.
    pub async fn acquire(&self, source: ReferenceSource) -> Result<bool> {
        if let Some(acquired) = self.acquire_local(source) {
            return Ok(acquired);
        }

        let response = self
            .context
            .request(self.owner, self.did, |request| MessageBody::AcquireRequest {
                request,
            })
            .await?;
        match response {
            Response::Acquire { granted: true, ack } => {
                {
                    let mut core = self.core.lock();
                    core.add_valid(source, 1, self.did, self.context.node_id());
                }
                if let Some(ack) = ack {
                    self.context
                        .send(self.owner, self.did, MessageBody::AcquireApplied { ack })?;
                }
                trace!(did = %self.did, %source, "acquired through owner");
                Ok(true)
            }
            Response::Acquire { granted: false, .. } => {
                debug!(did = %self.did, "owner denied acquire, instance was collected");
                self.mark_collected();
                Ok(false)
            }
            other => Err(unexpected("acquire", &other).into()),
        }
    }

    /// Acquire without messaging. `None` means only the owner can decide.
    pub fn acquire_local(&self, source: ReferenceSource) -> Option<bool> {
        let mut core = self.core.lock();
        match core.state {
            GcState::Collected => Some(false),
            GcState::PendingCollected if !self.is_owner() => None,
            _ => {
                core.add_valid(source, 1, self.did, self.context.node_id());
                Some(true)
            }
        }
    }

    /// Add references to a copy already known to be valid.
    pub fn add_valid_reference(&self, source: ReferenceSource, count: u64) {
        let became_valid = {
            let mut core = self.core.lock();
            core.add_valid(source, count, self.did, self.context.node_id())
        };
        if became_valid && !self.is_owner() && self.context.config().gc.verify_remote_acquires {
            self.verify_with_owner();
        }
    }

    /// Drop valid references. Returns `true` if the instance became collectable.
    pub fn remove_valid_reference(&self, source: ReferenceSource, count: u64) -> bool {
        let mut core = self.core.lock();
        core.remove_valid(source, count, self.did, self.context.node_id())
    }

    /// Count a valid reference carried away by an outgoing message.
    pub fn pack_valid_ref(&self) {
        let mut core = self.core.lock();
        debug_assert_eq!(core.state, GcState::Valid);
        core.sent_valid_references += 1;
    }

    /// Take ownership of a valid reference carried in by an incoming message.
    pub fn unpack_valid_ref(&self) {
        let mut core = self.core.lock();
        core.received_valid_references += 1;
        core.add_valid(ReferenceSource::Transfer, 1, self.did, self.context.node_id());
    }

    fn verify_with_owner(&self) {
        let Some(this) = self.arc() else {
            return;
        };
        self.context.spawn(async move {
            let did = this.did;
            let node = this.context.node_id();
            let response = this
                .context
                .request(this.owner, did, |request| MessageBody::GcDebugRequest {
                    request,
                })
                .await;
            match response {
                Ok(Response::GcDebug(true)) => {}
                Ok(Response::GcDebug(false)) => {
                    fatal_gc_race(did, node, "owner holds no valid reference for a valid remote copy")
                }
                Ok(other) => warn!(%did, response = other.name(), "unexpected gc debug response"),
                Err(e) => warn!(%did, "gc debug check failed: {}", e),
            }
        });
    }

    // ── Resource references ──

    pub fn add_resource_reference(&self, count: u64) {
        self.core.lock().resource_references += count;
    }

    /// Returns `true` when the last resource reference was removed.
    pub fn remove_resource_reference(&self, count: u64) -> bool {
        let released = {
            let mut core = self.core.lock();
            debug_assert!(core.resource_references >= count);
            core.resource_references = core.resource_references.saturating_sub(count);
            core.resource_references == 0
        };
        if released {
            self.release_if_unreferenced();
        }
        released
    }

    /// Unregister a collected manager that nothing references any more.
    pub(crate) fn release_if_unreferenced(&self) {
        let releasable = {
            let core = self.core.lock();
            core.state == GcState::Collected && core.resource_references == 0
        };
        let chain_settled = match &self.kind {
            ManagerKind::Collective(collective) => collective.is_settled(),
            _ => true,
        };
        if releasable && chain_settled {
            let directory = self.context.directory();
            // A newer manager may already hold the slot after a reannouncement
            if let crate::directory::Lookup::Found(current) = directory.find(self.did) {
                if std::ptr::eq(Arc::as_ptr(&current), self) {
                    directory.unregister(self.did);
                    debug!(did = %self.did, "released collected manager");
                }
            }
        }
    }

    // ── Collection ──

    /// Try to collect the instance.
    ///
    /// A non-owner forwards the attempt to the owner. On the owner, concurrent
    /// callers share one round; an acquire during the round makes them all fail.
    pub async fn collect(&self) -> Result<CollectOutcome> {
        if !self.is_owner() {
            let response = self
                .context
                .request(self.owner, self.did, |request| MessageBody::CollectRequest {
                    request,
                })
                .await?;
            return match response {
                Response::Collect(Some(done)) => Ok(CollectOutcome::Collected(done)),
                Response::Collect(None) => Ok(CollectOutcome::Denied),
                other => Err(unexpected("collect", &other).into()),
            };
        }

        let mut launch = None;
        let (round_id, ready, interrupt) = {
            let mut core = self.core.lock();
            match core.state {
                GcState::Valid => return Ok(CollectOutcome::Denied),
                GcState::Collected => {
                    let done = core
                        .collection_done
                        .clone()
                        .unwrap_or_else(CompletionHandle::ready);
                    return Ok(CollectOutcome::Collected(done));
                }
                GcState::Collectable => {
                    let guards = self.context.directory().remote_copy_set(self.did);
                    let ready = CompletionEvent::new();
                    let id = core.begin_round(ready.handle(), guards.len());
                    launch = Some((id, guards, ready));
                }
                GcState::PendingCollected => {}
            }
            let Some(round) = core.round.as_mut() else {
                return Ok(CollectOutcome::Denied);
            };
            round.pending_changes += 1;
            (round.id, round.ready.clone(), round.interrupt.handle())
        };

        if let Some((id, guards, ready)) = launch {
            debug!(did = %self.did, round = id, guards = guards.len(), "starting collection round");
            self.launch_guards(id, guards, ready);
        }

        tokio::select! {
            _ = ready.wait() => {}
            _ = interrupt.wait() => {}
        }
        Ok(self.conclude_collection(round_id))
    }

    fn launch_guards(&self, round: u64, guards: BTreeSet<NodeId>, ready: CompletionEvent) {
        if guards.is_empty() {
            ready.trigger();
            return;
        }
        let Some(this) = self.arc() else {
            ready.poison("manager dropped during collection");
            return;
        };

        let pending = self.context.pending();
        let mut awaiters = Vec::with_capacity(guards.len());
        for target in guards {
            let awaiter = pending.register();
            let request = awaiter.request_id();
            match self
                .context
                .send(target, self.did, MessageBody::AcquireGuardRequest { request })
            {
                Ok(()) => awaiters.push((target, awaiter)),
                Err(e) => {
                    // An unreachable copy never agrees, so the round cannot balance
                    pending.cancel(request);
                    warn!(did = %self.did, %target, "failed to send guard request: {}", e);
                }
            }
        }

        self.context.spawn(async move {
            let replies = futures::future::join_all(
                awaiters
                    .into_iter()
                    .map(|(target, awaiter)| async move { (target, awaiter.recv().await) }),
            )
            .await;
            for (target, reply) in replies {
                match reply {
                    Ok(Response::Guard(Some(guard))) => this.apply_guard(round, guard),
                    Ok(Response::Guard(None)) => {
                        debug!(did = %this.did, %target, round, "remote copy declined collection")
                    }
                    Ok(other) => {
                        warn!(did = %this.did, %target, response = other.name(), "unexpected guard response")
                    }
                    Err(e) => warn!(did = %this.did, %target, "guard request failed: {}", e),
                }
            }
            ready.trigger();
        });
    }

    fn apply_guard(&self, round: u64, guard: GuardState) {
        let mut core = self.core.lock();
        let Some(current) = core.round_mut(round) else {
            return;
        };
        current.remaining_guards = current.remaining_guards.saturating_sub(1);
        current.total_sent += guard.sent_valid_references;
        current.total_received += guard.received_valid_references;
        core.gc_events
            .extend(guard.gc_events.into_iter().filter(|event| !event.is_complete()));
    }

    fn conclude_collection(&self, round: u64) -> CollectOutcome {
        let (outcome, commit) = {
            let mut core = self.core.lock();
            match core.state {
                GcState::Collected => {
                    core.leave_round(round);
                    let done = core
                        .collection_done
                        .clone()
                        .unwrap_or_else(CompletionHandle::ready);
                    (CollectOutcome::Collected(done), None)
                }
                GcState::Valid | GcState::Collectable => {
                    core.leave_round(round);
                    (CollectOutcome::Denied, None)
                }
                GcState::PendingCollected => match core.round_mut(round).map(|r| r.balanced()) {
                    // Superseded by a newer round
                    None => (CollectOutcome::Denied, None),
                    Some(false) => {
                        if core.leave_round(round) == 0 {
                            core.state = GcState::Collectable;
                        }
                        (CollectOutcome::Denied, None)
                    }
                    Some(true) => {
                        core.state = GcState::Collected;
                        let done = CompletionEvent::new();
                        core.collection_done = Some(done.handle());
                        core.leave_round(round);
                        (CollectOutcome::Collected(done.handle()), Some(done))
                    }
                },
            }
        };

        match commit {
            Some(done) => {
                debug!(did = %self.did, round, "collected");
                let deleted = self.perform_deletion();
                done.trigger_after(&deleted);
                self.release_if_unreferenced();
            }
            None if !outcome.is_collected() => {
                trace!(did = %self.did, round, "collection denied");
            }
            None => {}
        }
        outcome
    }

    /// Mark this copy collected without running a round.
    ///
    /// Used when the owner already decided, and for chain teardown.
    pub(crate) fn mark_collected(&self) {
        let contexts = {
            let mut core = self.core.lock();
            core.state = GcState::Collected;
            if let Some(round) = core.round.take() {
                round.interrupt.trigger();
            }
            std::mem::take(&mut core.contexts)
        };
        self.notify_contexts(contexts);
        self.release_if_unreferenced();
    }

    pub(crate) fn take_gc_events(&self) -> Vec<CompletionHandle> {
        self.core.lock().take_gc_events()
    }

    // ── Owner-side handlers ──

    /// Grant or deny a remote acquire.
    ///
    /// A granted reference stays held on the owner until the requester
    /// confirms its own reference, so no collection can slip in between.
    pub(crate) async fn handle_remote_acquire(&self, source: NodeId, request: RequestId) -> Result<()> {
        let granted = self
            .acquire_local(ReferenceSource::RemoteAcquire)
            .unwrap_or(false);
        if !granted {
            self.context.send(
                source,
                self.did,
                MessageBody::AcquireResponse {
                    request,
                    granted: false,
                    ack: None,
                },
            )?;
            return Ok(());
        }

        let pending = self.context.pending();
        let applied = pending.register();
        let ack = applied.request_id();
        let sent = self.context.send(
            source,
            self.did,
            MessageBody::AcquireResponse {
                request,
                granted: true,
                ack: Some(ack),
            },
        );
        if let Err(e) = sent {
            pending.cancel(ack);
            self.remove_valid_reference(ReferenceSource::RemoteAcquire, 1);
            return Err(e.into());
        }

        let applied = applied.recv().await;
        self.remove_valid_reference(ReferenceSource::RemoteAcquire, 1);
        applied?;
        Ok(())
    }

    /// Whether this copy agrees to a collection attempt from `source`.
    pub(crate) fn handle_guard_request(&self, source: NodeId) -> Option<GuardState> {
        let mut core = self.core.lock();
        if !core.can_collect(self.is_owner(), source == self.owner) {
            return None;
        }
        Some(GuardState {
            gc_events: core.pack_gc_events(),
            sent_valid_references: core.sent_valid_references,
            received_valid_references: core.received_valid_references,
        })
    }

    /// Owner check that a remote valid reference is legitimate.
    pub(crate) fn handle_gc_debug(&self) -> bool {
        match self.acquire_local(ReferenceSource::Internal) {
            Some(true) => {
                self.remove_valid_reference(ReferenceSource::Internal, 1);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn handle_record_use(&self, event: CompletionHandle) {
        let epoch_size = self.context.config().gc.epoch_size;
        self.core.lock().record_use(event, epoch_size);
    }

    /// Apply a priority forwarded by `source` under the owner's bookkeeping key.
    pub(crate) async fn handle_priority_update(&self, source: NodeId, priority: GcPriority) -> Result<()> {
        let processor = ProcessorId(u64::from(source.0) + u64::from(self.owner.0));
        self.set_priority(MapperId(0), processor, priority).await
    }

    // ── Priorities ──

    /// Set the GC priority for one `(mapper, processor)` pair.
    ///
    /// Updates apply in call order. On the owner, a minimum of
    /// [`GcPriority::NEVER_GC`] pins the instance with a valid reference.
    pub async fn set_priority(
        &self,
        mapper: MapperId,
        processor: ProcessorId,
        priority: GcPriority,
    ) -> Result<()> {
        let done = CompletionEvent::new();
        let previous = {
            let mut core = self.core.lock();
            std::mem::replace(&mut core.priority_baton, done.handle())
        };
        // A poisoned predecessor still releases the baton
        let _ = previous.wait().await;

        let result = self.apply_priority(mapper, processor, priority).await;
        done.trigger();
        result
    }

    async fn apply_priority(
        &self,
        mapper: MapperId,
        processor: ProcessorId,
        priority: GcPriority,
    ) -> Result<()> {
        let change = {
            let mut core = self.core.lock();
            core.update_priority((mapper, processor), priority)
        };
        let Some((old, new)) = change else {
            return Ok(());
        };
        trace!(did = %self.did, %old, %new, "minimum gc priority changed");

        // Only the owner holds the pin
        let owner = self.is_owner();
        if owner
            && new.is_never()
            && !old.is_never()
            && self.acquire(ReferenceSource::NeverGc).await?
        {
            self.core.lock().pinned = true;
        }

        let result = self.forward_priority(new).await;

        if owner && old.is_never() && !new.is_never() {
            let pinned = std::mem::take(&mut self.core.lock().pinned);
            if pinned {
                self.remove_valid_reference(ReferenceSource::NeverGc, 1);
            }
        }
        result
    }

    async fn forward_priority(&self, priority: GcPriority) -> Result<()> {
        if let ManagerKind::Virtual(_) = self.kind {
            return Ok(());
        }
        if self.is_owner() {
            self.context.allocator().set_gc_priority(self.did, priority);
            return Ok(());
        }
        let response = self
            .context
            .request(self.owner, self.did, |request| MessageBody::PriorityUpdate {
                request,
                priority,
            })
            .await?;
        match response {
            Response::PriorityDone => Ok(()),
            other => Err(unexpected("priority_done", &other).into()),
        }
    }

    // ── Uses ──

    /// Record an outstanding use that must finish before physical deletion.
    ///
    /// A copy that already agreed to a pending collection also forwards the
    /// use to the owner, which may commit without asking it again.
    pub async fn record_instance_user(&self, event: CompletionHandle) -> Result<()> {
        let forward = {
            let mut core = self.core.lock();
            let forward = !self.is_owner() && core.state == GcState::PendingCollected;
            core.record_use(event.clone(), self.context.config().gc.epoch_size);
            forward
        };
        if !forward || event.is_complete() {
            return Ok(());
        }
        let response = self
            .context
            .request(self.owner, self.did, |request| MessageBody::RecordUse {
                request,
                event,
            })
            .await?;
        match response {
            Response::RecordUseDone => Ok(()),
            other => Err(unexpected("record_use_done", &other).into()),
        }
    }

    // ── Remote copies ──

    /// Announce this manager to `target` so it can build a remote copy.
    pub fn send_manager(&self, target: NodeId) -> Result<()> {
        if target == self.context.node_id() {
            return Ok(());
        }
        if !self.is_owner() {
            bail!("{} can only be announced by its owner {}", self.did, self.owner);
        }
        match &self.kind {
            ManagerKind::Individual(individual) => individual.send_announcement(self, target),
            _ => {
                self.context.directory().add_remote_copy(self.did, target);
                let announcement = self.pack_announcement();
                self.context.send(
                    target,
                    self.did,
                    MessageBody::ManagerAnnouncement(Box::new(announcement)),
                )?;
                Ok(())
            }
        }
    }

    // ── Active contexts ──

    /// The view `context` caches for this instance, created on first use.
    ///
    /// Each registered context holds one resource reference.
    pub fn find_or_create_view(&self, context: Arc<dyn InstanceContext>) -> InstanceView {
        let mut core = self.core.lock();
        let id = context.context_id();
        if let Some(active) = core.contexts.get_mut(&id) {
            active.references += 1;
            return active.view.clone();
        }
        let view = InstanceView {
            did: self.did,
            context: id,
            redop: self.redop,
        };
        core.contexts.insert(
            id,
            ActiveContext {
                context,
                view: view.clone(),
                references: 1,
            },
        );
        core.resource_references += 1;
        view
    }

    /// Drop one registration of `context`. Returns `true` if it was the last.
    pub fn unregister_active_context(&self, context: ContextId) -> bool {
        let removed = {
            let mut core = self.core.lock();
            match core.contexts.get_mut(&context) {
                Some(active) if active.references > 1 => {
                    active.references -= 1;
                    false
                }
                Some(_) => core.contexts.remove(&context).is_some(),
                None => false,
            }
        };
        if removed {
            self.remove_resource_reference(1);
        }
        removed
    }

    pub(crate) fn take_active_contexts(&self) -> BTreeMap<ContextId, ActiveContext> {
        std::mem::take(&mut self.core.lock().contexts)
    }

    /// Tell every context its views are gone and drop their resource references.
    pub(crate) fn notify_contexts(&self, contexts: BTreeMap<ContextId, ActiveContext>) {
        if contexts.is_empty() {
            return;
        }
        let count = contexts.len() as u64;
        for active in contexts.into_values() {
            active.context.notify_instance_deletion(self.did);
        }
        self.remove_resource_reference(count);
    }

    /// Merge the outstanding uses into one precondition for deletion.
    pub(crate) fn outstanding_uses_precondition(&self) -> CompletionHandle {
        merge_completions(self.take_gc_events())
    }
}
