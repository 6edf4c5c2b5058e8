// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lock-protected garbage-collection state shared by every manager variant.

use std::collections::BTreeMap;

use strum::Display;

use super::contexts::ActiveContext;
use crate::error::fatal_gc_race;
use crate::events::{CompletionEvent, CompletionHandle};
use crate::types::{ContextId, Did, GcPriority, MapperId, NodeId, ProcessorId};

/// Garbage-collection state of one distributed instance.
///
/// ```text
/// COLLECTABLE ──acquire──▶ VALID ──last reference removed──▶ COLLECTABLE
/// COLLECTABLE ──collect──▶ PENDING_COLLECTED ──guards agree──▶ COLLECTED
/// PENDING_COLLECTED ──acquire (owner) / attempt fails──▶ VALID / COLLECTABLE
/// ```
///
/// `Collected` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum GcState {
    Collectable,
    Valid,
    PendingCollected,
    Collected,
}

impl GcState {
    /// State announced to a new remote copy.
    pub fn packed(self) -> GcState {
        match self {
            GcState::Valid | GcState::Collectable => GcState::Collectable,
            other => other,
        }
    }
}

/// Who holds a valid reference. Tracked per source only when
/// `gc.debug_references` is enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ReferenceSource {
    Mapper,
    Task,
    Context,
    /// Granted to a remote node by the owner while the grant is in flight.
    RemoteAcquire,
    /// Transferred from another node with a message.
    Transfer,
    /// Pin held while the minimum priority is [`GcPriority::NEVER_GC`].
    NeverGc,
    Internal,
}

/// One owner-side collection attempt.
pub(crate) struct CollectionRound {
    pub(crate) id: u64,
    /// `collect()` callers waiting on this round.
    pub(crate) pending_changes: u32,
    /// Remote copies that have not agreed to the collection.
    pub(crate) remaining_guards: usize,
    pub(crate) total_sent: u64,
    pub(crate) total_received: u64,
    pub(crate) ready: CompletionHandle,
    /// Fired when a competing acquire makes the instance valid again.
    pub(crate) interrupt: CompletionEvent,
}

impl CollectionRound {
    pub(crate) fn balanced(&self) -> bool {
        self.remaining_guards == 0 && self.total_sent == self.total_received
    }
}

pub(crate) struct GcCore {
    pub(crate) state: GcState,
    pub(crate) valid_references: u64,
    pub(crate) resource_references: u64,
    pub(crate) detailed_references: Option<BTreeMap<ReferenceSource, u64>>,
    pub(crate) sent_valid_references: u64,
    pub(crate) received_valid_references: u64,
    pub(crate) round: Option<CollectionRound>,
    next_round: u64,
    pub(crate) collection_done: Option<CompletionHandle>,
    pub(crate) gc_events: Vec<CompletionHandle>,
    added_gc_events: usize,
    pub(crate) contexts: BTreeMap<ContextId, ActiveContext>,
    pub(crate) priorities: BTreeMap<(MapperId, ProcessorId), GcPriority>,
    pub(crate) min_priority: GcPriority,
    pub(crate) priority_baton: CompletionHandle,
    /// A [`ReferenceSource::NeverGc`] reference is held.
    pub(crate) pinned: bool,
}

impl GcCore {
    pub(crate) fn new(state: GcState, debug_references: bool) -> Self {
        Self {
            state,
            valid_references: 0,
            resource_references: 0,
            detailed_references: debug_references.then(BTreeMap::new),
            sent_valid_references: 0,
            received_valid_references: 0,
            round: None,
            next_round: 0,
            collection_done: None,
            gc_events: Vec::new(),
            added_gc_events: 0,
            contexts: BTreeMap::new(),
            priorities: BTreeMap::new(),
            min_priority: GcPriority::DEFAULT,
            priority_baton: CompletionHandle::ready(),
            pinned: false,
        }
    }

    /// Add valid references, making the instance valid on the 0→1 transition.
    ///
    /// Returns `true` on that transition.
    pub(crate) fn add_valid(
        &mut self,
        source: ReferenceSource,
        count: u64,
        did: Did,
        node: NodeId,
    ) -> bool {
        let became_valid = self.valid_references == 0 && count > 0;
        if became_valid {
            self.notify_valid(did, node);
        }
        self.valid_references += count;
        if let Some(detailed) = self.detailed_references.as_mut() {
            *detailed.entry(source).or_default() += count;
        }
        became_valid
    }

    /// Remove valid references. Returns `true` if the instance became collectable.
    pub(crate) fn remove_valid(
        &mut self,
        source: ReferenceSource,
        count: u64,
        did: Did,
        node: NodeId,
    ) -> bool {
        if count > self.valid_references {
            fatal_gc_race(did, node, "valid reference count underflow");
        }
        if let Some(detailed) = self.detailed_references.as_mut() {
            let held = detailed.entry(source).or_default();
            if *held < count {
                fatal_gc_race(did, node, &format!("{source} released more references than it holds"));
            }
            *held -= count;
            if *held == 0 {
                detailed.remove(&source);
            }
        }
        self.valid_references -= count;
        if self.valid_references == 0 && count > 0 {
            self.notify_invalid();
            return true;
        }
        false
    }

    fn notify_valid(&mut self, did: Did, node: NodeId) {
        if self.state == GcState::Collected {
            fatal_gc_race(did, node, "valid reference added to a collected instance");
        }
        self.state = GcState::Valid;
        if let Some(round) = self.round.as_ref() {
            round.interrupt.trigger();
        }
    }

    fn notify_invalid(&mut self) {
        debug_assert_eq!(self.state, GcState::Valid);
        self.state = GcState::Collectable;
    }

    /// Whether this copy agrees to a collection requested by `source`.
    ///
    /// A non-owner copy asked by the owner moves to `PendingCollected`, so later
    /// acquires on it must go through the owner.
    pub(crate) fn can_collect(&mut self, is_owner: bool, source_is_owner: bool) -> bool {
        match self.state {
            GcState::Valid | GcState::Collected => false,
            _ => {
                if !is_owner && source_is_owner {
                    self.state = GcState::PendingCollected;
                }
                true
            }
        }
    }

    /// Start a collection round; the caller must already hold `PendingCollected`
    /// preconditions (state `Collectable`).
    pub(crate) fn begin_round(&mut self, ready: CompletionHandle, remote_copies: usize) -> u64 {
        debug_assert_eq!(self.state, GcState::Collectable);
        self.state = GcState::PendingCollected;
        self.next_round += 1;
        let id = self.next_round;
        if let Some(previous) = self.round.take() {
            previous.interrupt.trigger();
        }
        self.round = Some(CollectionRound {
            id,
            pending_changes: 0,
            remaining_guards: remote_copies,
            total_sent: self.sent_valid_references,
            total_received: self.received_valid_references,
            ready,
            interrupt: CompletionEvent::new(),
        });
        id
    }

    pub(crate) fn round_mut(&mut self, id: u64) -> Option<&mut CollectionRound> {
        self.round.as_mut().filter(|round| round.id == id)
    }

    /// A `collect()` caller leaves round `id`. Returns the remaining callers.
    pub(crate) fn leave_round(&mut self, id: u64) -> u32 {
        let Some(round) = self.round_mut(id) else {
            return 0;
        };
        round.pending_changes = round.pending_changes.saturating_sub(1);
        let remaining = round.pending_changes;
        if remaining == 0 {
            if let Some(round) = self.round.take() {
                round.interrupt.trigger();
            }
        }
        remaining
    }

    /// Record an outstanding use, compacting finished uses every `epoch_size` additions.
    pub(crate) fn record_use(&mut self, event: CompletionHandle, epoch_size: usize) {
        if event.has_triggered() {
            return;
        }
        self.gc_events.push(event);
        self.added_gc_events += 1;
        if self.added_gc_events >= epoch_size {
            self.gc_events.retain(|event| !event.is_complete());
            self.added_gc_events = 0;
        }
    }

    pub(crate) fn take_gc_events(&mut self) -> Vec<CompletionHandle> {
        self.added_gc_events = 0;
        std::mem::take(&mut self.gc_events)
    }

    /// Outstanding uses reported to the owner in a guard reply.
    pub(crate) fn pack_gc_events(&self) -> Vec<CompletionHandle> {
        if self.state == GcState::PendingCollected {
            self.gc_events.clone()
        } else {
            Vec::new()
        }
    }

    /// Update one priority entry. Returns `(old_min, new_min)` if the minimum changed.
    pub(crate) fn update_priority(
        &mut self,
        key: (MapperId, ProcessorId),
        priority: GcPriority,
    ) -> Option<(GcPriority, GcPriority)> {
        let old_min = self.min_priority;
        let previous = self.priorities.insert(key, priority);
        if previous == Some(priority) {
            return None;
        }
        let new_min = if priority < old_min {
            priority
        } else if previous == Some(old_min) {
            // The entry holding the minimum was raised
            self.priorities
                .values()
                .copied()
                .min()
                .unwrap_or(priority)
        } else {
            old_min
        };
        if new_min == old_min {
            return None;
        }
        self.min_priority = new_min;
        Some((old_min, new_min))
    }
}
