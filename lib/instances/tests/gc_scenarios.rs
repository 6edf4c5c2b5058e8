// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::{Cluster, eventually, within};
use dynamo_instances::{
    CollectOutcome, CompletionEvent, ContextId, Did, GcPriority, GcState, InstanceContext,
    MapperId, NodeId, PhysicalManager, ProcessorId, ReferenceSource,
};
use parking_lot::Mutex;
use std::sync::Arc;

// ── Single node ──

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn collect_then_acquire_is_denied() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    let manager = cluster.create_instance(0);

    assert!(manager.acquire(ReferenceSource::Mapper).await?);
    assert_eq!(manager.gc_state(), GcState::Valid);
    assert!(manager.remove_valid_reference(ReferenceSource::Mapper, 1));
    assert_eq!(manager.gc_state(), GcState::Collectable);

    let outcome = within(manager.collect()).await?;
    let done = outcome.completion().expect("collected").clone();
    within(done.wait()).await?;

    assert_eq!(manager.gc_state(), GcState::Collected);
    assert!(!manager.acquire(ReferenceSource::Mapper).await?);
    assert_eq!(cluster.allocator.stats().destroyed, 1);
    assert_eq!(cluster.allocator.stats().live, 0);
    assert!(cluster.node(0).find_manager(manager.did()).is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn valid_instance_is_not_collected() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    let manager = cluster.create_instance(0);

    assert!(manager.acquire(ReferenceSource::Task).await?);
    assert!(matches!(within(manager.collect()).await?, CollectOutcome::Denied));
    assert_eq!(manager.gc_state(), GcState::Valid);
    assert!(manager.check_valid_invariant());
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_gc_priority_pins_instance() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    let manager = cluster.create_instance(0);
    let key = (MapperId(1), ProcessorId(1));

    manager.set_priority(key.0, key.1, GcPriority::NEVER_GC).await?;
    assert_eq!(manager.gc_state(), GcState::Valid);
    assert_eq!(manager.valid_references(), 1);
    assert!(matches!(within(manager.collect()).await?, CollectOutcome::Denied));

    manager.set_priority(key.0, key.1, GcPriority(5)).await?;
    assert_eq!(manager.valid_references(), 0);
    assert_eq!(manager.min_priority(), GcPriority(5));
    assert_eq!(cluster.allocator.gc_priority(manager.did()), Some(GcPriority(5)));

    assert!(within(manager.collect()).await?.is_collected());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_priority_updates_apply_in_order() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    let manager = cluster.create_instance(0);

    let updates = (0..8).map(|i| {
        let manager = Arc::clone(&manager);
        async move {
            manager
                .set_priority(MapperId(1), ProcessorId(i), GcPriority(-(i as i32)))
                .await
        }
    });
    for result in futures::future::join_all(updates).await {
        result?;
    }
    assert_eq!(manager.min_priority(), GcPriority(-7));
    assert_eq!(cluster.allocator.gc_priority(manager.did()), Some(GcPriority(-7)));
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn outstanding_use_delays_deletion() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    let manager = cluster.create_instance(0);
    let user = CompletionEvent::new();
    manager.record_instance_user(user.handle()).await?;
    assert_eq!(manager.outstanding_uses(), 1);

    let outcome = within(manager.collect()).await?;
    let done = outcome.completion().expect("collected").clone();
    assert!(!done.is_complete());
    assert_eq!(cluster.allocator.stats().live, 1);

    user.trigger();
    within(done.wait()).await?;
    assert_eq!(cluster.allocator.stats().live, 0);
    Ok(())
}

#[derive(Default)]
struct RecordingContext {
    deleted: Mutex<Vec<Did>>,
}

impl InstanceContext for RecordingContext {
    fn context_id(&self) -> ContextId {
        ContextId(11)
    }

    fn notify_instance_deletion(&self, did: Did) {
        self.deleted.lock().push(did);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deletion_notifies_active_contexts_once() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    let manager = cluster.create_instance(0);
    let context = Arc::new(RecordingContext::default());

    let first = manager.find_or_create_view(context.clone());
    let second = manager.find_or_create_view(context.clone());
    assert_eq!(first, second);
    assert_eq!(manager.resource_references(), 1);
    assert!(!manager.unregister_active_context(ContextId(11)));
    assert_eq!(manager.active_context_count(), 1);

    assert!(within(manager.collect()).await?.is_collected());
    assert_eq!(context.deleted.lock().as_slice(), &[manager.did()]);
    assert_eq!(manager.resource_references(), 0);
    assert!(cluster.node(0).find_manager(manager.did()).is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn virtual_manager_is_never_collected() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    let manager = cluster.node(0).create_virtual_manager();

    assert_eq!(manager.footprint(), 0);
    assert_eq!(manager.gc_state(), GcState::Valid);
    assert!(matches!(within(manager.collect()).await?, CollectOutcome::Denied));
    assert!(manager.perform_deletion().has_triggered());
    cluster.shutdown().await;
    assert_eq!(manager.gc_state(), GcState::Valid);
    Ok(())
}

// ── Across nodes ──

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_copy_agrees_to_collection() -> anyhow::Result<()> {
    let cluster = Cluster::new(2);
    let owner = cluster.create_instance(0);
    let remote = cluster.copy_on(1, owner.did()).await;
    assert_eq!(remote.gc_state(), GcState::Collectable);
    assert!(!remote.is_owner());

    let outcome = within(remote.collect()).await?;
    assert!(outcome.is_collected());
    assert_eq!(owner.gc_state(), GcState::Collected);

    // The owner released the instance, so the stale copy learns it is gone
    assert!(!within(remote.acquire(ReferenceSource::Mapper)).await?);
    assert_eq!(remote.gc_state(), GcState::Collected);
    assert!(cluster.node(1).find_manager(owner.did()).is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_acquire_during_guard_round_denies_collection() -> anyhow::Result<()> {
    let cluster = Cluster::new(2);
    let owner = cluster.create_instance(0);
    let remote = cluster.copy_on(1, owner.did()).await;

    cluster.fabric.hold(NodeId(1));
    let collect = tokio::spawn({
        let owner = Arc::clone(&owner);
        async move { owner.collect().await }
    });
    eventually(|| cluster.fabric.held_count(NodeId(1)) == 1).await;
    assert_eq!(owner.gc_state(), GcState::PendingCollected);

    // The guard request has not reached the remote copy yet
    assert!(within(remote.acquire(ReferenceSource::Mapper)).await?);
    cluster.fabric.release(NodeId(1));

    assert!(matches!(within(collect).await??, CollectOutcome::Denied));
    assert_ne!(owner.gc_state(), GcState::Collected);
    assert_eq!(remote.gc_state(), GcState::Valid);
    assert_eq!(cluster.allocator.stats().live, 1);
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn owner_acquire_interrupts_pending_round() -> anyhow::Result<()> {
    let cluster = Cluster::new(2);
    let owner = cluster.create_instance(0);
    cluster.copy_on(1, owner.did()).await;

    cluster.fabric.hold(NodeId(1));
    let collect = tokio::spawn({
        let owner = Arc::clone(&owner);
        async move { owner.collect().await }
    });
    eventually(|| owner.gc_state() == GcState::PendingCollected).await;

    assert_eq!(owner.acquire_local(ReferenceSource::Task), Some(true));
    assert!(matches!(within(collect).await??, CollectOutcome::Denied));
    assert_eq!(owner.gc_state(), GcState::Valid);
    assert!(owner.check_valid_invariant());

    cluster.fabric.release(NodeId(1));
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_collects_share_one_round() -> anyhow::Result<()> {
    let cluster = Cluster::new(2);
    let owner = cluster.create_instance(0);
    cluster.copy_on(1, owner.did()).await;

    let attempts: Vec<_> = (0..4)
        .map(|_| {
            let owner = Arc::clone(&owner);
            tokio::spawn(async move { owner.collect().await })
        })
        .collect();
    let mut handles = Vec::new();
    for attempt in attempts {
        if let CollectOutcome::Collected(done) = within(attempt).await?? {
            handles.push(done);
        }
    }
    assert_eq!(handles.len(), 4);
    assert!(handles.iter().all(|h| h.same_as(&handles[0])));
    within(handles[0].wait()).await?;
    assert_eq!(cluster.allocator.stats().destroyed, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_valid_reference_blocks_collection() -> anyhow::Result<()> {
    let cluster = Cluster::new(2);
    let owner = cluster.create_instance(0);
    let remote = cluster.copy_on(1, owner.did()).await;

    // A reference leaves the owner inside a message that has not been unpacked
    assert!(owner.acquire(ReferenceSource::Task).await?);
    owner.pack_valid_ref();
    owner.remove_valid_reference(ReferenceSource::Task, 1);

    assert!(matches!(within(owner.collect()).await?, CollectOutcome::Denied));
    assert_eq!(owner.gc_state(), GcState::Collectable);

    remote.unpack_valid_ref();
    assert_eq!(remote.gc_state(), GcState::Valid);
    assert_eq!(remote.transfer_counts(), (0, 1));
    remote.remove_valid_reference(ReferenceSource::Transfer, 1);

    assert!(within(owner.collect()).await?.is_collected());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_priority_is_applied_by_owner() -> anyhow::Result<()> {
    let cluster = Cluster::new(2);
    let owner = cluster.create_instance(0);
    let remote = cluster.copy_on(1, owner.did()).await;

    within(remote.set_priority(MapperId(4), ProcessorId(9), GcPriority(-3))).await?;
    assert_eq!(remote.min_priority(), GcPriority(-3));
    assert_eq!(owner.priority_of(MapperId(0), ProcessorId(1)), Some(GcPriority(-3)));
    assert_eq!(owner.min_priority(), GcPriority(-3));
    assert_eq!(cluster.allocator.gc_priority(owner.did()), Some(GcPriority(-3)));
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_never_gc_pins_only_the_owner() -> anyhow::Result<()> {
    let cluster = Cluster::new(2);
    let owner = cluster.create_instance(0);
    let remote = cluster.copy_on(1, owner.did()).await;
    let key = (MapperId(1), ProcessorId(1));

    within(remote.set_priority(key.0, key.1, GcPriority::NEVER_GC)).await?;
    assert_eq!(remote.min_priority(), GcPriority::NEVER_GC);
    assert_eq!(remote.valid_references(), 0);
    assert_eq!(remote.gc_state(), GcState::Collectable);
    assert_eq!(owner.valid_references(), 1);
    assert_eq!(owner.gc_state(), GcState::Valid);
    assert!(matches!(within(owner.collect()).await?, CollectOutcome::Denied));

    within(remote.set_priority(key.0, key.1, GcPriority(5))).await?;
    assert_eq!(remote.valid_references(), 0);
    assert_eq!(owner.valid_references(), 0);
    assert_eq!(owner.min_priority(), GcPriority(5));
    assert!(within(owner.collect()).await?.is_collected());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_use_is_forwarded_while_pending() -> anyhow::Result<()> {
    let cluster = Cluster::new(2);
    let owner = cluster.create_instance(0);
    let remote = cluster.copy_on(1, owner.did()).await;

    // Leave the remote copy pending after a denied round
    assert!(owner.acquire(ReferenceSource::Task).await?);
    owner.pack_valid_ref();
    owner.remove_valid_reference(ReferenceSource::Task, 1);
    assert!(matches!(within(owner.collect()).await?, CollectOutcome::Denied));
    assert_eq!(remote.gc_state(), GcState::PendingCollected);

    let user = CompletionEvent::new();
    within(remote.record_instance_user(user.handle())).await?;
    assert_eq!(owner.outstanding_uses(), 1);
    user.trigger();
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manager_is_usable_through_capability_trait() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    let manager: Arc<dyn PhysicalManager> = cluster.create_instance(0);

    assert_eq!(manager.owner_node(), NodeId(0));
    assert!(manager.acquire(ReferenceSource::Context).await?);
    assert!(manager.remove_valid_reference(ReferenceSource::Context, 1));
    assert!(within(manager.collect()).await?.is_collected());
    assert_eq!(manager.gc_state(), GcState::Collected);
    Ok(())
}
