// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::{Cluster, MEMORY, builder, eventually, within};
use dynamo_instances::{
    Allocator, CompletionEvent, EventStatus, GcState, IndividualKind, InstanceManager,
    ReferenceSource,
};
use std::sync::Arc;

fn unbound(cluster: &Cluster, producer: &CompletionEvent) -> Arc<InstanceManager> {
    let layout = builder().compute_layout().expect("layout");
    cluster
        .node(0)
        .create_unbound_instance(layout, MEMORY, Some(producer.handle()))
}

// ── Deferred binding ──

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn only_the_producer_uses_an_unbound_instance() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    let producer = CompletionEvent::new();
    let manager = unbound(&cluster, &producer);

    assert_eq!(manager.resource_references(), 1);
    assert!(manager.get_use_event(Some(&producer.handle())).is_complete());
    let consumer = manager.get_use_event(None);
    assert!(!consumer.is_complete());

    let layout = builder().compute_layout()?;
    let allocation = cluster.allocator.create(&layout, MEMORY)?;
    manager.bind(allocation, IndividualKind::Internal, layout.footprint())?;

    within(consumer.wait()).await?;
    assert_eq!(manager.resource_references(), 0);
    assert!(manager.bind(allocation, IndividualKind::Internal, layout.footprint()).is_err());
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn binding_reaches_remote_copies() -> anyhow::Result<()> {
    let cluster = Cluster::new(2);
    let producer = CompletionEvent::new();
    let owner = unbound(&cluster, &producer);
    let remote = cluster.copy_on(1, owner.did()).await;

    let individual = remote.as_individual().expect("individual");
    assert!(!individual.is_bound());
    assert_eq!(remote.resource_references(), 1);

    let layout = builder().compute_layout()?;
    let allocation = cluster.allocator.create(&layout, MEMORY)?;
    // The producer reports the size it actually allocated
    let bound_footprint = layout.footprint() * 2;
    owner.bind(allocation, IndividualKind::Internal, bound_footprint)?;
    assert_eq!(owner.footprint(), bound_footprint);

    eventually(|| individual.is_bound() && remote.resource_references() == 0).await;
    assert_eq!(individual.allocation(), Some(allocation));
    assert_eq!(remote.footprint(), bound_footprint);
    within(remote.get_use_event(None).wait()).await?;
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn collecting_unbound_instance_waits_for_binding() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    let producer = CompletionEvent::new();
    let manager = unbound(&cluster, &producer);

    let outcome = within(manager.collect()).await?;
    let done = outcome.completion().expect("collected").clone();
    assert_eq!(manager.gc_state(), GcState::Collected);
    assert!(!done.is_complete());
    // Still referenced by the pending binding
    assert!(cluster.node(0).find_manager(manager.did()).is_some());

    let layout = builder().compute_layout()?;
    let allocation = cluster.allocator.create(&layout, MEMORY)?;
    manager.bind(allocation, IndividualKind::Internal, layout.footprint())?;

    within(done.wait()).await?;
    assert_eq!(cluster.allocator.stats().destroyed, 1);
    assert!(cluster.node(0).find_manager(manager.did()).is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn force_deleting_unbound_instance_poisons_uses() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    let producer = CompletionEvent::new();
    let manager = unbound(&cluster, &producer);
    let consumer = manager.get_use_event(None);

    manager.force_deletion();
    assert_eq!(manager.gc_state(), GcState::Collected);
    assert_eq!(consumer.status(), EventStatus::Poisoned);
    assert!(within(consumer.wait()).await.is_err());
    Ok(())
}

// ── External attachments ──

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn detach_returns_storage_to_the_application() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    let layout = builder().compute_layout()?;
    let allocation = cluster.allocator.create(&layout, MEMORY)?;
    let manager = cluster.node(0).attach_external_instance(layout, allocation);
    assert_eq!(cluster.allocator.stats().attached, 1);

    assert!(manager.acquire(ReferenceSource::Mapper).await?);
    assert!(manager.detach_external().await.is_err());
    manager.remove_valid_reference(ReferenceSource::Mapper, 1);

    let done = manager.detach_external().await?;
    within(done.wait()).await?;
    let stats = cluster.allocator.stats();
    assert_eq!(stats.detached, 1);
    assert_eq!(stats.destroyed, 0);
    assert!(cluster.allocator.is_live(allocation));
    assert_eq!(manager.gc_state(), GcState::Collected);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn internal_instances_cannot_be_detached() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    let manager = cluster.create_instance(0);
    assert!(manager.detach_external().await.is_err());
    assert_ne!(manager.gc_state(), GcState::Collected);
    cluster.shutdown().await;
    Ok(())
}
