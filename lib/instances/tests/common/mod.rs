// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Common test utilities for multi-node instance tests.

#![allow(dead_code)]

use dynamo_instances::layout::{Domain, FieldConstraint, FieldSpace, LayoutConstraintSet, OrderingConstraint};
use dynamo_instances::{
    BuildOutcome, Did, InProcessFabric, InstanceBuilder, InstanceManager, InstanceNode,
    InstancesConfig, MemoryId, MemoryPoolAllocator, NodeId,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

pub const MEMORY: MemoryId = MemoryId(1);
pub const ELEMENTS: u64 = 16;

/// N nodes connected by one in-process fabric and sharing one allocator.
pub struct Cluster {
    pub fabric: InProcessFabric,
    pub allocator: MemoryPoolAllocator,
    pub nodes: Vec<Arc<InstanceNode>>,
}

impl Cluster {
    pub fn new(n: u32) -> Self {
        Self::with_config(n, InstancesConfig::default())
    }

    pub fn with_config(n: u32, config: InstancesConfig) -> Self {
        let fabric = InProcessFabric::new();
        let allocator = MemoryPoolAllocator::new().with_memory(MEMORY, 1 << 20);
        let nodes = (0..n)
            .map(|i| {
                let inbox = fabric.connect(NodeId(i));
                let node = InstanceNode::new(
                    NodeId(i),
                    Arc::new(fabric.clone()),
                    Arc::new(allocator.clone()),
                    config.clone(),
                );
                node.start(inbox);
                node
            })
            .collect();
        Self {
            fabric,
            allocator,
            nodes,
        }
    }

    pub fn node(&self, index: usize) -> &Arc<InstanceNode> {
        &self.nodes[index]
    }

    /// A two-field instance owned by `owner`.
    pub fn create_instance(&self, owner: usize) -> Arc<InstanceManager> {
        match self.node(owner).create_physical_instance(&builder()) {
            Ok(BuildOutcome::Created(manager)) => manager,
            other => panic!("instance creation failed: {other:?}"),
        }
    }

    /// The copy of `did` on node `index`, requested from the owner if needed.
    pub async fn copy_on(&self, index: usize, did: Did) -> Arc<InstanceManager> {
        within(self.node(index).find_or_request_manager(did))
            .await
            .expect("remote copy")
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            within(node.shutdown()).await;
        }
    }
}

pub fn field_space() -> FieldSpace {
    FieldSpace::new().with_field(1, 8).with_field(2, 4)
}

pub fn builder() -> InstanceBuilder {
    let constraints = LayoutConstraintSet::builder()
        .fields(FieldConstraint::new([1, 2]))
        .ordering(OrderingConstraint::soa(1))
        .build()
        .expect("constraints");
    InstanceBuilder::new(&[Domain::dense([ELEMENTS])], &field_space(), constraints, MEMORY)
        .expect("builder")
}

/// Await `future`, failing the test if it does not finish in five seconds.
pub async fn within<F: Future>(future: F) -> F::Output {
    timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Poll `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
}
