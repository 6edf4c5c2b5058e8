// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Allocation collaborator.
//!
//! The [`Allocator`] turns a layout and a target memory into a physical
//! allocation handle. [`MemoryPoolAllocator`] is a capacity-accounting
//! implementation backed by per-memory pools.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{AllocationFailure, ConstraintKind};
use crate::events::{CompletionEvent, CompletionHandle};
use crate::layout::{DestroyedField, LayoutDescription};
use crate::types::{Did, GcPriority, MemoryId};

/// Opaque handle of one physical allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationHandle {
    pub id: u64,
    pub memory: MemoryId,
}

impl fmt::Display for AllocationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alloc{}@{}", self.id, self.memory)
    }
}

/// Source of physical allocations.
pub trait Allocator: Send + Sync {
    /// Allocate storage for `layout` in `memory`.
    fn create(
        &self,
        layout: &LayoutDescription,
        memory: MemoryId,
    ) -> Result<AllocationHandle, AllocationFailure>;

    /// Free an allocation once `after` completes, running custom destructors
    /// for `destroyed_fields`. The returned handle fires when the memory is free.
    fn destroy(
        &self,
        handle: AllocationHandle,
        destroyed_fields: &[DestroyedField],
        after: CompletionHandle,
    ) -> CompletionHandle;

    /// Return an eagerly allocated buffer to its memory's eager pool.
    fn release_eager(&self, handle: AllocationHandle, after: CompletionHandle) -> CompletionHandle {
        self.destroy(handle, &[], after)
    }

    /// Make an externally owned allocation usable.
    fn attach_external(&self, _handle: AllocationHandle) -> CompletionHandle {
        CompletionHandle::ready()
    }

    /// Stop using an externally owned allocation without freeing it.
    fn detach_external(&self, _handle: AllocationHandle) -> CompletionHandle {
        CompletionHandle::ready()
    }

    /// Notification that the owner-side GC priority of an instance changed.
    fn set_gc_priority(&self, _did: Did, _priority: GcPriority) {}
}

/// Counters observed by tests and diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub live: usize,
    pub bytes_used: usize,
    pub destroyed: usize,
    pub destructors_run: usize,
    pub eager_released: usize,
    pub attached: usize,
    pub detached: usize,
}

#[derive(Default)]
struct Pool {
    capacity: usize,
    used: usize,
    live: HashMap<u64, usize>,
}

/// In-process allocator accounting capacity per memory.
#[derive(Clone, Default)]
pub struct MemoryPoolAllocator {
    inner: Arc<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    pools: DashMap<MemoryId, Mutex<Pool>>,
    next_id: AtomicU64,
    stats: Mutex<PoolStats>,
    priorities: DashMap<Did, GcPriority>,
}

impl MemoryPoolAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a memory with `capacity` bytes.
    pub fn with_memory(self, memory: MemoryId, capacity: usize) -> Self {
        self.inner.pools.insert(
            memory,
            Mutex::new(Pool {
                capacity,
                ..Default::default()
            }),
        );
        self
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats.lock().clone()
    }

    pub fn bytes_free(&self, memory: MemoryId) -> Option<usize> {
        self.inner.pools.get(&memory).map(|pool| {
            let pool = pool.lock();
            pool.capacity - pool.used
        })
    }

    pub fn is_live(&self, handle: AllocationHandle) -> bool {
        self.inner
            .pools
            .get(&handle.memory)
            .map(|pool| pool.lock().live.contains_key(&handle.id))
            .unwrap_or(false)
    }

    /// Last priority reported for `did`.
    pub fn gc_priority(&self, did: Did) -> Option<GcPriority> {
        self.inner.priorities.get(&did).map(|p| *p)
    }

    fn free(inner: &PoolInner, handle: AllocationHandle, destructors: usize, eager: bool) {
        let freed = inner.pools.get(&handle.memory).and_then(|pool| {
            let mut pool = pool.lock();
            let bytes = pool.live.remove(&handle.id)?;
            pool.used -= bytes;
            Some(bytes)
        });

        let mut stats = inner.stats.lock();
        match freed {
            Some(bytes) => {
                stats.live -= 1;
                stats.bytes_used -= bytes;
                stats.destructors_run += destructors;
                if eager {
                    stats.eager_released += 1;
                } else {
                    stats.destroyed += 1;
                }
            }
            None => {
                tracing::warn!(%handle, "free of unknown allocation");
            }
        }
    }

    fn free_after(
        &self,
        handle: AllocationHandle,
        destructors: usize,
        eager: bool,
        after: CompletionHandle,
    ) -> CompletionHandle {
        let done = CompletionEvent::new();
        let freed = done.handle();
        let inner = Arc::clone(&self.inner);
        // A failed use still releases the allocation
        after.when_complete(move |_| {
            Self::free(&inner, handle, destructors, eager);
            done.trigger();
        });
        freed
    }
}

impl Allocator for MemoryPoolAllocator {
    fn create(
        &self,
        layout: &LayoutDescription,
        memory: MemoryId,
    ) -> Result<AllocationHandle, AllocationFailure> {
        let pool = self.inner.pools.get(&memory).ok_or_else(|| {
            AllocationFailure::new(
                ConstraintKind::Memory,
                0,
                format!("{memory} is not registered"),
            )
        })?;

        let bytes = layout.footprint();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut pool = pool.lock();
            let available = pool.capacity - pool.used;
            if bytes > available {
                return Err(AllocationFailure::out_of_memory(memory, bytes, available));
            }
            pool.used += bytes;
            pool.live.insert(id, bytes);
        }

        let mut stats = self.inner.stats.lock();
        stats.live += 1;
        stats.bytes_used += bytes;
        Ok(AllocationHandle { id, memory })
    }

    fn destroy(
        &self,
        handle: AllocationHandle,
        destroyed_fields: &[DestroyedField],
        after: CompletionHandle,
    ) -> CompletionHandle {
        self.free_after(handle, destroyed_fields.len(), false, after)
    }

    fn release_eager(&self, handle: AllocationHandle, after: CompletionHandle) -> CompletionHandle {
        self.free_after(handle, 0, true, after)
    }

    fn attach_external(&self, _handle: AllocationHandle) -> CompletionHandle {
        self.inner.stats.lock().attached += 1;
        CompletionHandle::ready()
    }

    fn detach_external(&self, _handle: AllocationHandle) -> CompletionHandle {
        self.inner.stats.lock().detached += 1;
        CompletionHandle::ready()
    }

    fn set_gc_priority(&self, did: Did, priority: GcPriority) {
        self.inner.priorities.insert(did, priority);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{DimensionKind, Domain, SpecializedConstraint};
    use crate::types::DestructorId;

    fn layout(elements: u64) -> LayoutDescription {
        LayoutDescription::compute(
            &Domain::dense([elements]),
            vec![DimensionKind::X, DimensionKind::F],
            &[(1, 8, None), (2, 4, Some(DestructorId(1)))],
            &[],
            SpecializedConstraint::Normal,
        )
        .unwrap()
    }

    #[test]
    fn create_accounts_capacity() {
        let allocator = MemoryPoolAllocator::new().with_memory(MemoryId(1), 1000);
        let handle = allocator.create(&layout(50), MemoryId(1)).unwrap();
        assert!(allocator.is_live(handle));
        assert_eq!(allocator.bytes_free(MemoryId(1)), Some(400));

        let err = allocator.create(&layout(50), MemoryId(1)).unwrap_err();
        assert_eq!(err.kind, ConstraintKind::Memory);
        assert_eq!(err.index, 0);
    }

    #[test]
    fn unknown_memory_is_unsatisfied() {
        let allocator = MemoryPoolAllocator::new();
        let err = allocator.create(&layout(1), MemoryId(3)).unwrap_err();
        assert_eq!(err.kind, ConstraintKind::Memory);
    }

    #[tokio::test]
    async fn destroy_waits_for_outstanding_uses() -> anyhow::Result<()> {
        let allocator = MemoryPoolAllocator::new().with_memory(MemoryId(1), 1000);
        let layout = layout(10);
        let handle = allocator.create(&layout, MemoryId(1))?;

        let use_done = CompletionEvent::new();
        let freed = allocator.destroy(handle, &layout.compute_destroyed_fields(), use_done.handle());
        assert!(allocator.is_live(handle));
        assert!(!freed.is_complete());

        use_done.trigger();
        freed.wait().await?;
        assert!(!allocator.is_live(handle));
        let stats = allocator.stats();
        assert_eq!(stats.destroyed, 1);
        assert_eq!(stats.destructors_run, 1);
        assert_eq!(stats.live, 0);
        assert_eq!(allocator.bytes_free(MemoryId(1)), Some(1000));
        Ok(())
    }

    #[tokio::test]
    async fn eager_release_is_counted_separately() -> anyhow::Result<()> {
        let allocator = MemoryPoolAllocator::new().with_memory(MemoryId(1), 1000);
        let handle = allocator.create(&layout(1), MemoryId(1))?;
        allocator
            .release_eager(handle, CompletionHandle::ready())
            .wait()
            .await?;
        let stats = allocator.stats();
        assert_eq!(stats.eager_released, 1);
        assert_eq!(stats.destroyed, 0);
        Ok(())
    }
}
