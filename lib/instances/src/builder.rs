// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Turns layout constraints into an allocation and a registered manager.
//!
//! Constraint problems are detected when the builder is created, before any
//! allocation is attempted. Allocation failures are returned as
//! [`BuildError::Allocation`] naming the unsatisfied constraint so a caller can
//! retry in another memory.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{AllocationFailure, BuildError, ConfigurationError, ConstraintKind};
use crate::events::CompletionHandle;
use crate::layout::{
    AlignmentConstraint, DimensionKind, Domain, FieldSpace, LayoutConstraintSet,
    LayoutDescription, SpecializedConstraint, normalize_ordering,
};
use crate::manager::{
    CollectiveManager, CollectiveMember, GcState, IndividualKind, IndividualManager,
    InstanceManager, ManagerKind,
};
use crate::node::NodeContext;
use crate::types::{DestructorId, FieldId, MemoryId, NodeId};

/// Result of a successful build request.
#[derive(Debug)]
pub enum BuildOutcome {
    Created(Arc<InstanceManager>),
    /// The request named no fields; nothing was allocated.
    NoFields {
        constraint: ConstraintKind,
        index: usize,
    },
}

impl BuildOutcome {
    pub fn manager(&self) -> Option<&Arc<InstanceManager>> {
        match self {
            BuildOutcome::Created(manager) => Some(manager),
            BuildOutcome::NoFields { .. } => None,
        }
    }
}

/// Members of a collective instance, one allocation each.
#[derive(Clone, Debug, Default)]
pub struct CollectiveRequest {
    pub members: Vec<(NodeId, MemoryId)>,
    /// Fan-out of the teardown chain; `collective.radix` when unset.
    pub radix: Option<usize>,
}

impl CollectiveRequest {
    pub fn new(members: impl IntoIterator<Item = (NodeId, MemoryId)>) -> Self {
        Self {
            members: members.into_iter().collect(),
            radix: None,
        }
    }

    pub fn with_radix(mut self, radix: usize) -> Self {
        self.radix = Some(radix);
        self
    }
}

#[derive(Clone, Debug)]
pub struct InstanceBuilder {
    domain: Domain,
    memory: MemoryId,
    ordering: Vec<DimensionKind>,
    fields: Vec<(FieldId, usize, Option<DestructorId>)>,
    alignment: Vec<AlignmentConstraint>,
    specialized: SpecializedConstraint,
    eager: bool,
}

impl InstanceBuilder {
    /// Validate `constraints` for an instance covering `regions` in `memory`.
    pub fn new(
        regions: &[Domain],
        field_space: &FieldSpace,
        constraints: LayoutConstraintSet,
        memory: MemoryId,
    ) -> Result<Self, ConfigurationError> {
        if !constraints.splitting.is_empty() {
            return Err(ConfigurationError::SplittingUnsupported);
        }
        if constraints.specialized == SpecializedConstraint::Virtual {
            return Err(ConfigurationError::VirtualSpecialization);
        }

        let redop = constraints.specialized.reduction();
        let mut fields = Vec::with_capacity(constraints.fields.fields.len());
        for field in &constraints.fields.fields {
            if fields.iter().any(|(existing, _, _)| existing == field) {
                return Err(ConfigurationError::DuplicateField(*field));
            }
            let info = field_space
                .field(*field)
                .ok_or(ConfigurationError::UnknownField(*field))?;
            let size = match redop {
                Some(op) if op.lhs_size != info.size => {
                    return Err(ConfigurationError::ReductionSizeMismatch {
                        field: *field,
                        redop: op.id,
                        expected: op.lhs_size,
                        actual: info.size,
                    });
                }
                // Reduction instances hold right-hand-side values
                Some(op) => op.rhs_size,
                None => info.size,
            };
            fields.push((*field, size, info.destructor));
        }

        let domain = bounding_domain(regions);
        let ordering = normalize_ordering(&constraints.ordering.ordering, domain.dims())?;

        Ok(Self {
            domain,
            memory,
            ordering,
            fields,
            alignment: constraints.alignment,
            specialized: constraints.specialized,
            eager: false,
        })
    }

    /// Allocate from the memory's eager pool.
    pub fn eager(mut self) -> Self {
        self.eager = true;
        self
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn memory(&self) -> MemoryId {
        self.memory
    }

    /// Normalized dimension ordering the layout will use.
    pub fn ordering(&self) -> &[DimensionKind] {
        &self.ordering
    }

    pub fn compute_layout(&self) -> Result<LayoutDescription, AllocationFailure> {
        LayoutDescription::compute(
            &self.domain,
            self.ordering.clone(),
            &self.fields,
            &self.alignment,
            self.specialized,
        )
    }

    /// Allocate the instance and register its manager on this node.
    pub fn create_physical_instance(
        &self,
        context: &Arc<NodeContext>,
    ) -> Result<BuildOutcome, BuildError> {
        if self.fields.is_empty() {
            warn!(
                "Ignoring request to create instance in memory {} with no fields",
                self.memory
            );
            return Ok(BuildOutcome::NoFields {
                constraint: ConstraintKind::Field,
                index: 0,
            });
        }

        let layout = self.compute_layout()?;
        let allocation = context.allocator().create(&layout, self.memory)?;
        let kind = if self.eager {
            IndividualKind::Eager
        } else {
            IndividualKind::Internal
        };

        let did = context.allocate_did();
        let footprint = layout.footprint();
        let manager = InstanceManager::new(
            Arc::clone(context),
            did,
            Arc::new(layout),
            self.specialized.reduction().map(|op| op.id),
            footprint,
            ManagerKind::Individual(IndividualManager::bound(
                self.memory,
                allocation,
                kind,
                CompletionHandle::ready(),
            )),
            GcState::Collectable,
        );
        context.directory().register(Arc::clone(&manager));
        debug!(%did, %allocation, footprint, "created physical instance");
        Ok(BuildOutcome::Created(manager))
    }

    /// Allocate one copy per member and announce the manager to every member node.
    ///
    /// The local node roots the teardown chain.
    pub fn create_collective_instance(
        &self,
        context: &Arc<NodeContext>,
        request: &CollectiveRequest,
    ) -> Result<Arc<InstanceManager>, BuildError> {
        if self.fields.is_empty() {
            return Err(AllocationFailure::new(ConstraintKind::Field, 0, "no fields requested").into());
        }
        if request.members.is_empty() {
            return Err(
                AllocationFailure::new(ConstraintKind::Memory, 0, "collective instance has no members")
                    .into(),
            );
        }

        let layout = self.compute_layout()?;
        let local = context.node_id();
        let allocator = context.allocator();

        let mut members = Vec::with_capacity(request.members.len());
        for (index, (node, memory)) in request.members.iter().enumerate() {
            match allocator.create(&layout, *memory) {
                Ok(allocation) => members.push(CollectiveMember {
                    node: *node,
                    allocation,
                }),
                Err(failure) => {
                    for member in &members {
                        allocator.destroy(member.allocation, &[], CompletionHandle::ready());
                    }
                    return Err(AllocationFailure { index, ..failure }.into());
                }
            }
        }
        // Stable: keeps member order within each group
        members.sort_by_key(|member| member.node != local);

        let did = context.allocate_did();
        let radix = request.radix.unwrap_or(context.config().collective.radix);
        let footprint = layout.footprint();
        let collective = CollectiveManager::new(local, members, radix);
        let nodes: Vec<NodeId> = collective.nodes().to_vec();
        let manager = InstanceManager::new(
            Arc::clone(context),
            did,
            Arc::new(layout),
            self.specialized.reduction().map(|op| op.id),
            footprint,
            ManagerKind::Collective(collective),
            GcState::Collectable,
        );
        context.directory().register(Arc::clone(&manager));

        for node in nodes.into_iter().filter(|node| *node != local) {
            if let Err(e) = manager.send_manager(node) {
                warn!(%did, %node, "failed to announce collective instance: {}", e);
            }
        }
        debug!(%did, members = request.members.len(), radix, "created collective instance");
        Ok(manager)
    }
}

/// Smallest dense domain covering every region.
fn bounding_domain(regions: &[Domain]) -> Domain {
    let dims = regions.iter().map(Domain::dims).max().unwrap_or(0);
    Domain::dense((0..dims).map(|dim| {
        regions
            .iter()
            .filter(|region| dim < region.dims())
            .map(|region| region.extent(dim))
            .max()
            .unwrap_or(1)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::MemoryPoolAllocator;
    use crate::config::InstancesConfig;
    use crate::directory::LocalDirectory;
    use crate::layout::{FieldConstraint, OrderingConstraint, ReductionOp};
    use crate::transport::InProcessFabric;

    const MEMORY: MemoryId = MemoryId(7);

    fn context(capacity: usize) -> (Arc<NodeContext>, MemoryPoolAllocator) {
        let fabric = InProcessFabric::new();
        let allocator = MemoryPoolAllocator::new().with_memory(MEMORY, capacity);
        let directory = Arc::new(LocalDirectory::new(NodeId(0), Arc::new(fabric)));
        let context = NodeContext::new(
            directory,
            Arc::new(allocator.clone()),
            InstancesConfig::default(),
        );
        (Arc::new(context), allocator)
    }

    fn fields() -> FieldSpace {
        FieldSpace::new().with_field(1, 8).with_field(2, 4)
    }

    fn constraints(fields: impl IntoIterator<Item = FieldId>) -> LayoutConstraintSet {
        LayoutConstraintSet::builder()
            .fields(FieldConstraint::new(fields))
            .ordering(OrderingConstraint::soa(1))
            .build()
            .unwrap()
    }

    #[test]
    fn creates_and_registers_manager() -> anyhow::Result<()> {
        let (context, allocator) = context(4096);
        let builder = InstanceBuilder::new(&[Domain::dense([16])], &fields(), constraints([1, 2]), MEMORY)?;

        let outcome = builder.create_physical_instance(&context)?;
        let manager = outcome.manager().expect("manager created");
        assert_eq!(manager.footprint(), 12 * 16);
        assert_eq!(manager.gc_state(), GcState::Collectable);
        assert!(manager.is_owner());
        assert!(context.directory().managers().len() == 1);
        assert_eq!(allocator.stats().live, 1);
        Ok(())
    }

    #[test]
    fn empty_field_set_is_a_warning_outcome() -> anyhow::Result<()> {
        let (context, allocator) = context(4096);
        let builder = InstanceBuilder::new(&[Domain::dense([16])], &fields(), constraints([]), MEMORY)?;

        let outcome = builder.create_physical_instance(&context)?;
        assert!(matches!(
            outcome,
            BuildOutcome::NoFields {
                constraint: ConstraintKind::Field,
                index: 0
            }
        ));
        assert!(context.directory().managers().is_empty());
        assert_eq!(allocator.stats().live, 0);
        Ok(())
    }

    #[test]
    fn out_of_memory_is_recoverable() -> anyhow::Result<()> {
        let (context, _) = context(64);
        let builder = InstanceBuilder::new(&[Domain::dense([16])], &fields(), constraints([1]), MEMORY)?;

        let err = builder.create_physical_instance(&context).unwrap_err();
        assert!(!err.is_fatal());
        match err {
            BuildError::Allocation(failure) => assert_eq!(failure.kind, ConstraintKind::Memory),
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn oversized_request_is_recoverable() -> anyhow::Result<()> {
        let (context, allocator) = context(4096);
        let constraints = LayoutConstraintSet::builder()
            .fields(FieldConstraint::new([1, 2]))
            .ordering(OrderingConstraint::soa(2))
            .build()?;
        let builder =
            InstanceBuilder::new(&[Domain::dense([1 << 40, 1 << 30])], &fields(), constraints, MEMORY)?;

        assert_eq!(builder.compute_layout().unwrap_err().kind, ConstraintKind::Memory);
        let err = builder.create_physical_instance(&context).unwrap_err();
        assert!(!err.is_fatal());
        assert!(matches!(err, BuildError::Allocation(ref failure) if failure.kind == ConstraintKind::Memory));
        assert_eq!(allocator.stats().live, 0);
        Ok(())
    }

    #[test]
    fn constraint_errors_are_reported_before_allocation() {
        let splitting = LayoutConstraintSet::builder()
            .fields(FieldConstraint::new([1]))
            .splitting(vec![crate::layout::SplittingConstraint {
                kind: DimensionKind::X,
                chunks: 2,
            }])
            .build()
            .unwrap();
        assert_eq!(
            InstanceBuilder::new(&[Domain::dense([4])], &fields(), splitting, MEMORY).unwrap_err(),
            ConfigurationError::SplittingUnsupported
        );

        let two_field_dims = LayoutConstraintSet::builder()
            .fields(FieldConstraint::new([1]))
            .ordering(OrderingConstraint::new([DimensionKind::F, DimensionKind::X, DimensionKind::F]))
            .build()
            .unwrap();
        assert_eq!(
            InstanceBuilder::new(&[Domain::dense([4])], &fields(), two_field_dims, MEMORY).unwrap_err(),
            ConfigurationError::DuplicateFieldDimension
        );

        assert_eq!(
            InstanceBuilder::new(&[Domain::dense([4])], &fields(), constraints([3]), MEMORY).unwrap_err(),
            ConfigurationError::UnknownField(3)
        );
        assert_eq!(
            InstanceBuilder::new(&[Domain::dense([4])], &fields(), constraints([1, 1]), MEMORY).unwrap_err(),
            ConfigurationError::DuplicateField(1)
        );
    }

    #[test]
    fn reduction_substitutes_rhs_size() -> anyhow::Result<()> {
        let (context, _) = context(4096);
        let op = ReductionOp {
            id: 3,
            lhs_size: 8,
            rhs_size: 16,
        };
        let reduction = LayoutConstraintSet::builder()
            .specialized(SpecializedConstraint::AffineReduction(op))
            .fields(FieldConstraint::new([1]))
            .build()
            .unwrap();
        let builder = InstanceBuilder::new(&[Domain::dense([4])], &fields(), reduction.clone(), MEMORY)?;
        let outcome = builder.create_physical_instance(&context)?;
        let manager = outcome.manager().expect("manager created");
        assert_eq!(manager.redop(), Some(3));
        assert_eq!(manager.layout().find_field_info(1).map(|f| f.size), Some(16));

        let mismatch = LayoutConstraintSet {
            fields: FieldConstraint::new([2]),
            ..reduction
        };
        assert!(matches!(
            InstanceBuilder::new(&[Domain::dense([4])], &fields(), mismatch, MEMORY),
            Err(ConfigurationError::ReductionSizeMismatch {
                field: 2,
                expected: 8,
                actual: 4,
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn regions_are_bounded() -> anyhow::Result<()> {
        let builder = InstanceBuilder::new(
            &[Domain::dense([4, 2]), Domain::dense([3, 5])],
            &fields(),
            constraints([1]),
            MEMORY,
        )?;
        assert_eq!(builder.domain(), &Domain::dense([4, 5]));
        Ok(())
    }
}
