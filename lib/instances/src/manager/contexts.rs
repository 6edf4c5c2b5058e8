// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-context cached views of an instance.

use std::sync::Arc;

use crate::types::{ContextId, Did};

/// A context that caches views of physical instances.
pub trait InstanceContext: Send + Sync {
    fn context_id(&self) -> ContextId;

    /// The instance was deleted; drop every cached view of it.
    fn notify_instance_deletion(&self, did: Did);
}

/// A context's projection of one instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceView {
    pub did: Did,
    pub context: ContextId,
    pub redop: Option<u32>,
}

pub(crate) struct ActiveContext {
    pub(crate) context: Arc<dyn InstanceContext>,
    pub(crate) view: InstanceView,
    pub(crate) references: usize,
}
