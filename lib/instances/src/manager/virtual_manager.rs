// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::InstanceManager;
use super::state::ReferenceSource;

/// An instance with no backing allocation.
///
/// Created valid with one internal reference that is never released, so it is
/// never collected.
#[derive(Clone, Copy, Debug, Default)]
pub struct VirtualManager;

impl VirtualManager {
    pub(crate) fn pin(manager: &InstanceManager) {
        manager.add_valid_reference(ReferenceSource::Internal, 1);
    }
}
