// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Completion status types.

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

/// Status returned from non-blocking completion queries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum EventStatus {
    Pending,
    Ready,
    Poisoned,
}

/// Describes a completion that will never trigger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventPoison {
    reason: Arc<str>,
}

impl EventPoison {
    /// Create a new poison with the given reason.
    pub fn new(reason: impl Into<Arc<str>>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Get the reason of the poisoned completion.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Get the reason as an `Arc<str>`.
    pub fn reason_arc(&self) -> &Arc<str> {
        &self.reason
    }
}

impl Display for EventPoison {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "completion poisoned: {}", self.reason())
    }
}

impl std::error::Error for EventPoison {}

/// Terminal value of a completion.
#[derive(Clone, Debug)]
pub(crate) enum Completion {
    Triggered,
    Poisoned(EventPoison),
}

impl Completion {
    pub(crate) fn as_result(&self) -> Result<(), EventPoison> {
        match self {
            Completion::Triggered => Ok(()),
            Completion::Poisoned(poison) => Err(poison.clone()),
        }
    }

    pub(crate) fn status(&self) -> EventStatus {
        match self {
            Completion::Triggered => EventStatus::Ready,
            Completion::Poisoned(_) => EventStatus::Poisoned,
        }
    }
}
