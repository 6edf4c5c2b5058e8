// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::{Arc, LazyLock};

use super::awaiter::EventAwaiter;
use super::state::EventState;
use super::status::{Completion, EventPoison, EventStatus};

/// Static poison reason reused across all drop-triggered poisons.
static DROP_POISON_REASON: LazyLock<Arc<str>> =
    LazyLock::new(|| Arc::from("event dropped without being triggered"));

/// The triggering side of a one-shot completion.
///
/// A `CompletionEvent` auto-poisons on drop unless it was triggered or
/// poisoned first, so waiters never hang on an abandoned operation.
pub struct CompletionEvent {
    state: Arc<EventState>,
}

impl CompletionEvent {
    /// Create a new pending event.
    pub fn new() -> Self {
        Self {
            state: EventState::new(),
        }
    }

    /// A cloneable handle that observes this event.
    pub fn handle(&self) -> CompletionHandle {
        CompletionHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Mark the event as triggered, waking all waiters.
    ///
    /// Returns `false` if the event had already completed.
    pub fn trigger(&self) -> bool {
        self.state.complete(Completion::Triggered)
    }

    /// Poison the event, waking all waiters with an error.
    pub fn poison(&self, reason: impl Into<Arc<str>>) -> bool {
        self.state
            .complete(Completion::Poisoned(EventPoison::new(reason)))
    }

    /// Trigger this event once `precondition` completes, carrying over poison.
    pub fn trigger_after(self, precondition: &CompletionHandle) {
        precondition.state.on_complete(Box::new(move |value| match value {
            Completion::Triggered => {
                self.trigger();
            }
            Completion::Poisoned(poison) => {
                self.poison(Arc::clone(poison.reason_arc()));
            }
        }));
    }

    pub fn status(&self) -> EventStatus {
        self.state.status()
    }
}

impl Default for CompletionEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CompletionEvent {
    fn drop(&mut self) {
        self.state.complete(Completion::Poisoned(EventPoison::new(Arc::clone(
            &DROP_POISON_REASON,
        ))));
    }
}

impl fmt::Debug for CompletionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionEvent")
            .field("status", &self.status())
            .finish()
    }
}

/// A future-like token signaled when an asynchronous operation finishes.
///
/// Handles are cheap to clone; every clone observes the same completion.
#[derive(Clone)]
pub struct CompletionHandle {
    pub(crate) state: Arc<EventState>,
}

impl CompletionHandle {
    /// A handle that has already triggered.
    pub fn ready() -> Self {
        static READY: LazyLock<Arc<EventState>> =
            LazyLock::new(|| EventState::completed_with(Completion::Triggered));
        Self {
            state: Arc::clone(&READY),
        }
    }

    /// A handle that has already been poisoned.
    pub fn poisoned(reason: impl Into<Arc<str>>) -> Self {
        Self {
            state: EventState::completed_with(Completion::Poisoned(EventPoison::new(reason))),
        }
    }

    pub fn status(&self) -> EventStatus {
        self.state.status()
    }

    /// True once the completion triggered successfully.
    pub fn has_triggered(&self) -> bool {
        self.status() == EventStatus::Ready
    }

    /// True once the completion triggered or was poisoned.
    pub fn is_complete(&self) -> bool {
        self.status() != EventStatus::Pending
    }

    /// Wait for the completion.
    pub fn wait(&self) -> EventAwaiter {
        EventAwaiter::new(Arc::clone(&self.state))
    }

    /// Run `callback` once the completion fires, immediately if it already has.
    pub fn when_complete<F>(&self, callback: F)
    where
        F: FnOnce(Result<(), EventPoison>) + Send + 'static,
    {
        self.state
            .on_complete(Box::new(move |value| callback(value.as_result())));
    }

    /// True if both handles observe the same completion.
    pub fn same_as(&self, other: &CompletionHandle) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("status", &self.status())
            .finish()
    }
}
