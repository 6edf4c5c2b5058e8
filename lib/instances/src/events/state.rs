// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use parking_lot::Mutex as ParkingMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Waker;

use super::status::{Completion, EventStatus};

pub(crate) type CompletionCallback = Box<dyn FnOnce(&Completion) + Send>;

/// Shared state behind a completion event and all of its handles.
pub(crate) struct EventState {
    // Completion, wakers and callbacks share one lock to prevent lost wakeups
    pub(crate) inner: ParkingMutex<EventStateInner>,
    pub(crate) completed: AtomicBool,
}

pub(crate) struct EventStateInner {
    pub(crate) completion: Option<Completion>,
    pub(crate) wakers: Vec<Waker>,
    callbacks: Vec<CompletionCallback>,
}

impl EventState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: ParkingMutex::new(EventStateInner {
                completion: None,
                wakers: Vec::with_capacity(2),
                callbacks: Vec::new(),
            }),
            completed: AtomicBool::new(false),
        })
    }

    pub(crate) fn completed_with(value: Completion) -> Arc<Self> {
        Arc::new(Self {
            inner: ParkingMutex::new(EventStateInner {
                completion: Some(value),
                wakers: Vec::new(),
                callbacks: Vec::new(),
            }),
            completed: AtomicBool::new(true),
        })
    }

    pub(crate) fn status(&self) -> EventStatus {
        if !self.completed.load(Ordering::Acquire) {
            return EventStatus::Pending;
        }
        self.inner
            .lock()
            .completion
            .as_ref()
            .map(Completion::status)
            .unwrap_or(EventStatus::Pending)
    }

    /// Complete the state. Returns `false` if it had already completed.
    pub(crate) fn complete(&self, value: Completion) -> bool {
        if self.completed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let (wakers, callbacks) = {
            let mut guard = self.inner.lock();
            guard.completion = Some(value.clone());
            // Drain outside the lock
            (
                std::mem::take(&mut guard.wakers),
                std::mem::take(&mut guard.callbacks),
            )
        };

        for waker in wakers {
            waker.wake();
        }
        for callback in callbacks {
            callback(&value);
        }
        true
    }

    /// Run `callback` once the state completes, immediately if it already has.
    pub(crate) fn on_complete(&self, callback: CompletionCallback) {
        let ready = {
            let mut guard = self.inner.lock();
            match &guard.completion {
                Some(value) => Some((value.clone(), callback)),
                None => {
                    guard.callbacks.push(callback);
                    None
                }
            }
        };
        if let Some((value, callback)) = ready {
            callback(&value);
        }
    }
}
