// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use super::state::EventState;
use super::status::EventPoison;

/// Future that waits for a completion.
///
/// This can be used in `tokio::select!` and polled multiple times; each poll
/// refreshes the waker registration.
pub struct EventAwaiter {
    state: Arc<EventState>,
}

impl EventAwaiter {
    pub(crate) fn new(state: Arc<EventState>) -> Self {
        Self { state }
    }
}

impl Future for EventAwaiter {
    type Output = Result<(), EventPoison>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Check completion and register the waker atomically
        let mut inner = self.state.inner.lock();

        if let Some(value) = &inner.completion {
            return Poll::Ready(value.as_result());
        }

        // Deduplicate wakers for select! loops
        let waker = cx.waker();
        if let Some(existing) = inner.wakers.iter_mut().find(|w| w.will_wake(waker)) {
            existing.clone_from(waker);
        } else {
            inner.wakers.push(waker.clone());
        }

        Poll::Pending
    }
}
