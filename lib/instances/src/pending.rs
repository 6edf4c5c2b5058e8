// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Request/response correlation.
//!
//! A caller that needs an answer from another node registers a pending
//! request, sends the generated [`RequestId`] with its message, and awaits
//! the receiver. The message handler for the answer completes the entry by id.
//! Ids are never reused, so a late answer for an abandoned request is dropped.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

use crate::events::CompletionHandle;
use crate::messages::GuardState;
use crate::types::RequestId;

/// Answers correlated through the pending table.
#[derive(Debug)]
pub enum Response {
    Acquire {
        granted: bool,
        ack: Option<RequestId>,
    },
    AcquireApplied,
    Collect(Option<CompletionHandle>),
    Guard(Option<GuardState>),
    PriorityDone,
    RecordUseDone,
    GcDebug(bool),
    Teardown(CompletionHandle),
}

impl Response {
    pub fn name(&self) -> &'static str {
        match self {
            Response::Acquire { .. } => "acquire",
            Response::AcquireApplied => "acquire_applied",
            Response::Collect(_) => "collect",
            Response::Guard(_) => "guard",
            Response::PriorityDone => "priority_done",
            Response::RecordUseDone => "record_use_done",
            Response::GcDebug(_) => "gc_debug",
            Response::Teardown(_) => "teardown",
        }
    }
}

#[derive(Debug, Error)]
pub enum PendingError {
    #[error("request {0} was abandoned before a response arrived")]
    Abandoned(RequestId),

    #[error("expected a {expected} response, got {actual}")]
    UnexpectedResponse {
        expected: &'static str,
        actual: &'static str,
    },
}

/// Awaits the response to one registered request.
pub struct PendingResponse {
    request: RequestId,
    receiver: oneshot::Receiver<Response>,
}

impl PendingResponse {
    pub fn request_id(&self) -> RequestId {
        self.request
    }

    pub async fn recv(self) -> Result<Response, PendingError> {
        self.receiver
            .await
            .map_err(|_| PendingError::Abandoned(self.request))
    }
}

#[derive(Default)]
pub struct PendingRequests {
    next: AtomicU64,
    slots: DashMap<RequestId, oneshot::Sender<Response>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            slots: DashMap::new(),
        }
    }

    /// Register a new outstanding request.
    pub fn register(&self) -> PendingResponse {
        let request = RequestId(self.next.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.slots.insert(request, tx);
        PendingResponse {
            request,
            receiver: rx,
        }
    }

    /// Deliver a response. Returns `false` if no caller is waiting for `request`.
    pub fn complete(&self, request: RequestId, response: Response) -> bool {
        let Some((_, tx)) = self.slots.remove(&request) else {
            warn!(%request, response = response.name(), "response for unknown request");
            return false;
        };
        if tx.send(response).is_err() {
            warn!(%request, "caller dropped before response arrived");
            return false;
        }
        true
    }

    /// Drop a registration whose request could not be sent.
    pub fn cancel(&self, request: RequestId) {
        self.slots.remove(&request);
    }

    /// Abandon every outstanding request. Waiting callers see [`PendingError::Abandoned`].
    pub fn cancel_all(&self) -> usize {
        let count = self.slots.len();
        self.slots.clear();
        count
    }

    pub fn outstanding(&self) -> usize {
        self.slots.len()
    }
}

/// Error for an answer that does not match the request it completed.
pub(crate) fn unexpected(expected: &'static str, actual: &Response) -> PendingError {
    PendingError::UnexpectedResponse {
        expected,
        actual: actual.name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn response_resumes_caller() -> anyhow::Result<()> {
        let pending = PendingRequests::new();
        let awaiter = pending.register();
        let request = awaiter.request_id();
        assert_eq!(pending.outstanding(), 1);

        assert!(pending.complete(request, Response::GcDebug(true)));
        assert!(matches!(awaiter.recv().await?, Response::GcDebug(true)));
        assert_eq!(pending.outstanding(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn stale_response_is_dropped() {
        let pending = PendingRequests::new();
        let awaiter = pending.register();
        let request = awaiter.request_id();
        assert!(pending.complete(request, Response::PriorityDone));
        assert!(!pending.complete(request, Response::PriorityDone));
        assert!(!pending.complete(RequestId(999), Response::PriorityDone));
    }

    #[tokio::test]
    async fn cancelled_request_is_abandoned() {
        let pending = PendingRequests::new();
        let awaiter = pending.register();
        pending.cancel(awaiter.request_id());
        assert!(matches!(
            awaiter.recv().await,
            Err(PendingError::Abandoned(_))
        ));
    }

    #[test]
    fn ids_are_unique() {
        let pending = PendingRequests::new();
        let a = pending.register().request_id();
        let b = pending.register().request_id();
        assert_ne!(a, b);
    }
}
