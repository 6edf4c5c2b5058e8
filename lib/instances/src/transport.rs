// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Point-to-point message delivery between nodes.
//!
//! [`InProcessFabric`] connects nodes living in one process through unbounded
//! channels. Delivery to a node can be held and released, which lets tests
//! interleave protocol steps deterministically.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::TransportError;
use crate::messages::{Envelope, InstanceMessage};
use crate::types::NodeId;

/// Reliable point-to-point delivery.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        source: NodeId,
        target: NodeId,
        message: InstanceMessage,
    ) -> Result<(), TransportError>;
}

struct Route {
    tx: mpsc::UnboundedSender<Envelope>,
    held: Mutex<Option<Vec<Envelope>>>,
}

#[derive(Clone, Default)]
pub struct InProcessFabric {
    routes: Arc<DashMap<NodeId, Route>>,
}

impl InProcessFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `node` and return its inbox.
    pub fn connect(&self, node: NodeId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(
            node,
            Route {
                tx,
                held: Mutex::new(None),
            },
        );
        rx
    }

    pub fn disconnect(&self, node: NodeId) {
        self.routes.remove(&node);
    }

    /// Buffer every message addressed to `node` until [`release`](Self::release).
    pub fn hold(&self, node: NodeId) {
        if let Some(route) = self.routes.get(&node) {
            let mut held = route.held.lock();
            if held.is_none() {
                *held = Some(Vec::new());
            }
        }
    }

    /// Deliver buffered messages to `node` in arrival order and stop holding.
    pub fn release(&self, node: NodeId) -> usize {
        let Some(route) = self.routes.get(&node) else {
            return 0;
        };
        let buffered = route.held.lock().take().unwrap_or_default();
        let count = buffered.len();
        for envelope in buffered {
            let _ = route.tx.send(envelope);
        }
        count
    }

    /// Number of messages currently held for `node`.
    pub fn held_count(&self, node: NodeId) -> usize {
        self.routes
            .get(&node)
            .and_then(|route| route.held.lock().as_ref().map(Vec::len))
            .unwrap_or(0)
    }
}

impl Transport for InProcessFabric {
    fn send(
        &self,
        source: NodeId,
        target: NodeId,
        message: InstanceMessage,
    ) -> Result<(), TransportError> {
        let route = self
            .routes
            .get(&target)
            .ok_or(TransportError::UnknownNode(target))?;
        trace!(%source, %target, did = %message.did, kind = message.body.name(), "send");

        let envelope = Envelope { source, message };
        let mut held = route.held.lock();
        if let Some(buffer) = held.as_mut() {
            buffer.push(envelope);
            return Ok(());
        }
        route
            .tx
            .send(envelope)
            .map_err(|_| TransportError::Closed(target))
    }
}
