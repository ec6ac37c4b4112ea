// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

use crate::tap::Tap;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared, mutable handle to a pipeline's [`Context`].
pub type ContextHandle = Rc<RefCell<Context>>;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// What a pipeline knows about the connection it serves.
///
/// Implemented by the inbound layer; kept as a trait object so the pipeline
/// runtime does not depend on sockets.
pub trait InboundInfo {
    /// Process-wide inbound id.
    fn id(&self) -> u64;
    /// Local endpoint of the accepted socket.
    fn local_addr(&self) -> Option<SocketAddr>;
    /// Peer endpoint.
    fn remote_addr(&self) -> Option<SocketAddr>;
    /// Pre-redirect destination, when known (transparent proxying).
    fn original_dst(&self) -> Option<SocketAddr>;
}

/// Per-pipeline scope: the inbound back-reference, the tap for upstream
/// backpressure, and the slot for the pipeline's result value.
pub struct Context {
    id: u64,
    inbound: Option<Rc<dyn InboundInfo>>,
    tap: Tap,
    result: Option<serde_json::Value>,
}

impl Context {
    /// Creates a detached context (no inbound connection).
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            inbound: None,
            tap: Tap::new(),
            result: None,
        }
    }

    /// Creates a context bound to an inbound connection.
    #[must_use]
    pub fn with_inbound(inbound: Rc<dyn InboundInfo>) -> Self {
        Self {
            inbound: Some(inbound),
            ..Self::new()
        }
    }

    /// Creates a context bound to an inbound connection, sharing the
    /// connection's tap so backpressure reaches its read loop.
    #[must_use]
    pub fn for_inbound(inbound: Rc<dyn InboundInfo>, tap: Tap) -> Self {
        Self {
            inbound: Some(inbound),
            tap,
            ..Self::new()
        }
    }

    /// Derives a fresh context sharing this one's inbound and tap.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            inbound: self.inbound.clone(),
            tap: self.tap.clone(),
            result: None,
        }
    }

    /// Context id, unique within the process lifetime.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The connection this pipeline serves, if any.
    #[must_use]
    pub fn inbound(&self) -> Option<&Rc<dyn InboundInfo>> {
        self.inbound.as_ref()
    }

    /// The pipeline's backpressure tap.
    #[must_use]
    pub fn tap(&self) -> &Tap {
        &self.tap
    }

    /// Stores the pipeline result delivered to `on_end`.
    pub fn set_result(&mut self, value: serde_json::Value) {
        self.result = Some(value);
    }

    pub(crate) fn take_result(&mut self) -> Option<serde_json::Value> {
        self.result.take()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
