// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

#![deny(
    unsafe_code,
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

//! Inbound connection layer: listeners accept TCP connections and demux UDP
//! datagrams into sessions, pumping the resulting byte streams through
//! per-connection pipelines.
//!
//! Everything here is thread-affine. A listener, its acceptor task, its
//! inbounds and their pipelines all live on the worker thread that created
//! them; each worker binds its own listening socket for the same address
//! (with `SO_REUSEPORT` when enabled) and the kernel spreads connections
//! across the workers.

pub mod listener;
pub mod masquerade;
mod options;
pub mod tcp;
pub mod udp;

pub use listener::{Listener, ListenerError, Protocol};
pub use options::ListenerOptions;

use std::cell::Cell;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_INBOUND_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static INBOUND_COUNT: Cell<usize> = const { Cell::new(0) };
    static TRAFFIC_IN_TOTAL: Cell<u64> = const { Cell::new(0) };
    static TRAFFIC_OUT_TOTAL: Cell<u64> = const { Cell::new(0) };
}

/// Draws the next inbound id. Ids are process-wide and monotonic; id 0 is
/// reserved and skipped on wrap-around. They are not unique across a full
/// 64-bit cycle, so they must not serve as uniqueness tokens beyond the
/// process lifetime.
fn next_inbound_id() -> u64 {
    loop {
        let id = NEXT_INBOUND_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

/// Number of live inbound connections/sessions on this thread.
#[must_use]
pub fn count() -> usize {
    INBOUND_COUNT.with(Cell::get)
}

/// Byte totals received from and sent to peers on this thread.
#[must_use]
pub fn traffic_totals() -> (u64, u64) {
    (
        TRAFFIC_IN_TOTAL.with(Cell::get),
        TRAFFIC_OUT_TOTAL.with(Cell::get),
    )
}

/// Point-in-time view of one inbound, for administrative iteration.
#[derive(Clone, Debug)]
pub struct InboundSnapshot {
    /// Process-wide inbound id.
    pub id: u64,
    /// Local endpoint.
    pub local_addr: Option<SocketAddr>,
    /// Peer endpoint.
    pub remote_addr: Option<SocketAddr>,
    /// Bytes received from the peer.
    pub traffic_in: u64,
    /// Bytes sent to the peer.
    pub traffic_out: u64,
    /// Receive-side state name.
    pub state: &'static str,
}

/// Identity and counters shared by TCP connections and UDP sessions.
pub(crate) struct InboundBase {
    pub(crate) id: u64,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) original_dst: Option<SocketAddr>,
    pub(crate) traffic_in: Cell<u64>,
    pub(crate) traffic_out: Cell<u64>,
}

impl InboundBase {
    pub(crate) fn new(
        remote_addr: SocketAddr,
        local_addr: Option<SocketAddr>,
        original_dst: Option<SocketAddr>,
    ) -> Self {
        INBOUND_COUNT.with(|count| count.set(count.get() + 1));
        Self {
            id: next_inbound_id(),
            local_addr,
            remote_addr,
            original_dst,
            traffic_in: Cell::new(0),
            traffic_out: Cell::new(0),
        }
    }

    pub(crate) fn add_traffic_in(&self, n: usize) {
        self.traffic_in.set(self.traffic_in.get() + n as u64);
        TRAFFIC_IN_TOTAL.with(|total| total.set(total.get() + n as u64));
    }

    pub(crate) fn add_traffic_out(&self, n: usize) {
        self.traffic_out.set(self.traffic_out.get() + n as u64);
        TRAFFIC_OUT_TOTAL.with(|total| total.set(total.get() + n as u64));
    }
}

impl Drop for InboundBase {
    fn drop(&mut self) {
        INBOUND_COUNT.with(|count| count.set(count.get().saturating_sub(1)));
    }
}

/// Reads `SO_ORIGINAL_DST` off an accepted socket, for listeners running
/// behind an iptables REDIRECT. Never set on other platforms.
#[cfg(target_os = "linux")]
pub(crate) fn original_dst(socket: &impl std::os::fd::AsFd) -> Option<SocketAddr> {
    use std::net::{IpAddr, Ipv4Addr};

    let addr = nix::sys::socket::getsockopt(socket, nix::sys::socket::sockopt::OriginalDst).ok()?;
    let ip = IpAddr::V4(Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)));
    Some(SocketAddr::new(ip, u16::from_be(addr.sin_port)))
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn original_dst<T>(_socket: &T) -> Option<SocketAddr> {
    None
}
