// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

//! Listener lifecycle and acceptor loops.

use crate::masquerade::MasqueradeSocket;
use crate::options::ListenerOptions;
use crate::tcp::InboundTcp;
use crate::udp::InboundUdp;
use crate::InboundSnapshot;
use buffer::RawChunk;
use metrics::Unit;
use pipeline::PipelineLayout;
use socket2::{Domain, Socket, Type};
use stats::{MetricSpec, Register, Registered};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

static REUSE_PORT: AtomicBool = AtomicBool::new(false);

thread_local! {
    static LISTENERS: RefCell<Vec<Rc<Listener>>> = const { RefCell::new(Vec::new()) };
}

/// Transport protocol a listener binds.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Protocol {
    /// Stream connections, one inbound per accepted socket.
    Tcp,
    /// Datagrams, one inbound session per peer endpoint.
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Listener state-machine failures.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ListenerError {
    /// The listening socket could not be bound.
    #[error("unable to listen on {protocol} [{ip}]:{port}: {source}")]
    Bind {
        /// Protocol of the listener.
        protocol: Protocol,
        /// Address it tried to bind.
        ip: IpAddr,
        /// Port it tried to bind.
        port: u16,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },
}

/// Traffic counters registered once per listener.
pub(crate) struct ListenerMetrics {
    pub(crate) traffic_in: Registered<metrics::Counter>,
    pub(crate) traffic_out: Registered<metrics::Counter>,
}

impl ListenerMetrics {
    fn new(protocol: Protocol, ip: IpAddr, port: u16) -> Self {
        let listener = format!("[{ip}]:{port}");
        Self {
            traffic_in: MetricSpec::new("flowgate_inbound_in_bytes", Unit::Bytes)
                .describe("Bytes received from peers")
                .label("listener", &listener)
                .label("protocol", protocol.to_string())
                .register(),
            traffic_out: MetricSpec::new("flowgate_inbound_out_bytes", Unit::Bytes)
                .describe("Bytes sent to peers")
                .label("listener", &listener)
                .label("protocol", protocol.to_string())
                .register(),
        }
    }
}

/// A live inbound as its listener sees it.
pub(crate) trait InboundHandle {
    fn id(&self) -> u64;
    fn shut(&self);
    fn snapshot(&self) -> InboundSnapshot;
}

struct Staged {
    layout: Option<Rc<PipelineLayout>>,
    options: ListenerOptions,
}

enum PendingSocket {
    Tcp(tokio::net::TcpListener),
    Udp(tokio::net::UdpSocket),
}

type UdpSessions = Rc<RefCell<HashMap<SocketAddr, Rc<InboundUdp>>>>;

/// Owner of one bound `(protocol, address, port)`.
///
/// A listener is created `Stopped`. Staging a layout with
/// [`Listener::set_next_state`] binds the socket (so bind failures surface
/// before anything changes), [`Listener::commit`] atomically swaps the
/// staged layout in and starts (or keeps) accepting, and
/// [`Listener::rollback`] discards the staged change. Inbounds accepted
/// earlier keep the layout reference they started with.
pub struct Listener {
    protocol: Protocol,
    ip: IpAddr,
    port: u16,
    bound_addr: Cell<Option<SocketAddr>>,
    layout: RefCell<Option<Rc<PipelineLayout>>>,
    options: RefCell<ListenerOptions>,
    staged: RefCell<Option<Staged>>,
    pending: RefCell<Option<PendingSocket>>,
    accept_task: RefCell<Option<JoinHandle<()>>>,
    udp_sessions: RefCell<Option<UdpSessions>>,
    masquerade: RefCell<Option<Rc<MasqueradeSocket>>>,
    metrics: RefCell<Option<Rc<ListenerMetrics>>>,
    inbounds: RefCell<HashMap<u64, Weak<dyn InboundHandle>>>,
}

impl Listener {
    /// Turns `SO_REUSEPORT` on or off for every socket bound afterwards.
    pub fn set_reuse_port(on: bool) {
        REUSE_PORT.store(on, Ordering::Relaxed);
    }

    /// Finds or creates this thread's listener for the given key.
    #[must_use]
    pub fn get(protocol: Protocol, ip: IpAddr, port: u16) -> Rc<Listener> {
        LISTENERS.with_borrow_mut(|listeners| {
            if let Some(listener) = listeners
                .iter()
                .find(|l| l.protocol == protocol && l.ip == ip && l.port == port)
            {
                return listener.clone();
            }
            let listener = Rc::new(Listener {
                protocol,
                ip,
                port,
                bound_addr: Cell::new(None),
                layout: RefCell::new(None),
                options: RefCell::new(ListenerOptions::default()),
                staged: RefCell::new(None),
                pending: RefCell::new(None),
                accept_task: RefCell::new(None),
                udp_sessions: RefCell::new(None),
                masquerade: RefCell::new(None),
                metrics: RefCell::new(None),
                inbounds: RefCell::new(HashMap::new()),
            });
            listeners.push(listener.clone());
            listener
        })
    }

    /// Finds this thread's listener on `port`, if any.
    #[must_use]
    pub fn find(protocol: Protocol, port: u16) -> Option<Rc<Listener>> {
        LISTENERS.with_borrow(|listeners| {
            listeners
                .iter()
                .find(|l| l.protocol == protocol && l.port == port)
                .cloned()
        })
    }

    /// Visits every listener created on this thread.
    pub fn for_each(mut f: impl FnMut(&Rc<Listener>)) {
        let listeners = LISTENERS.with_borrow(Clone::clone);
        for listener in &listeners {
            f(listener);
        }
    }

    /// The listener's protocol.
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The address actually bound, once listening. With a requested port of
    /// 0 this carries the kernel-assigned port.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr.get()
    }

    /// Whether an acceptor is currently running.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.accept_task.borrow().is_some()
    }

    /// Stages a layout/options change. Binds the socket right away when the
    /// listener is not yet listening, so a bind failure surfaces here and
    /// the caller may [`Listener::rollback`] without disturbing traffic.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Bind`] when the socket cannot be bound; the
    /// staged change stays in place for the caller to roll back or retry.
    pub fn set_next_state(
        &self,
        layout: Option<Rc<PipelineLayout>>,
        options: ListenerOptions,
    ) -> Result<(), ListenerError> {
        let needs_bind = layout.is_some()
            && self.accept_task.borrow().is_none()
            && self.pending.borrow().is_none();
        *self.staged.borrow_mut() = Some(Staged {
            layout,
            options,
        });
        if needs_bind {
            let pending = self.bind().map_err(|source| ListenerError::Bind {
                protocol: self.protocol,
                ip: self.ip,
                port: self.port,
                source,
            })?;
            *self.pending.borrow_mut() = Some(pending);
        }
        Ok(())
    }

    /// Applies the staged change. Existing inbounds keep the pipelines (and
    /// so the layout references) they were spawned with.
    pub fn commit(self: &Rc<Self>) {
        let Some(staged) = self.staged.borrow_mut().take() else {
            return;
        };
        match staged.layout {
            None => self.stop_listening(),
            Some(layout) => {
                *self.options.borrow_mut() = staged.options;
                *self.layout.borrow_mut() = Some(layout);
                if self.accept_task.borrow().is_none() {
                    if let Some(pending) = self.pending.borrow_mut().take() {
                        self.start_accepting(pending);
                    }
                }
            }
        }
    }

    /// Discards the staged change, closing the socket it may have bound.
    pub fn rollback(&self) {
        *self.staged.borrow_mut() = None;
        if self.accept_task.borrow().is_none() {
            *self.pending.borrow_mut() = None;
            if self.layout.borrow().is_none() {
                self.bound_addr.set(None);
            }
        }
    }

    /// The layout pipelines are currently spawned from.
    #[must_use]
    pub fn pipeline_layout(&self) -> Option<Rc<PipelineLayout>> {
        self.layout.borrow().clone()
    }

    /// Number of live inbounds on this listener.
    #[must_use]
    pub fn inbound_count(&self) -> usize {
        let mut inbounds = self.inbounds.borrow_mut();
        inbounds.retain(|_, weak| weak.strong_count() > 0);
        inbounds.len()
    }

    /// Visits a snapshot of every live inbound.
    pub fn for_each_inbound(&self, mut f: impl FnMut(InboundSnapshot)) {
        let handles: Vec<_> = self
            .inbounds
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for handle in handles {
            f(handle.snapshot());
        }
    }

    /// Forcibly closes every live inbound.
    pub fn shut_all_inbounds(&self) {
        let handles: Vec<_> = self
            .inbounds
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for handle in handles {
            handle.shut();
        }
    }

    pub(crate) fn open(&self, id: u64, handle: Weak<dyn InboundHandle>) {
        self.inbounds.borrow_mut().insert(id, handle);
    }

    pub(crate) fn close(&self, id: u64) {
        self.inbounds.borrow_mut().remove(&id);
    }

    fn bind(&self) -> io::Result<PendingSocket> {
        let addr = SocketAddr::new(self.ip, self.port);
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let ty = match self.protocol {
            Protocol::Tcp => Type::STREAM,
            Protocol::Udp => Type::DGRAM,
        };
        let socket = Socket::new(domain, ty, None)?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        if REUSE_PORT.load(Ordering::Relaxed) {
            socket.set_reuse_port(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        let pending = match self.protocol {
            Protocol::Tcp => {
                socket.listen(128)?;
                PendingSocket::Tcp(tokio::net::TcpListener::from_std(socket.into())?)
            }
            Protocol::Udp => PendingSocket::Udp(tokio::net::UdpSocket::from_std(socket.into())?),
        };
        let bound = match &pending {
            PendingSocket::Tcp(l) => l.local_addr()?,
            PendingSocket::Udp(s) => s.local_addr()?,
        };
        self.bound_addr.set(Some(bound));
        Ok(pending)
    }

    fn start_accepting(self: &Rc<Self>, pending: PendingSocket) {
        if self.metrics.borrow().is_none() {
            *self.metrics.borrow_mut() =
                Some(Rc::new(ListenerMetrics::new(self.protocol, self.ip, self.port)));
        }
        let weak = Rc::downgrade(self);
        let task = match pending {
            PendingSocket::Tcp(socket) => tokio::task::spawn_local(accept_tcp(weak, socket)),
            PendingSocket::Udp(socket) => {
                let socket = Rc::new(socket);
                let sessions: UdpSessions = Rc::new(RefCell::new(HashMap::new()));
                *self.udp_sessions.borrow_mut() = Some(sessions.clone());
                if self.options.borrow().masquerade {
                    match MasqueradeSocket::new() {
                        Ok(masq) => *self.masquerade.borrow_mut() = Some(Rc::new(masq)),
                        Err(e) => {
                            error!("masquerade socket unavailable, replying directly: {e}");
                        }
                    }
                }
                tokio::task::spawn_local(accept_udp(weak, socket, sessions))
            }
        };
        *self.accept_task.borrow_mut() = Some(task);
        info!(protocol = %self.protocol, ip = %self.ip, port = self.port, "listening");
    }

    fn stop_listening(&self) {
        if let Some(task) = self.accept_task.borrow_mut().take() {
            task.abort();
        }
        *self.pending.borrow_mut() = None;
        *self.layout.borrow_mut() = None;
        self.bound_addr.set(None);
        let sessions = self.udp_sessions.borrow_mut().take();
        if let Some(sessions) = sessions {
            let all: Vec<_> = sessions.borrow().values().cloned().collect();
            for session in all {
                session.stop();
            }
        }
        *self.masquerade.borrow_mut() = None;
        info!(protocol = %self.protocol, ip = %self.ip, port = self.port, "stopped");
    }
}

async fn accept_tcp(listener: Weak<Listener>, socket: tokio::net::TcpListener) {
    loop {
        match socket.accept().await {
            Ok((stream, peer)) => {
                let Some(listener) = listener.upgrade() else {
                    break;
                };
                let layout = listener.layout.borrow().clone();
                let Some(layout) = layout else {
                    // Committed away in between; refuse the connection.
                    continue;
                };
                debug!(%peer, "connection accepted");
                let options = listener.options.borrow().clone();
                let metrics = listener.metrics.borrow().clone();
                InboundTcp::spawn(&listener, layout, options, metrics, stream, peer);
            }
            Err(e) => {
                error!("error accepting connection: {e}");
                tokio::task::yield_now().await;
            }
        }
    }
}

async fn accept_udp(
    listener: Weak<Listener>,
    socket: Rc<tokio::net::UdpSocket>,
    sessions: UdpSessions,
) {
    loop {
        let mut chunk = RawChunk::alloc();
        match socket.recv_from(chunk.bytes_mut()).await {
            Ok((n, peer)) => {
                let Some(listener) = listener.upgrade() else {
                    break;
                };
                let layout = listener.layout.borrow().clone();
                let Some(layout) = layout else {
                    continue;
                };
                let session = {
                    let mut sessions_mut = sessions.borrow_mut();
                    sessions_mut
                        .entry(peer)
                        .or_insert_with(|| {
                            InboundUdp::new(
                                &listener,
                                layout,
                                listener.options.borrow().clone(),
                                listener.metrics.borrow().clone(),
                                socket.clone(),
                                listener.masquerade.borrow().clone(),
                                peer,
                                Rc::downgrade(&sessions),
                            )
                        })
                        .clone()
                };
                session.receive(chunk.into_data(n));
            }
            Err(e) => {
                error!("error receiving datagram: {e}");
                tokio::task::yield_now().await;
            }
        }
    }
}
