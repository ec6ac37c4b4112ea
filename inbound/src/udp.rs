// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

//! UDP "sessions": one inbound per peer endpoint.

use crate::listener::{InboundHandle, Listener, ListenerMetrics};
use crate::masquerade::MasqueradeSocket;
use crate::options::ListenerOptions;
use crate::{InboundBase, InboundSnapshot};
use buffer::Data;
use pipeline::{Context, ErrorKind, Event, InboundInfo, Pipeline, PipelineLayout, Tap};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::rc::{Rc, Weak};
use tokio::net::UdpSocket;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

type SessionMap = Weak<RefCell<HashMap<SocketAddr, Rc<InboundUdp>>>>;

/// One synthetic UDP session, keyed by peer endpoint.
///
/// UDP has no accept: the listener's acceptor owns the socket and demuxes
/// datagrams here. Each inbound datagram becomes a
/// `MessageStart, Data, MessageEnd` triple on the session's pipeline; each
/// message the pipeline emits becomes exactly one datagram back to the
/// peer. A session with no traffic for the idle limit stops itself and
/// falls out of the listener's map.
pub struct InboundUdp {
    base: InboundBase,
    listener: Weak<Listener>,
    options: ListenerOptions,
    metrics: Option<Rc<ListenerMetrics>>,
    socket: Rc<UdpSocket>,
    masquerade: Option<Rc<MasqueradeSocket>>,
    peer: SocketAddr,
    sessions: SessionMap,
    pipeline: RefCell<Option<Rc<RefCell<Pipeline>>>>,
    message_started: Cell<bool>,
    buffer: RefCell<Data>,
    sending_size: Cell<usize>,
    idle_deadline: Cell<Instant>,
    stopped: Cell<bool>,
}

impl InboundUdp {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        listener: &Rc<Listener>,
        layout: Rc<PipelineLayout>,
        options: ListenerOptions,
        metrics: Option<Rc<ListenerMetrics>>,
        socket: Rc<UdpSocket>,
        masquerade: Option<Rc<MasqueradeSocket>>,
        peer: SocketAddr,
        sessions: SessionMap,
    ) -> Rc<InboundUdp> {
        let local_addr = socket.local_addr().ok();
        let original_dst = if options.transparent || options.masquerade {
            crate::original_dst(socket.as_ref())
        } else {
            None
        };
        let idle = options.idle_timeout;

        let session = Rc::new(InboundUdp {
            base: InboundBase::new(peer, local_addr, original_dst),
            listener: Rc::downgrade(listener),
            options,
            metrics,
            socket,
            masquerade,
            peer,
            sessions,
            pipeline: RefCell::new(None),
            message_started: Cell::new(false),
            buffer: RefCell::new(Data::new()),
            sending_size: Cell::new(0),
            idle_deadline: Cell::new(Instant::now()),
            stopped: Cell::new(false),
        });
        debug!(id = session.base.id, %peer, "udp session up");

        let info: Rc<dyn InboundInfo> = session.clone();
        let context = Context::for_inbound(info, Tap::new());
        let pipeline = Pipeline::make(&layout, context);
        let sink = Rc::downgrade(&session);
        pipeline.borrow_mut().chain(move |event| {
            if let Some(session) = sink.upgrade() {
                session.on_event(event);
            }
        });
        pipeline.borrow_mut().start();
        *session.pipeline.borrow_mut() = Some(pipeline);

        let handle: Rc<dyn InboundHandle> = session.clone();
        listener.open(session.base.id, Rc::downgrade(&handle));

        if idle.is_some() {
            session.wait_idle();
            tokio::task::spawn_local(idle_task(session.clone()));
        }
        session
    }

    /// Feeds one datagram into the session's pipeline.
    pub(crate) fn receive(&self, data: Data) {
        if self.stopped.get() {
            return;
        }
        self.wait_idle();
        self.base.add_traffic_in(data.len());
        if let Some(metrics) = &self.metrics {
            metrics.traffic_in.metric.increment(data.len() as u64);
        }
        let pipeline = self.pipeline.borrow().clone();
        if let Some(pipeline) = pipeline {
            let mut pipeline = pipeline.borrow_mut();
            pipeline.input(Event::MessageStart(None));
            pipeline.input(Event::Data(data));
            pipeline.input(Event::MessageEnd(None));
        }
    }

    /// Bytes currently accumulated or in flight towards the peer.
    #[must_use]
    pub fn size_in_buffer(&self) -> usize {
        self.buffer.borrow().len() + self.sending_size.get()
    }

    /// Ends the session: drops the pipeline and leaves the listener's map.
    pub(crate) fn stop(&self) {
        if self.stopped.replace(true) {
            return;
        }
        debug!(id = self.base.id, "udp session down");
        let pipeline = self.pipeline.borrow().clone();
        if let Some(pipeline) = pipeline {
            pipeline.borrow_mut().input(Event::StreamEnd(ErrorKind::NoError));
        }
        *self.pipeline.borrow_mut() = None;
        if let Some(sessions) = self.sessions.upgrade() {
            sessions.borrow_mut().remove(&self.peer);
        }
    }

    /// Sink for the pipeline's output: buffers one message, then sends it
    /// as a single datagram.
    fn on_event(self: &Rc<Self>, event: Event) {
        if self.stopped.get() {
            return;
        }
        self.wait_idle();
        match event {
            Event::MessageStart(_) => {
                self.message_started.set(true);
                self.buffer.borrow_mut().clear();
            }
            Event::Data(data) => {
                if self.message_started.get() {
                    self.buffer.borrow_mut().push_data(&data);
                }
            }
            Event::MessageEnd(_) => {
                if self.message_started.replace(false) {
                    let payload = std::mem::take(&mut *self.buffer.borrow_mut());
                    self.send(payload);
                }
            }
            Event::StreamEnd(_) => {}
        }
    }

    fn send(self: &Rc<Self>, payload: Data) {
        let len = payload.len();
        self.sending_size.set(self.sending_size.get() + len);

        if let Some(masquerade) = &self.masquerade {
            if let (Some(SocketAddr::V4(source)), SocketAddr::V4(peer)) =
                (self.base.original_dst, self.peer)
            {
                let sent = masquerade.send_to(source, peer, &payload);
                self.finish_send(len, sent);
                return;
            }
            warn!(
                id = self.base.id,
                "masquerade needs an IPv4 original destination, replying directly"
            );
        }

        let session = self.clone();
        tokio::task::spawn_local(async move {
            let flat = payload.to_vec();
            let sent = session.socket.send_to(&flat, session.peer).await;
            session.finish_send(len, sent);
        });
    }

    fn finish_send(&self, len: usize, sent: std::io::Result<usize>) {
        self.sending_size.set(self.sending_size.get().saturating_sub(len));
        match sent {
            Ok(n) => {
                self.base.add_traffic_out(n);
                if let Some(metrics) = &self.metrics {
                    metrics.traffic_out.metric.increment(n as u64);
                }
            }
            Err(e) => warn!(id = self.base.id, "error sending datagram: {e}"),
        }
    }

    fn wait_idle(&self) {
        if let Some(idle) = self.options.idle_timeout {
            self.idle_deadline.set(Instant::now() + idle);
        }
    }
}

impl InboundInfo for InboundUdp {
    fn id(&self) -> u64 {
        self.base.id
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.base.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.base.remote_addr)
    }

    fn original_dst(&self) -> Option<SocketAddr> {
        self.base.original_dst
    }
}

impl InboundHandle for InboundUdp {
    fn id(&self) -> u64 {
        self.base.id
    }

    fn shut(&self) {
        self.stop();
    }

    fn snapshot(&self) -> InboundSnapshot {
        InboundSnapshot {
            id: self.base.id,
            local_addr: self.base.local_addr,
            remote_addr: Some(self.base.remote_addr),
            traffic_in: self.base.traffic_in.get(),
            traffic_out: self.base.traffic_out.get(),
            state: if self.stopped.get() { "stopped" } else { "open" },
        }
    }
}

impl Drop for InboundUdp {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.upgrade() {
            listener.close(self.base.id);
        }
    }
}

async fn idle_task(session: Rc<InboundUdp>) {
    loop {
        if session.stopped.get() {
            break;
        }
        let deadline = session.idle_deadline.get();
        sleep_until(deadline).await;
        if session.stopped.get() {
            break;
        }
        if Instant::now() >= session.idle_deadline.get() {
            session.stop();
            break;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::listener::Protocol;
    use pipeline::sample_filters::Passthrough;
    use std::future::Future;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::time::sleep;

    fn run_local<F: Future>(f: F) -> F::Output {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        tokio::task::LocalSet::new().block_on(&rt, f)
    }

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn sessions_demux_by_peer_and_reply_to_the_right_one() {
        run_local(async {
            let listener = Listener::get(Protocol::Udp, localhost(), 0);
            let layout = PipelineLayout::new("udp-echo", vec![Box::new(Passthrough)]);
            listener
                .set_next_state(Some(layout), ListenerOptions::default())
                .unwrap();
            listener.commit();
            let addr = listener.local_addr().unwrap();

            let client_a = UdpSocket::bind((localhost(), 0)).await.unwrap();
            let client_b = UdpSocket::bind((localhost(), 0)).await.unwrap();
            client_a.send_to(b"from-a", addr).await.unwrap();
            client_b.send_to(b"from-b", addr).await.unwrap();

            let mut buf = [0u8; 64];
            let (n, from) = client_a.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"from-a");
            assert_eq!(from, addr);
            let (n, from) = client_b.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"from-b");
            assert_eq!(from, addr);

            assert_eq!(listener.inbound_count(), 2);
            let mut peers = Vec::new();
            listener.for_each_inbound(|snapshot| peers.push(snapshot.remote_addr));
            assert_eq!(peers.len(), 2);
            assert_ne!(peers[0], peers[1]);
            assert!(peers.contains(&client_a.local_addr().ok()));
            assert!(peers.contains(&client_b.local_addr().ok()));
        });
    }

    #[test]
    fn idle_sessions_are_collected() {
        run_local(async {
            let listener = Listener::get(Protocol::Udp, localhost(), 0);
            let layout = PipelineLayout::new("udp-idle", vec![Box::new(Passthrough)]);
            let options = ListenerOptions {
                idle_timeout: Some(Duration::from_millis(100)),
                ..ListenerOptions::default()
            };
            listener.set_next_state(Some(layout), options).unwrap();
            listener.commit();
            let addr = listener.local_addr().unwrap();

            let client = UdpSocket::bind((localhost(), 0)).await.unwrap();
            client.send_to(b"ping", addr).await.unwrap();

            let mut buf = [0u8; 8];
            let (n, _) = client.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"ping");
            assert_eq!(listener.inbound_count(), 1);

            let deadline = Instant::now() + Duration::from_millis(300);
            while listener.inbound_count() > 0 {
                assert!(Instant::now() < deadline, "session not collected in time");
                sleep(Duration::from_millis(10)).await;
            }
        });
    }
}
