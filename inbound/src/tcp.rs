// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

//! One accepted TCP connection.

use crate::listener::{InboundHandle, Listener, ListenerMetrics};
use crate::options::ListenerOptions;
use crate::{InboundBase, InboundSnapshot};
use buffer::{Data, RawChunk};
use pipeline::{Context, ErrorKind, Event, InboundInfo, Pipeline, PipelineLayout, Tap};
use std::cell::{Cell, RefCell};
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, warn};

/// Read-side lifecycle of a TCP inbound.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ReceiveState {
    Accepting,
    Reading,
    Paused,
    Lingering,
    Closed,
}

impl ReceiveState {
    fn name(self) -> &'static str {
        match self {
            ReceiveState::Accepting => "accepting",
            ReceiveState::Reading => "reading",
            ReceiveState::Paused => "paused",
            ReceiveState::Lingering => "lingering",
            ReceiveState::Closed => "closed",
        }
    }
}

/// One accepted TCP connection: a read pump feeding the pipeline and a
/// write pump draining what the pipeline emits.
///
/// The read side keeps a single outstanding read into a pooled chunk and
/// drains whatever else the kernel already has via non-blocking reads, so a
/// burst becomes one `Data` event instead of many. The write side coalesces
/// `Data` events into a buffer and keeps a single write in flight until the
/// buffer drains; when the stream has ended and the buffer is empty the
/// socket is shut down and the connection closes.
pub struct InboundTcp {
    base: InboundBase,
    listener: Weak<Listener>,
    options: ListenerOptions,
    metrics: Option<Rc<ListenerMetrics>>,
    tap: Tap,
    pipeline: RefCell<Option<Rc<RefCell<Pipeline>>>>,
    write_buf: RefCell<Data>,
    write_ended: Cell<bool>,
    end_error: Cell<ErrorKind>,
    flush: Notify,
    closed: Cell<bool>,
    close_notify: Notify,
    paused: Cell<bool>,
    resume: Notify,
    pumping: Cell<bool>,
    tap_closed_by_buffer: Cell<bool>,
    state: Cell<ReceiveState>,
    idle_deadline: Cell<Option<Instant>>,
}

impl InboundTcp {
    pub(crate) fn spawn(
        listener: &Rc<Listener>,
        layout: Rc<PipelineLayout>,
        options: ListenerOptions,
        metrics: Option<Rc<ListenerMetrics>>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Rc<InboundTcp> {
        let local_addr = stream.local_addr().ok();
        let original_dst = if options.transparent {
            crate::original_dst(&stream)
        } else {
            None
        };

        let inbound = Rc::new(InboundTcp {
            base: InboundBase::new(peer, local_addr, original_dst),
            listener: Rc::downgrade(listener),
            options,
            metrics,
            tap: Tap::new(),
            pipeline: RefCell::new(None),
            write_buf: RefCell::new(Data::new()),
            write_ended: Cell::new(false),
            end_error: Cell::new(ErrorKind::NoError),
            flush: Notify::new(),
            closed: Cell::new(false),
            close_notify: Notify::new(),
            paused: Cell::new(false),
            resume: Notify::new(),
            pumping: Cell::new(false),
            tap_closed_by_buffer: Cell::new(false),
            state: Cell::new(ReceiveState::Accepting),
            idle_deadline: Cell::new(None),
        });
        debug!(id = inbound.base.id, %peer, "inbound up");

        let watcher = Rc::downgrade(&inbound);
        inbound.tap.watch(move |open| {
            if let Some(inbound) = watcher.upgrade() {
                inbound.on_tap(open);
            }
        });

        let info: Rc<dyn InboundInfo> = inbound.clone();
        let context = Context::for_inbound(info, inbound.tap.clone());
        let pipeline = Pipeline::make(&layout, context);
        let sink = Rc::downgrade(&inbound);
        pipeline.borrow_mut().chain(move |event| {
            if let Some(inbound) = sink.upgrade() {
                inbound.on_event(event);
            }
        });
        pipeline.borrow_mut().start();
        *inbound.pipeline.borrow_mut() = Some(pipeline);

        let handle: Rc<dyn InboundHandle> = inbound.clone();
        listener.open(inbound.base.id, Rc::downgrade(&handle));

        let (read_half, write_half) = stream.into_split();
        inbound.state.set(ReceiveState::Reading);
        if inbound.options.idle_timeout.is_some() {
            inbound.touch_idle();
            tokio::task::spawn_local(idle_task(inbound.clone()));
        }
        tokio::task::spawn_local(read_task(inbound.clone(), read_half));
        tokio::task::spawn_local(write_task(inbound.clone(), write_half));
        inbound
    }

    /// Bytes received from the peer so far.
    #[must_use]
    pub fn traffic_in(&self) -> u64 {
        self.base.traffic_in.get()
    }

    /// Bytes sent to the peer so far.
    #[must_use]
    pub fn traffic_out(&self) -> u64 {
        self.base.traffic_out.get()
    }

    fn input(&self, event: Event) {
        let pipeline = self.pipeline.borrow().clone();
        if let Some(pipeline) = pipeline {
            pipeline.borrow_mut().input(event);
        }
    }

    /// Sink for the pipeline's output.
    fn on_event(&self, event: Event) {
        if self.write_ended.get() {
            return;
        }
        match event {
            Event::Data(data) => {
                if data.is_empty() {
                    return;
                }
                let buffered = {
                    let mut buf = self.write_buf.borrow_mut();
                    buf.push_data(&data);
                    buf.len()
                };
                if let Some(max) = self.options.max_buffer_size {
                    if buffered > max && !self.tap_closed_by_buffer.replace(true) {
                        self.tap.close();
                    }
                }
                self.flush.notify_one();
            }
            Event::StreamEnd(err) => {
                self.write_ended.set(true);
                self.end_error.set(err);
                self.flush.notify_one();
            }
            // Message boundaries carry nothing on a raw TCP stream.
            Event::MessageStart(_) | Event::MessageEnd(_) => {}
        }
    }

    fn on_tap(&self, open: bool) {
        if open {
            if self.paused.replace(false) {
                self.resume.notify_one();
            }
        } else if !self.closed.get() {
            self.paused.set(true);
        }
    }

    fn maybe_reopen_tap(&self) {
        if self.tap_closed_by_buffer.get() {
            let max = self.options.max_buffer_size.unwrap_or(0);
            if self.write_buf.borrow().len() <= max / 2 {
                self.tap_closed_by_buffer.set(false);
                self.tap.open();
            }
        }
    }

    fn touch_idle(&self) {
        if let Some(idle) = self.options.idle_timeout {
            self.idle_deadline.set(Some(Instant::now() + idle));
        }
    }

    fn close(&self, err: ErrorKind) {
        if self.closed.replace(true) {
            return;
        }
        self.state.set(ReceiveState::Closed);
        if err.is_error() {
            warn!(id = self.base.id, error = %err, "connection closed");
        } else {
            debug!(id = self.base.id, "connection closed to peer");
        }
        self.close_notify.notify_waiters();
        self.resume.notify_one();
        self.input(Event::StreamEnd(err));
        *self.pipeline.borrow_mut() = None;
    }
}

impl InboundInfo for InboundTcp {
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

impl InboundHandle for InboundTcp {
    fn id(&self) -> u64 {
        self.base.id
    }

    fn shut(&self) {
        self.close(ErrorKind::NoError);
    }

    fn snapshot(&self) -> InboundSnapshot {
        InboundSnapshot {
            id: self.base.id,
            local_addr: self.base.local_addr,
            remote_addr: Some(self.base.remote_addr),
            traffic_in: self.base.traffic_in.get(),
            traffic_out: self.base.traffic_out.get(),
            state: self.state.get().name(),
        }
    }
}

impl Drop for InboundTcp {
    fn drop(&mut self) {
        debug!(id = self.base.id, "inbound down");
        if let Some(listener) = self.listener.upgrade() {
            listener.close(self.base.id);
        }
    }
}

async fn read_task(inbound: Rc<InboundTcp>, mut read_half: OwnedReadHalf) {
    loop {
        if inbound.closed.get() {
            break;
        }
        if inbound.paused.get() {
            inbound.state.set(ReceiveState::Paused);
            debug!(id = inbound.base.id, "read paused");
            tokio::select! {
                () = inbound.resume.notified() => {}
                () = inbound.close_notify.notified() => {}
            }
            if inbound.closed.get() {
                break;
            }
            inbound.state.set(ReceiveState::Reading);
            debug!(id = inbound.base.id, "read resumed");
            continue;
        }
        let mut chunk = RawChunk::alloc();
        let outcome = tokio::select! {
            () = inbound.close_notify.notified() => None,
            result = read_some(&mut read_half, chunk.bytes_mut(), inbound.options.read_timeout) => {
                Some(result)
            }
        };
        let Some(result) = outcome else {
            break;
        };
        match result {
            Ok(0) => {
                debug!(id = inbound.base.id, "EOF from peer");
                inbound.state.set(ReceiveState::Lingering);
                inbound.input(Event::StreamEnd(ErrorKind::NoError));
                break;
            }
            Ok(n) => {
                let mut data = chunk.into_data(n);
                drain_available(&read_half, &mut data);
                inbound.base.add_traffic_in(data.len());
                if let Some(metrics) = &inbound.metrics {
                    metrics.traffic_in.metric.increment(data.len() as u64);
                }
                inbound.touch_idle();
                inbound.input(Event::Data(data));
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                inbound.close(ErrorKind::ReadTimeout);
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                warn!(id = inbound.base.id, "connection reset by peer");
                inbound.close(ErrorKind::ConnectionReset);
                break;
            }
            Err(e) => {
                warn!(id = inbound.base.id, "error reading from peer: {e}");
                inbound.close(ErrorKind::ReadError);
                break;
            }
        }
    }
}

async fn read_some(
    read_half: &mut OwnedReadHalf,
    buf: &mut [u8],
    read_timeout: Option<Duration>,
) -> io::Result<usize> {
    match read_timeout {
        Some(limit) => match timeout(limit, read_half.read(buf)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
        },
        None => read_half.read(buf).await,
    }
}

/// Drains whatever the kernel receive queue already holds, without blocking,
/// extending `data` one chunk at a time.
fn drain_available(read_half: &OwnedReadHalf, data: &mut Data) {
    loop {
        let mut chunk = RawChunk::alloc();
        match read_half.try_read(chunk.bytes_mut()) {
            // EOF surfaces on the next async read.
            Ok(0) => break,
            Ok(n) => data.push_data(&chunk.into_data(n)),
            Err(_) => break,
        }
    }
}

async fn write_task(inbound: Rc<InboundTcp>, mut write_half: OwnedWriteHalf) {
    'outer: loop {
        if inbound.closed.get() {
            break;
        }
        tokio::select! {
            () = inbound.flush.notified() => {}
            () = inbound.close_notify.notified() => break,
        }
        loop {
            if inbound.closed.get() {
                break 'outer;
            }
            let mut batch = {
                let mut buf = inbound.write_buf.borrow_mut();
                let len = buf.len();
                buf.shift(len)
            };
            if batch.is_empty() {
                break;
            }
            inbound.pumping.set(true);
            while !batch.is_empty() {
                match write_some(&mut write_half, &batch, inbound.options.write_timeout).await {
                    Ok(0) => {
                        inbound.pumping.set(false);
                        inbound.close(ErrorKind::WriteError);
                        break 'outer;
                    }
                    Ok(n) => {
                        let _ = batch.shift(n);
                        inbound.base.add_traffic_out(n);
                        if let Some(metrics) = &inbound.metrics {
                            metrics.traffic_out.metric.increment(n as u64);
                        }
                        inbound.touch_idle();
                    }
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                        inbound.pumping.set(false);
                        inbound.close(ErrorKind::WriteTimeout);
                        break 'outer;
                    }
                    Err(e) => {
                        warn!(id = inbound.base.id, "error writing to peer: {e}");
                        inbound.pumping.set(false);
                        inbound.close(ErrorKind::WriteError);
                        break 'outer;
                    }
                }
            }
            inbound.pumping.set(false);
            inbound.maybe_reopen_tap();
        }
        if inbound.write_ended.get() && inbound.write_buf.borrow().is_empty() {
            let err = inbound.end_error.get();
            if !err.is_error() {
                let _ = write_half.shutdown().await;
            }
            inbound.close(err);
            break;
        }
    }
}

async fn write_some(
    write_half: &mut OwnedWriteHalf,
    batch: &Data,
    write_timeout: Option<Duration>,
) -> io::Result<usize> {
    let slices: Vec<IoSlice<'_>> = batch.chunks().map(IoSlice::new).collect();
    match write_timeout {
        Some(limit) => match timeout(limit, write_half.write_vectored(&slices)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
        },
        None => write_half.write_vectored(&slices).await,
    }
}

async fn idle_task(inbound: Rc<InboundTcp>) {
    loop {
        if inbound.closed.get() {
            break;
        }
        let Some(deadline) = inbound.idle_deadline.get() else {
            break;
        };
        tokio::select! {
            () = inbound.close_notify.notified() => break,
            () = sleep_until(deadline) => {
                if inbound.closed.get() {
                    break;
                }
                match inbound.idle_deadline.get() {
                    Some(current) if Instant::now() >= current => {
                        inbound.close(ErrorKind::IdleTimeout);
                        break;
                    }
                    // I/O progress pushed the deadline; sleep again.
                    Some(_) => {}
                    None => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::listener::Protocol;
    use pipeline::sample_filters::{Passthrough, Throttle};
    use pipeline::{ContextHandle, Filter, Output};
    use std::future::Future;
    use std::net::{IpAddr, Ipv4Addr};
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

    /// Records every `StreamEnd` kind that passes through.
    struct CaptureEnd {
        kinds: Rc<RefCell<Vec<ErrorKind>>>,
    }

    impl Filter for CaptureEnd {
        fn name(&self) -> &'static str {
            "capture-end"
        }

        fn process(&mut self, _ctx: &ContextHandle, event: Event, out: &mut Output<'_>) {
            if let Event::StreamEnd(kind) = &event {
                self.kinds.borrow_mut().push(*kind);
            }
            out(event);
        }

        fn clone_filter(&self) -> Box<dyn Filter> {
            Box::new(CaptureEnd {
                kinds: self.kinds.clone(),
            })
        }
    }

    async fn wait_for_drained(listener: &Rc<Listener>, within: Duration) {
        let deadline = Instant::now() + within;
        while listener.inbound_count() > 0 {
            assert!(Instant::now() < deadline, "inbounds not released in time");
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn echo_roundtrip_counts_traffic() {
        run_local(async {
            let listener = Listener::get(Protocol::Tcp, localhost(), 0);
            let layout = PipelineLayout::new("echo", vec![Box::new(Passthrough)]);
            listener
                .set_next_state(Some(layout), ListenerOptions::default())
                .unwrap();
            listener.commit();
            let addr = listener.local_addr().unwrap();

            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"hello").await.unwrap();

            let mut echoed = [0u8; 5];
            client.read_exact(&mut echoed).await.unwrap();
            assert_eq!(&echoed, b"hello");

            let mut seen = None;
            listener.for_each_inbound(|snapshot| seen = Some(snapshot));
            let snapshot = seen.unwrap();
            assert_eq!(snapshot.traffic_in, 5);
            assert_eq!(snapshot.traffic_out, 5);

            client.shutdown().await.unwrap();
            let mut rest = Vec::new();
            client.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());

            wait_for_drained(&listener, Duration::from_secs(1)).await;
        });
    }

    #[test]
    fn backpressure_pauses_and_loses_nothing() {
        run_local(async {
            const TOTAL: usize = 1024 * 1024;

            let listener = Listener::get(Protocol::Tcp, localhost(), 0);
            let layout = PipelineLayout::new(
                "throttled-echo",
                vec![
                    Box::new(Throttle::new(256 * 1024, Duration::from_millis(50))),
                    Box::new(Passthrough),
                ],
            );
            listener
                .set_next_state(Some(layout), ListenerOptions::default())
                .unwrap();
            listener.commit();
            let addr = listener.local_addr().unwrap();

            let paused_seen = Rc::new(Cell::new(false));
            let done = Rc::new(Cell::new(false));
            {
                let listener = listener.clone();
                let paused_seen = paused_seen.clone();
                let done = done.clone();
                tokio::task::spawn_local(async move {
                    while !done.get() {
                        listener.for_each_inbound(|snapshot| {
                            if snapshot.state == "paused" {
                                paused_seen.set(true);
                            }
                        });
                        sleep(Duration::from_millis(2)).await;
                    }
                });
            }

            let mut client = TcpStream::connect(addr).await.unwrap();
            let payload = vec![0x5a_u8; TOTAL];
            let (mut rd, mut wr) = client.split();

            let write = async {
                wr.write_all(&payload).await.unwrap();
                wr.shutdown().await.unwrap();
            };
            let read = async {
                let mut received = Vec::with_capacity(TOTAL);
                rd.read_to_end(&mut received).await.unwrap();
                received
            };
            let ((), received) = tokio::join!(write, read);
            done.set(true);

            assert_eq!(received.len(), TOTAL);
            assert!(received.iter().all(|&b| b == 0x5a));
            assert!(paused_seen.get(), "read pause was never observed");
        });
    }

    #[test]
    fn idle_timeout_closes_silent_connections() {
        run_local(async {
            let kinds = Rc::new(RefCell::new(Vec::new()));
            let listener = Listener::get(Protocol::Tcp, localhost(), 0);
            let layout = PipelineLayout::new(
                "idle",
                vec![
                    Box::new(CaptureEnd {
                        kinds: kinds.clone(),
                    }),
                    Box::new(Passthrough),
                ],
            );
            let options = ListenerOptions {
                idle_timeout: Some(Duration::from_millis(200)),
                ..ListenerOptions::default()
            };
            listener.set_next_state(Some(layout), options).unwrap();
            listener.commit();
            let addr = listener.local_addr().unwrap();

            let started = Instant::now();
            let mut client = TcpStream::connect(addr).await.unwrap();
            let mut buf = [0u8; 16];
            // Close arrives as EOF or as a reset, depending on how the
            // kernel tears the socket down.
            let _ = client.read(&mut buf).await;
            assert!(started.elapsed() >= Duration::from_millis(200));

            wait_for_drained(&listener, Duration::from_secs(1)).await;
            assert!(kinds.borrow().contains(&ErrorKind::IdleTimeout));
        });
    }
}
