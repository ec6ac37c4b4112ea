// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

//! The script-side surface of the core: what the scripting engine (an
//! external collaborator) calls to wire listeners, read files through
//! pipelines, watch the codebase, run subprocesses and shut the process
//! down.

use crate::codebase;
use crate::manager::WorkerManager;
use crate::net;
use crate::worker::Worker;
pub use crate::exec::{ExecError, ExecOptions, ExecResult, exec, exec_argv};
use buffer::RawChunk;
use inbound::{Listener, ListenerError, ListenerOptions, Protocol};
use pipeline::{Context, ErrorKind, Event, Pipeline, PipelineLayout};
use std::cell::RefCell;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::rc::Rc;
use tokio::io::AsyncReadExt;
use tracing::{error, info};

/// Where a listener should bind: a bare port (all IPv4 interfaces), or an
/// `address:port` / `[address]:port` string.
pub enum ListenTarget {
    /// Bare port on `0.0.0.0`.
    Port(u16),
    /// Address-and-port form.
    Addr(String),
}

impl From<u16> for ListenTarget {
    fn from(port: u16) -> Self {
        ListenTarget::Port(port)
    }
}

impl From<&str> for ListenTarget {
    fn from(addr: &str) -> Self {
        ListenTarget::Addr(addr.to_string())
    }
}

/// Failures of [`listen`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ListenError {
    /// The target was not a port or an `address:port` form.
    #[error("invalid 'address:port' form: '{0}'")]
    InvalidAddress(String),
    /// The port was outside 1..=65535.
    #[error("invalid port number")]
    PortRange,
    /// The listener could not bind.
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

fn parse_target(target: &ListenTarget) -> Result<(IpAddr, u16), ListenError> {
    match target {
        ListenTarget::Port(0) => Err(ListenError::PortRange),
        ListenTarget::Port(port) => Ok((IpAddr::V4(Ipv4Addr::UNSPECIFIED), *port)),
        ListenTarget::Addr(addr) => {
            let parsed: SocketAddr = addr
                .parse()
                .map_err(|_| ListenError::InvalidAddress(addr.clone()))?;
            Ok((parsed.ip(), parsed.port()))
        }
    }
}

/// Binds a listener (or stages a change to one) on the current thread and
/// points it at pipelines built from `layout`.
///
/// During module load the change is only staged; it commits when the worker
/// starts, so that a reload where any thread fails leaves every listener
/// untouched. A bind failure before the worker has started rolls the
/// listener back and surfaces the error; on a started worker the listener
/// keeps serving its current layout.
///
/// # Errors
///
/// Returns [`ListenError`] for unparseable targets and bind failures.
pub fn listen(
    target: impl Into<ListenTarget>,
    protocol: Protocol,
    options: ListenerOptions,
    layout: &Rc<PipelineLayout>,
) -> Result<(), ListenError> {
    let target = target.into();
    let (ip, port) = parse_target(&target)?;
    let worker = Worker::current();
    let listener = Listener::get(protocol, ip, port);

    if let Err(e) = listener.set_next_state(Some(layout.clone()), options) {
        let keep = worker
            .as_ref()
            .is_some_and(|w| w.started() || w.forced());
        if keep {
            error!("{e}");
        } else {
            listener.rollback();
            return Err(e.into());
        }
    }

    if let Some(worker) = &worker {
        worker.record_listener(listener.clone(), layout.clone());
        if worker.started() {
            listener.commit();
        }
    } else {
        listener.commit();
    }
    Ok(())
}

/// Failures of [`read`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ReadError {
    /// The file could not be opened.
    #[error("cannot open file: {0}")]
    Open(#[source] std::io::Error),
    /// Reading the file failed.
    #[error("cannot read file: {0}")]
    Read(#[source] std::io::Error),
}

/// Pumps a file through a pipeline built from `layout`, resolving with the
/// pipeline's result value once its stream has ended.
///
/// # Errors
///
/// Returns [`ReadError`] when the file cannot be opened or read.
pub async fn read(
    path: &str,
    layout: &Rc<PipelineLayout>,
) -> Result<Option<serde_json::Value>, ReadError> {
    let mut file = tokio::fs::File::open(path).await.map_err(ReadError::Open)?;

    let (tx, rx) = tokio::sync::oneshot::channel();
    let pipeline = Pipeline::make(layout, Context::new());
    pipeline.borrow_mut().on_end(move |result| {
        let _ = tx.send(result);
    });
    pipeline.borrow_mut().start();

    loop {
        let mut chunk = RawChunk::alloc();
        let n = file.read(chunk.bytes_mut()).await.map_err(ReadError::Read)?;
        if n == 0 {
            break;
        }
        pipeline.borrow_mut().input(Event::Data(chunk.into_data(n)));
    }
    pipeline
        .borrow_mut()
        .input(Event::StreamEnd(ErrorKind::NoError));

    Ok(rx.await.unwrap_or(None))
}

/// Resolves once the codebase reports the file changed.
///
/// # Errors
///
/// Returns [`WatchError`] when no codebase is installed or it goes away
/// without notifying.
pub async fn watch(path: &str) -> Result<(), WatchError> {
    let codebase = codebase::current().ok_or(WatchError::NoCodebase)?;
    let (tx, rx) = tokio::sync::oneshot::channel();
    let notify = Box::new(move || {
        let _ = tx.send(());
    });
    codebase.watch(path, notify);
    rx.await.map_err(|_| WatchError::Dropped)
}

/// Failures of [`watch`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WatchError {
    /// No codebase is installed.
    #[error("no codebase to watch")]
    NoCodebase,
    /// The codebase was dropped without firing the watcher.
    #[error("codebase went away")]
    Dropped,
}

/// An exit hook: runs during graceful shutdown and may return a future
/// that delays completion until it settles.
pub type ExitHook = Box<dyn FnOnce() -> Option<Pin<Box<dyn Future<Output = ()>>>>>;

thread_local! {
    static EXIT_HOOKS: RefCell<Vec<ExitHook>> = const { RefCell::new(Vec::new()) };
}

/// Registers a hook to run on this thread during graceful shutdown.
pub fn exit_hook(hook: impl FnOnce() -> Option<Pin<Box<dyn Future<Output = ()>>>> + 'static) {
    EXIT_HOOKS.with_borrow_mut(|hooks| hooks.push(Box::new(hook)));
}

pub(crate) fn take_exit_hooks() -> Vec<ExitHook> {
    EXIT_HOOKS.with_borrow_mut(std::mem::take)
}

/// Posts a graceful shutdown of the whole process, exiting with `code`.
pub fn exit(code: i32) {
    let Some(main) = net::main_handle() else {
        error!("exit({code}) requested before the main loop exists");
        return;
    };
    info!("exit({code}) requested");
    main.post(move || {
        WorkerManager::global().stop(true);
        net::request_exit(code);
    });
}

/// Runs `f` against a context freshly derived from the current worker's
/// root context.
pub fn fork<R>(f: impl FnOnce(&mut Context) -> R) -> R {
    let mut context = Worker::current().map_or_else(Context::new, |worker| {
        worker.root_context().borrow().fork()
    });
    f(&mut context)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codebase::StaticCodebase;
    use pipeline::{ContextHandle, Filter, Output};
    use std::future::Future;
    use std::sync::Arc;

    fn run_local<F: Future>(f: F) -> F::Output {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        tokio::task::LocalSet::new().block_on(&rt, f)
    }

    /// Counts body bytes and leaves the total as the pipeline result.
    struct ByteCount {
        total: usize,
    }

    impl Filter for ByteCount {
        fn name(&self) -> &'static str {
            "byte-count"
        }

        fn process(&mut self, ctx: &ContextHandle, event: Event, out: &mut Output<'_>) {
            match &event {
                Event::Data(data) => self.total += data.len(),
                Event::StreamEnd(_) => {
                    ctx.borrow_mut().set_result(serde_json::json!(self.total));
                }
                _ => {}
            }
            out(event);
        }

        fn clone_filter(&self) -> Box<dyn Filter> {
            Box::new(ByteCount { total: 0 })
        }
    }

    #[test]
    fn read_resolves_with_the_pipeline_result() {
        run_local(async {
            let path = std::env::temp_dir().join(format!(
                "flowgate-read-test-{}.txt",
                std::process::id()
            ));
            std::fs::write(&path, b"seven!!").unwrap();

            let layout = PipelineLayout::new("count", vec![Box::new(ByteCount { total: 0 })]);
            let result = read(path.to_string_lossy().as_ref(), &layout).await.unwrap();
            assert_eq!(result, Some(serde_json::json!(7)));

            let _ = std::fs::remove_file(&path);
        });
    }

    #[test]
    fn read_rejects_missing_files() {
        run_local(async {
            let layout = PipelineLayout::new(
                "count-missing",
                vec![Box::new(ByteCount { total: 0 })],
            );
            let result = read("/nonexistent/flowgate-read-test", &layout).await;
            assert!(matches!(result, Err(ReadError::Open(_))));
        });
    }

    #[test]
    fn listen_rolls_back_when_the_port_is_taken() {
        run_local(async {
            // Occupy a port, then ask for it without SO_REUSEPORT.
            let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = taken.local_addr().unwrap().to_string();

            let layout = PipelineLayout::new(
                "refused",
                vec![Box::new(pipeline::sample_filters::Passthrough)],
            );
            let result = listen(
                addr.as_str(),
                Protocol::Tcp,
                ListenerOptions::default(),
                &layout,
            );
            assert!(matches!(result, Err(ListenError::Listener(_))));

            let listener = Listener::get(
                Protocol::Tcp,
                taken.local_addr().unwrap().ip(),
                taken.local_addr().unwrap().port(),
            );
            assert!(!listener.is_listening());
        });
    }

    #[test]
    fn listen_rejects_bad_targets() {
        assert!(matches!(
            parse_target(&ListenTarget::Port(0)),
            Err(ListenError::PortRange)
        ));
        assert!(matches!(
            parse_target(&ListenTarget::Addr("not-an-address".to_string())),
            Err(ListenError::InvalidAddress(_))
        ));
        assert!(parse_target(&ListenTarget::Addr("[::1]:9000".to_string())).is_ok());
        assert!(parse_target(&ListenTarget::Port(9000)).is_ok());
    }

    #[test]
    fn watch_resolves_when_the_codebase_changes() {
        let _guard = crate::test_support::serialize();
        run_local(async {
            let codebase = Arc::new(StaticCodebase::new("v1", Arc::new(|| Ok(()))));
            codebase::set_current(codebase.clone());

            let waiting = tokio::task::spawn_local(async { watch("conf/cert.pem").await });
            tokio::task::yield_now().await;
            codebase.put_file("conf/cert.pem", b"---".to_vec());

            waiting.await.unwrap().unwrap();
        });
    }
}
