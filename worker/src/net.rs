// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

//! Event-loop plumbing: closures posted across threads, and the main loop.
//!
//! Every thread that runs an event loop exposes a [`NetHandle`]; posting a
//! closure is the only way to touch another thread's state. The main thread
//! runs [`MainLoop`], where the worker manager coalesces non-blocking
//! collections and where signal handling lives.

use std::future::Future;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tokio::sync::mpsc;
use tracing::error;

/// A closure shipped to another thread's event loop.
pub type Task = Box<dyn FnOnce() + Send>;

static MAIN: OnceLock<NetHandle> = OnceLock::new();
static EXIT_REQUESTED: AtomicBool = AtomicBool::new(false);
static EXIT_CODE: AtomicI32 = AtomicI32::new(0);

/// Posting endpoint of one event loop.
#[derive(Clone)]
pub struct NetHandle {
    tx: mpsc::UnboundedSender<Task>,
}

impl NetHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Task>) -> Self {
        Self { tx }
    }

    /// Enqueues `f` on the loop. Returns false once the loop is gone.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(f)).is_ok()
    }
}

/// The main thread's handle, once [`MainLoop::new`] has installed it.
#[must_use]
pub fn main_handle() -> Option<NetHandle> {
    MAIN.get().cloned()
}

/// Asks the main loop to wind down with the given process exit code.
pub fn request_exit(code: i32) {
    EXIT_CODE.store(code, Ordering::Relaxed);
    EXIT_REQUESTED.store(true, Ordering::Relaxed);
    if let Some(main) = main_handle() {
        // Wake the loop so it notices.
        main.post(|| {});
    }
}

/// The main thread's event loop.
pub struct MainLoop {
    rx: mpsc::UnboundedReceiver<Task>,
}

impl MainLoop {
    /// Creates the loop and installs the global main handle.
    #[must_use]
    pub fn new() -> MainLoop {
        let (tx, rx) = mpsc::unbounded_channel();
        if MAIN.set(NetHandle::new(tx)).is_err() {
            error!("main loop installed twice");
        }
        MainLoop { rx }
    }

    /// Runs posted tasks (with `background` alongside, e.g. signal watchers)
    /// until an exit is requested; returns the exit code.
    pub fn run<F>(mut self, background: F) -> i32
    where
        F: Future<Output = ()> + 'static,
    {
        let Ok(rt) = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        else {
            error!("unable to build the main runtime");
            return 1;
        };
        let local = tokio::task::LocalSet::new();
        local.block_on(&rt, async move {
            let _background = tokio::task::spawn_local(background);
            while !EXIT_REQUESTED.load(Ordering::Relaxed) {
                match self.rx.recv().await {
                    Some(task) => task(),
                    None => break,
                }
            }
        });
        EXIT_CODE.load(Ordering::Relaxed)
    }
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}
