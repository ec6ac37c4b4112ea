// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

//! One OS thread running one worker event loop.

use crate::api;
use crate::codebase;
use crate::net::{NetHandle, Task};
use crate::worker::Worker;
use inbound::{Listener, ListenerOptions};
use metrics::Unit;
use pipeline::PipelineLayout;
use stats::{MetricData, MetricSpec, Register, Registered, WorkerStatus};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Why a worker (or the whole manager) failed to start.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StartError {
    /// The manager already runs worker threads.
    #[error("workers already started")]
    AlreadyStarted,
    /// The OS thread could not be spawned.
    #[error("unable to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    /// The per-thread runtime could not be built.
    #[error("unable to build worker runtime: {0}")]
    Runtime(#[source] std::io::Error),
    /// No codebase has been installed.
    #[error("no codebase configured")]
    NoCodebase,
    /// The codebase has no entry module.
    #[error("codebase has no entry point")]
    NoEntry,
    /// The entry module reported an error.
    #[error("entry module failed: {0}")]
    Module(String),
    /// The thread died before reporting readiness.
    #[error("worker thread died during startup")]
    Died,
}

thread_local! {
    static STOP_NOW: Cell<bool> = const { Cell::new(false) };
    static NEW_WORKER: RefCell<Option<(Rc<Worker>, String)>> = const { RefCell::new(None) };
}

/// Handle to one worker thread: an OS thread running a single-threaded
/// event loop, the current [`Worker`], and this thread's metric gauges.
///
/// All interaction goes through closures posted to the thread's loop.
pub struct WorkerThread {
    index: usize,
    handle: Option<thread::JoinHandle<()>>,
    net: NetHandle,
    shutdown: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
    active_pipelines: Arc<AtomicUsize>,
    version: Arc<Mutex<String>>,
}

impl WorkerThread {
    /// Spawns the thread and blocks until its worker has started or failed.
    ///
    /// # Errors
    ///
    /// Returns [`StartError`] when the thread, its runtime, or the entry
    /// module failed; the thread is already joined by then.
    pub fn start(index: usize) -> Result<WorkerThread, StartError> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<NetHandle, StartError>>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));
        let active_pipelines = Arc::new(AtomicUsize::new(0));
        let version = Arc::new(Mutex::new(String::new()));

        let thread_done = done.clone();
        let thread_shutdown = shutdown.clone();
        let thread_active = active_pipelines.clone();
        let thread_version = version.clone();
        let handle = thread::Builder::new()
            .name(format!("worker-{index}"))
            .spawn(move || {
                worker_main(
                    index,
                    &ready_tx,
                    &thread_shutdown,
                    &thread_active,
                    &thread_version,
                );
                thread_done.store(true, Ordering::Relaxed);
            })
            .map_err(StartError::Spawn)?;

        match ready_rx.recv() {
            Ok(Ok(net)) => Ok(WorkerThread {
                index,
                handle: Some(handle),
                net,
                shutdown,
                done,
                active_pipelines,
                version,
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(StartError::Died)
            }
        }
    }

    /// Thread index within the manager.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Live pipelines as of the thread's last recycle tick.
    #[must_use]
    pub fn active_pipeline_count(&self) -> usize {
        self.active_pipelines.load(Ordering::Relaxed)
    }

    /// Posts a closure onto the thread's event loop. Returns false once the
    /// loop has exited.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) -> bool {
        self.net.post(f)
    }

    /// Collects a status snapshot on the worker thread, then hands it to
    /// `cb` there. Returns false once the loop has exited (and `cb` will
    /// never run).
    pub fn status(&self, cb: impl FnOnce(WorkerStatus) + Send + 'static) -> bool {
        let index = self.index;
        let version = self.version.clone();
        self.net.post(move || {
            cb(WorkerStatus {
                thread: index,
                version: version
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone(),
                active_pipelines: PipelineLayout::active_pipeline_count(),
                inbound_count: inbound::count(),
            });
        })
    }

    /// Collects a metric sample on the worker thread, then hands it to
    /// `cb` there. Returns false once the loop has exited.
    pub fn stats(&self, cb: impl FnOnce(MetricData) + Send + 'static) -> bool {
        self.net.post(move || {
            cb(collect_metrics());
        })
    }

    /// Phase one of a reload: construct and bind a new worker from the
    /// current codebase without starting it; report the outcome. Returns
    /// false once the loop has exited.
    pub fn reload(&self, cb: impl FnOnce(bool) + Send + 'static) -> bool {
        let index = self.index;
        self.net.post(move || {
            let staged = (|| -> Result<(Rc<Worker>, String), StartError> {
                let codebase = codebase::current().ok_or(StartError::NoCodebase)?;
                let entry = codebase.entry().ok_or(StartError::NoEntry)?;
                let version = codebase.version();
                info!(thread = index, version, "reloading codebase");
                let worker = Worker::make(index, false);
                worker
                    .load(&entry)
                    .map_err(|e| StartError::Module(e.to_string()))?;
                Ok((worker, version))
            })();
            match staged {
                Ok(staged) => {
                    NEW_WORKER.with_borrow_mut(|new| *new = Some(staged));
                    cb(true);
                }
                Err(e) => {
                    error!(thread = index, "reload failed: {e}");
                    NEW_WORKER.with_borrow_mut(|new| *new = None);
                    cb(false);
                }
            }
        })
    }

    /// Phase two of a reload: start the staged worker and retire the old
    /// one when every thread succeeded, discard it otherwise.
    pub fn reload_done(&self, ok: bool) {
        let index = self.index;
        let version = self.version.clone();
        self.net.post(move || {
            let Some((new_worker, new_version)) = NEW_WORKER.with_borrow_mut(Option::take)
            else {
                return;
            };
            if ok {
                let old_worker = Worker::current();
                new_worker.start();
                if let Some(old_worker) = old_worker {
                    old_worker.stop();
                }
                *version.lock().unwrap_or_else(PoisonError::into_inner) = new_version.clone();
                info!(thread = index, version = new_version, "codebase reloaded");
            } else {
                new_worker.rollback();
                error!(thread = index, "discarded new worker after failed reload");
            }
        });
    }

    /// Stops the thread. Forced: tear down everything and join. Graceful:
    /// stop accepting, let pipelines drain, and report whether the loop has
    /// already exited.
    pub fn stop(&mut self, force: bool) -> bool {
        if force {
            self.net.post(|| {
                NEW_WORKER.with_borrow_mut(|new| *new = None);
                shutdown_all(true);
                STOP_NOW.with(|stop| stop.set(true));
            });
            self.join();
            true
        } else {
            if !self.shutdown.swap(true, Ordering::Relaxed) {
                self.net.post(|| {
                    NEW_WORKER.with_borrow_mut(|new| *new = None);
                    tokio::task::spawn_local(graceful_shutdown());
                });
            }
            self.done.load(Ordering::Relaxed)
        }
    }

    /// Joins the OS thread.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.join();
    }
}

fn worker_main(
    index: usize,
    ready_tx: &std::sync::mpsc::Sender<Result<NetHandle, StartError>>,
    shutdown: &AtomicBool,
    active_pipelines: &AtomicUsize,
    version: &Mutex<String>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready_tx.send(Err(StartError::Runtime(e)));
            return;
        }
    };
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, async {
        let (task_tx, mut task_rx) = mpsc::unbounded_channel::<Task>();

        let startup = (|| -> Result<(), StartError> {
            let codebase = codebase::current().ok_or(StartError::NoCodebase)?;
            let entry = codebase.entry().ok_or(StartError::NoEntry)?;
            *version.lock().unwrap_or_else(PoisonError::into_inner) = codebase.version();
            let worker = Worker::make(index, false);
            worker
                .load(&entry)
                .map_err(|e| StartError::Module(e.to_string()))?;
            worker.start();
            Ok(())
        })();
        if let Err(e) = startup {
            error!(thread = index, "failed to start: {e}");
            let _ = ready_tx.send(Err(e));
            return;
        }
        let _ = ready_tx.send(Ok(NetHandle::new(task_tx.clone())));
        info!(thread = index, "thread started");

        let gauges = init_metrics(index);
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                task = task_rx.recv() => match task {
                    Some(task) => task(),
                    None => break,
                },
                _ = tick.tick() => {
                    if recycle(&gauges, active_pipelines, shutdown) {
                        break;
                    }
                }
            }
            if STOP_NOW.with(Cell::get) {
                break;
            }
        }
        info!(thread = index, "thread ended");
    });
}

/// Once-per-second housekeeping: reclaim pool free lists, refresh gauges,
/// and stop the loop once a requested shutdown has drained every pipeline.
fn recycle(gauges: &WorkerGauges, active_pipelines: &AtomicUsize, shutdown: &AtomicBool) -> bool {
    buffer::pool::recycle();
    let active = PipelineLayout::active_pipeline_count();
    active_pipelines.store(active, Ordering::Relaxed);
    gauges.refresh(active);
    shutdown.load(Ordering::Relaxed) && active == 0
}

fn shutdown_all(force: bool) {
    if let Some(worker) = Worker::current() {
        worker.stop();
    }
    Listener::for_each(|listener| {
        if listener.is_listening() {
            let _ = listener.set_next_state(None, ListenerOptions::default());
            listener.commit();
        }
        if force {
            listener.shut_all_inbounds();
        }
    });
}

async fn graceful_shutdown() {
    for hook in api::take_exit_hooks() {
        if let Some(settled) = hook() {
            settled.await;
        }
    }
    shutdown_all(false);
}

struct WorkerGauges {
    pool_allocated: Registered<metrics::Gauge>,
    pool_spare: Registered<metrics::Gauge>,
    pipelines: Registered<metrics::Gauge>,
    inbounds: Registered<metrics::Gauge>,
}

impl WorkerGauges {
    #[allow(clippy::cast_precision_loss)]
    fn refresh(&self, active_pipelines: usize) {
        self.pool_allocated
            .metric
            .set(buffer::pool::allocated() as f64);
        self.pool_spare.metric.set(buffer::pool::pooled() as f64);
        self.pipelines.metric.set(active_pipelines as f64);
        self.inbounds.metric.set(inbound::count() as f64);
    }
}

fn init_metrics(index: usize) -> WorkerGauges {
    let thread = index.to_string();
    WorkerGauges {
        pool_allocated: MetricSpec::new("flowgate_pool_allocated_chunks", Unit::Count)
            .describe("Chunks checked out of the buffer pool")
            .label("thread", &thread)
            .register(),
        pool_spare: MetricSpec::new("flowgate_pool_spare_chunks", Unit::Count)
            .describe("Spare chunks on the thread free list")
            .label("thread", &thread)
            .register(),
        pipelines: MetricSpec::new("flowgate_pipeline_count", Unit::Count)
            .describe("Live pipelines on the thread")
            .label("thread", &thread)
            .register(),
        inbounds: MetricSpec::new("flowgate_inbound_count", Unit::Count)
            .describe("Live inbound connections on the thread")
            .label("thread", &thread)
            .register(),
    }
}

fn collect_metrics() -> MetricData {
    let (traffic_in, traffic_out) = inbound::traffic_totals();
    MetricData {
        chunks_allocated: buffer::pool::allocated(),
        chunks_pooled: buffer::pool::pooled(),
        active_pipelines: PipelineLayout::active_pipeline_count(),
        traffic_in,
        traffic_out,
    }
}
