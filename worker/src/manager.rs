// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

//! Fan-out/fan-in orchestration across all worker threads.

use crate::net;
use crate::thread::{StartError, WorkerThread};
use stats::{MetricData, WorkerStatus};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::info;

static GLOBAL: OnceLock<WorkerManager> = OnceLock::new();

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Latch used by the blocking collects: posted closures push results and
/// the caller waits until every thread has answered.
struct Latch<T> {
    state: Mutex<Vec<T>>,
    cv: Condvar,
}

impl<T> Latch<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(Vec::new()),
            cv: Condvar::new(),
        }
    }

    fn push(&self, value: T) {
        lock(&self.state).push(value);
        self.cv.notify_one();
    }

    fn wait(&self, n: usize) -> Vec<T> {
        let mut state = lock(&self.state);
        while state.len() < n {
            state = self
                .cv
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        std::mem::take(&mut state)
    }
}

/// Singleton orchestrator of all [`WorkerThread`]s: start, live reload,
/// graceful and forced shutdown, and status/metric aggregation.
pub struct WorkerManager {
    threads: Mutex<Vec<WorkerThread>>,
    status_counter: AtomicUsize,
    stats_counter: AtomicUsize,
    status_sum: Mutex<WorkerStatus>,
    stats_sum: Mutex<MetricData>,
}

impl WorkerManager {
    /// The process-wide manager.
    pub fn global() -> &'static WorkerManager {
        GLOBAL.get_or_init(|| WorkerManager {
            threads: Mutex::new(Vec::new()),
            status_counter: AtomicUsize::new(0),
            stats_counter: AtomicUsize::new(0),
            status_sum: Mutex::new(WorkerStatus::default()),
            stats_sum: Mutex::new(MetricData::default()),
        })
    }

    /// Whether worker threads are running.
    #[must_use]
    pub fn started(&self) -> bool {
        !lock(&self.threads).is_empty()
    }

    /// Starts `concurrency` worker threads. If any fails to come up, every
    /// thread already started is torn down again.
    ///
    /// # Errors
    ///
    /// Returns the first thread's [`StartError`].
    pub fn start(&self, concurrency: usize) -> Result<(), StartError> {
        if self.started() {
            return Err(StartError::AlreadyStarted);
        }
        for index in 0..concurrency {
            match WorkerThread::start(index) {
                Ok(thread) => lock(&self.threads).push(thread),
                Err(e) => {
                    self.stop(true);
                    return Err(e);
                }
            }
        }
        info!(concurrency, "workers started");
        Ok(())
    }

    /// Blocking status collect, merged across threads. For administrative
    /// threads; never call it from a worker or the main loop.
    #[must_use]
    pub fn status(&self) -> WorkerStatus {
        let threads = lock(&self.threads);
        let n = threads.len();
        if n == 0 {
            return WorkerStatus::default();
        }
        let latch = std::sync::Arc::new(Latch::new());
        let mut posted = 0;
        for thread in threads.iter() {
            let latch = latch.clone();
            if thread.status(move |status| latch.push(status)) {
                posted += 1;
            }
        }
        drop(threads);
        let mut collected = latch.wait(posted);
        collected.sort_by_key(|status| status.thread);
        let mut merged = WorkerStatus::default();
        for (i, status) in collected.iter().enumerate() {
            if i == 0 {
                merged = status.clone();
            } else {
                merged.merge(status);
            }
        }
        merged
    }

    /// Blocking metric collect, summed across threads.
    #[must_use]
    pub fn stats(&self) -> MetricData {
        let threads = lock(&self.threads);
        let n = threads.len();
        if n == 0 {
            return MetricData::default();
        }
        let latch = std::sync::Arc::new(Latch::new());
        let mut posted = 0;
        for thread in threads.iter() {
            let latch = latch.clone();
            if thread.stats(move |data| latch.push(data)) {
                posted += 1;
            }
        }
        drop(threads);
        let collected = latch.wait(posted);
        let mut sum = MetricData::default();
        for (i, data) in collected.iter().enumerate() {
            sum.sum(data, i == 0);
        }
        sum
    }

    /// Non-blocking status collect: results coalesce on the main loop and
    /// `cb` runs there once. Refused (returns false) while a previous
    /// collect is still in flight or no main loop exists.
    pub fn status_async(&self, cb: impl FnOnce(WorkerStatus) + Send + 'static) -> bool {
        let Some(main) = net::main_handle() else {
            return false;
        };
        if self.status_counter.load(Ordering::SeqCst) > 0 {
            return false;
        }
        let threads = lock(&self.threads);
        let n = threads.len();
        if n == 0 {
            main.post(move || cb(WorkerStatus::default()));
            return true;
        }
        self.status_counter.store(n, Ordering::SeqCst);
        let cb = std::sync::Arc::new(Mutex::new(Some(Box::new(cb) as Box<dyn FnOnce(WorkerStatus) + Send>)));
        for thread in threads.iter() {
            let initial = thread.index() == 0;
            let main = main.clone();
            let cb = cb.clone();
            thread.status(move |status| {
                main.post(move || {
                    let manager = WorkerManager::global();
                    {
                        let mut sum = lock(&manager.status_sum);
                        if initial {
                            *sum = status;
                        } else {
                            sum.merge(&status);
                        }
                    }
                    if manager.status_counter.fetch_sub(1, Ordering::SeqCst) == 1 {
                        let merged = lock(&manager.status_sum).clone();
                        if let Some(cb) = lock(&cb).take() {
                            cb(merged);
                        }
                    }
                });
            });
        }
        true
    }

    /// Non-blocking metric collect; same protocol as
    /// [`WorkerManager::status_async`].
    pub fn stats_async(&self, cb: impl FnOnce(MetricData) + Send + 'static) -> bool {
        let Some(main) = net::main_handle() else {
            return false;
        };
        if self.stats_counter.load(Ordering::SeqCst) > 0 {
            return false;
        }
        let threads = lock(&self.threads);
        let n = threads.len();
        if n == 0 {
            main.post(move || cb(MetricData::default()));
            return true;
        }
        self.stats_counter.store(n, Ordering::SeqCst);
        let cb = std::sync::Arc::new(Mutex::new(Some(Box::new(cb) as Box<dyn FnOnce(MetricData) + Send>)));
        for thread in threads.iter() {
            let initial = thread.index() == 0;
            let main = main.clone();
            let cb = cb.clone();
            thread.stats(move |data| {
                main.post(move || {
                    let manager = WorkerManager::global();
                    lock(&manager.stats_sum).sum(&data, initial);
                    if manager.stats_counter.fetch_sub(1, Ordering::SeqCst) == 1 {
                        let summed = lock(&manager.stats_sum).clone();
                        if let Some(cb) = lock(&cb).take() {
                            cb(summed);
                        }
                    }
                });
            });
        }
        true
    }

    /// Two-phase live reload: every thread loads and binds a new worker
    /// from the current codebase; only if all of them succeed does any
    /// thread switch. Either all workers move to the new codebase or none.
    pub fn reload(&self) {
        let threads = lock(&self.threads);
        let n = threads.len();
        if n == 0 {
            return;
        }
        let latch = std::sync::Arc::new(Latch::new());
        let mut posted = 0;
        for thread in threads.iter() {
            let latch = latch.clone();
            if thread.reload(move |ok| latch.push(ok)) {
                posted += 1;
            }
        }
        // A thread whose loop is already gone counts as a failed load.
        let all_ok = posted == n && latch.wait(posted).into_iter().all(|ok| ok);
        for thread in threads.iter() {
            thread.reload_done(all_ok);
        }
    }

    /// Live pipelines across all threads, as of each thread's last tick.
    #[must_use]
    pub fn active_pipeline_count(&self) -> usize {
        lock(&self.threads)
            .iter()
            .map(WorkerThread::active_pipeline_count)
            .sum()
    }

    /// Stops all workers. Forced: tear down and join immediately, returns
    /// true. Graceful: initiate the drain and return true only once every
    /// thread's loop has observed "no active pipelines" and exited; callers
    /// poll until then.
    pub fn stop(&self, force: bool) -> bool {
        let mut threads = lock(&self.threads);
        let mut pending = false;
        for thread in threads.iter_mut() {
            if !thread.stop(force) {
                pending = true;
            }
        }
        if pending {
            return false;
        }
        for thread in threads.iter_mut() {
            thread.join();
        }
        threads.clear();
        self.status_counter.store(0, Ordering::SeqCst);
        self.stats_counter.store(0, Ordering::SeqCst);
        info!("workers stopped");
        true
    }
}
