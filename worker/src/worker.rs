// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

use crate::codebase::{ModuleError, ModuleInit};
use inbound::{Listener, ListenerOptions};
use pipeline::{Context, ContextHandle, PipelineLayout};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::debug;

thread_local! {
    static CURRENT: RefCell<Option<Rc<Worker>>> = const { RefCell::new(None) };
}

/// One codebase incarnation on one worker thread.
///
/// Loading runs the entry module, which stages listeners through
/// [`crate::api::listen`]; [`Worker::start`] commits them all, and
/// [`Worker::stop`] decommissions whichever of them still run this worker's
/// layouts. After a reload has re-pointed a listener at the next worker's
/// layout, stop leaves it alone.
pub struct Worker {
    thread_index: usize,
    forced: bool,
    started: Cell<bool>,
    root_context: ContextHandle,
    listeners: RefCell<Vec<(Rc<Listener>, Rc<PipelineLayout>)>>,
}

impl Worker {
    /// Creates a worker for this thread. It becomes current on `start`.
    #[must_use]
    pub fn make(thread_index: usize, forced: bool) -> Rc<Worker> {
        Rc::new(Worker {
            thread_index,
            forced,
            started: Cell::new(false),
            root_context: Rc::new(RefCell::new(Context::new())),
            listeners: RefCell::new(Vec::new()),
        })
    }

    /// The worker currently serving this thread.
    #[must_use]
    pub fn current() -> Option<Rc<Worker>> {
        CURRENT.with_borrow(Clone::clone)
    }

    /// Index of the thread this worker belongs to.
    #[must_use]
    pub fn thread_index(&self) -> usize {
        self.thread_index
    }

    /// Whether `start` has run.
    #[must_use]
    pub fn started(&self) -> bool {
        self.started.get()
    }

    /// Whether the worker was created in forced mode, in which case listen
    /// failures during load do not roll the listener back.
    #[must_use]
    pub fn forced(&self) -> bool {
        self.forced
    }

    /// The worker's root context, from which `fork` derives.
    #[must_use]
    pub fn root_context(&self) -> &ContextHandle {
        &self.root_context
    }

    /// Runs the entry module with this worker as the loading worker, so its
    /// `listen` calls stage onto this worker. A failed load rolls the staged
    /// listeners back.
    ///
    /// # Errors
    ///
    /// Propagates the [`ModuleError`] the entry module reported.
    pub fn load(self: &Rc<Self>, entry: &ModuleInit) -> Result<(), ModuleError> {
        let previous = CURRENT.with_borrow_mut(|current| current.replace(self.clone()));
        let result = entry();
        CURRENT.with_borrow_mut(|current| *current = previous);
        if result.is_err() {
            self.rollback();
        }
        result
    }

    /// Commits every staged listener and makes this worker current.
    pub fn start(self: &Rc<Self>) {
        CURRENT.with_borrow_mut(|current| *current = Some(self.clone()));
        for (listener, _) in self.listeners.borrow().iter() {
            listener.commit();
        }
        self.started.set(true);
        debug!(thread = self.thread_index, "worker started");
    }

    /// Discards everything the load staged.
    pub fn rollback(&self) {
        for (listener, _) in self.listeners.borrow().iter() {
            listener.rollback();
        }
        self.listeners.borrow_mut().clear();
    }

    /// Decommissions the listeners still running this worker's layouts.
    pub fn stop(&self) {
        for (listener, layout) in self.listeners.borrow_mut().drain(..) {
            let still_ours = listener
                .pipeline_layout()
                .is_some_and(|current| Rc::ptr_eq(&current, &layout));
            if still_ours {
                let _ = listener.set_next_state(None, ListenerOptions::default());
                listener.commit();
            }
        }
        self.started.set(false);
        CURRENT.with_borrow_mut(|current| {
            if current
                .as_ref()
                .is_some_and(|c| std::ptr::eq(Rc::as_ptr(c), self))
            {
                *current = None;
            }
        });
        debug!(thread = self.thread_index, "worker stopped");
    }

    pub(crate) fn record_listener(&self, listener: Rc<Listener>, layout: Rc<PipelineLayout>) {
        self.listeners.borrow_mut().push((listener, layout));
    }
}
