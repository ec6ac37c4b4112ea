// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Upstream-travelling backpressure signal.
///
/// Any filter on a pipeline may close the tap to ask the source to stop
/// producing, and open it again to resume. The source (typically the inbound
/// connection's read loop) registers a watcher; the observable contract is
/// that reading resumes after a pause.
///
/// Open/close is idempotent: closing an already-closed tap notifies nobody.
#[derive(Clone)]
pub struct Tap {
    inner: Rc<TapInner>,
}

struct TapInner {
    open: Cell<bool>,
    watcher: RefCell<Option<Box<dyn Fn(bool)>>>,
}

impl Tap {
    /// Creates an open tap.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(TapInner {
                open: Cell::new(true),
                watcher: RefCell::new(None),
            }),
        }
    }

    /// Whether the source may produce.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.open.get()
    }

    /// Asks the source to pause.
    pub fn close(&self) {
        if self.inner.open.replace(false) {
            self.notify(false);
        }
    }

    /// Asks the source to resume.
    pub fn open(&self) {
        if !self.inner.open.replace(true) {
            self.notify(true);
        }
    }

    /// Installs the source-side watcher, replacing any previous one.
    pub fn watch(&self, watcher: impl Fn(bool) + 'static) {
        *self.inner.watcher.borrow_mut() = Some(Box::new(watcher));
    }

    fn notify(&self, open: bool) {
        if let Some(watcher) = self.inner.watcher.borrow().as_ref() {
            watcher(open);
        }
    }
}

impl Default for Tap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transitions_notify_the_watcher_once() {
        let tap = Tap::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let watched = log.clone();
        tap.watch(move |open| watched.borrow_mut().push(open));

        tap.close();
        tap.close();
        tap.open();
        tap.open();

        assert_eq!(*log.borrow(), vec![false, true]);
    }
}
