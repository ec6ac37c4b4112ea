// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

use crate::context::ContextHandle;
use crate::event::Event;
use crate::filter::{Filter, Output};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Filter that re-emits every event unchanged.
pub struct Passthrough;

impl Filter for Passthrough {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn process(&mut self, _ctx: &ContextHandle, event: Event, out: &mut Output<'_>) {
        out(event);
    }

    fn clone_filter(&self) -> Box<dyn Filter> {
        Box::new(Passthrough)
    }
}

/// Filter that dumps passing events on the logging infrastructure before
/// re-emitting them.
pub struct Dump {
    label: String,
    count: u64,
}

impl Dump {
    /// Creates a dumper tagged with `label`.
    #[must_use]
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_owned(),
            count: 0,
        }
    }
}

impl Filter for Dump {
    fn name(&self) -> &'static str {
        "dump"
    }

    fn process(&mut self, _ctx: &ContextHandle, event: Event, out: &mut Output<'_>) {
        self.count += 1;
        debug!(
            label = %self.label,
            count = self.count,
            event = ?event,
            "dump"
        );
        out(event);
    }

    fn reset(&mut self) {
        self.count = 0;
    }

    fn clone_filter(&self) -> Box<dyn Filter> {
        Box::new(Dump::new(&self.label))
    }
}

/// Condition evaluated by [`Wait`] against the pipeline context.
pub type WaitCondition = Rc<dyn Fn(&ContextHandle) -> bool>;

/// Buffers up events until a condition is fulfilled, then flushes them and
/// passes everything straight through.
pub struct Wait {
    condition: WaitCondition,
    buffer: VecDeque<Event>,
    fulfilled: bool,
}

impl Wait {
    /// Creates the filter around its condition callback.
    pub fn new(condition: impl Fn(&ContextHandle) -> bool + 'static) -> Self {
        Self {
            condition: Rc::new(condition),
            buffer: VecDeque::new(),
            fulfilled: false,
        }
    }
}

impl Filter for Wait {
    fn name(&self) -> &'static str {
        "wait"
    }

    fn process(&mut self, ctx: &ContextHandle, event: Event, out: &mut Output<'_>) {
        if self.fulfilled {
            out(event);
        } else if (self.condition)(ctx) {
            self.fulfilled = true;
            while let Some(buffered) = self.buffer.pop_front() {
                out(buffered);
            }
            out(event);
        } else {
            self.buffer.push_back(event);
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.fulfilled = false;
    }

    fn clone_filter(&self) -> Box<dyn Filter> {
        Box::new(Self {
            condition: self.condition.clone(),
            buffer: VecDeque::new(),
            fulfilled: false,
        })
    }
}

/// Closes the pipeline tap after passing a budget of body bytes, reopening
/// it after a fixed pause. Demonstrates (and tests) upstream backpressure.
///
/// The reopen timer runs on the owning worker's local task set.
pub struct Throttle {
    budget: usize,
    pause: Duration,
    taken: usize,
    timer: Option<JoinHandle<()>>,
}

impl Throttle {
    /// Pauses the source for `pause` after every `budget` bytes.
    #[must_use]
    pub fn new(budget: usize, pause: Duration) -> Self {
        Self {
            budget,
            pause,
            taken: 0,
            timer: None,
        }
    }
}

impl Filter for Throttle {
    fn name(&self) -> &'static str {
        "throttle"
    }

    fn process(&mut self, ctx: &ContextHandle, event: Event, out: &mut Output<'_>) {
        if let Some(data) = event.as_data() {
            self.taken += data.len();
        }
        out(event);
        if self.taken >= self.budget {
            let tap = ctx.borrow().tap().clone();
            if tap.is_open() {
                tap.close();
                self.taken = 0;
                let pause = self.pause;
                self.timer = Some(tokio::task::spawn_local(async move {
                    tokio::time::sleep(pause).await;
                    tap.open();
                }));
            }
        }
    }

    fn reset(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.taken = 0;
    }

    fn clone_filter(&self) -> Box<dyn Filter> {
        Box::new(Self::new(self.budget, self.pause))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Context, ErrorKind, Pipeline, PipelineLayout};
    use std::cell::RefCell;

    #[test]
    fn wait_holds_events_until_fulfilled() {
        let gate = Rc::new(RefCell::new(false));
        let cond_gate = gate.clone();
        let layout = PipelineLayout::new(
            "wait",
            vec![Box::new(Wait::new(move |_| *cond_gate.borrow()))],
        );

        let seen = Rc::new(RefCell::new(0usize));
        let sink_seen = seen.clone();
        let pipeline = Pipeline::make(&layout, Context::new());
        pipeline
            .borrow_mut()
            .chain(move |_| *sink_seen.borrow_mut() += 1);
        pipeline.borrow_mut().start();

        pipeline.borrow_mut().input(Event::Data("one".into()));
        pipeline.borrow_mut().input(Event::Data("two".into()));
        assert_eq!(*seen.borrow(), 0);

        *gate.borrow_mut() = true;
        pipeline.borrow_mut().input(Event::Data("three".into()));
        assert_eq!(*seen.borrow(), 3);
    }

    #[test]
    fn throttle_closes_tap_and_reopens_after_pause() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let local = tokio::task::LocalSet::new();
        local.block_on(&rt, async {
            let layout = PipelineLayout::new(
                "throttle",
                vec![Box::new(Throttle::new(4, Duration::from_millis(10)))],
            );
            let pipeline = Pipeline::make(&layout, Context::new());
            pipeline.borrow_mut().start();
            let tap = pipeline.borrow().context().borrow().tap().clone();

            assert!(tap.is_open());
            pipeline.borrow_mut().input(Event::Data("0123456789".into()));
            assert!(!tap.is_open());

            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(tap.is_open());

            pipeline
                .borrow_mut()
                .input(Event::StreamEnd(ErrorKind::NoError));
        });
    }
}
