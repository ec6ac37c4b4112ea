// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

use crate::context::{Context, ContextHandle};
use crate::event::Event;
use crate::filter::Filter;
use crate::layout::PipelineLayout;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::debug;

struct Stage {
    filter: Box<dyn Filter>,
    ended: bool,
}

/// A live instance of a [`PipelineLayout`] serving one connection or one
/// auxiliary stream.
///
/// Input events are buffered until [`Pipeline::start`], then delivered
/// synchronously through the filter chain to the sink installed with
/// [`Pipeline::chain`]. When a terminal `StreamEnd` reaches the sink the
/// pipeline fires its `on_end` hook, drops the filter chain and ignores any
/// further input.
pub struct Pipeline {
    layout: Rc<PipelineLayout>,
    context: ContextHandle,
    stages: Vec<Stage>,
    sink: Box<dyn FnMut(Event)>,
    on_end: Option<Box<dyn FnOnce(Option<serde_json::Value>)>>,
    pending: VecDeque<Event>,
    started: bool,
    ended: bool,
}

impl Pipeline {
    /// Instantiates the layout's filter chain around the given context.
    #[must_use]
    pub fn make(layout: &Rc<PipelineLayout>, context: Context) -> Rc<RefCell<Pipeline>> {
        let stages = layout
            .spawn_filters()
            .into_iter()
            .map(|filter| Stage {
                filter,
                ended: false,
            })
            .collect();
        layout.pipeline_spawned();
        debug!(layout = layout.name(), context = context.id(), "pipeline up");
        Rc::new(RefCell::new(Pipeline {
            layout: layout.clone(),
            context: Rc::new(RefCell::new(context)),
            stages,
            sink: Box::new(|_| {}),
            on_end: None,
            pending: VecDeque::new(),
            started: false,
            ended: false,
        }))
    }

    /// Installs the downstream sink fed by the tail filter.
    pub fn chain(&mut self, sink: impl FnMut(Event) + 'static) {
        self.sink = Box::new(sink);
    }

    /// Installs the hook fired once the terminal `StreamEnd` has reached the
    /// sink; it receives the context's result value.
    pub fn on_end(&mut self, hook: impl FnOnce(Option<serde_json::Value>) + 'static) {
        self.on_end = Some(Box::new(hook));
    }

    /// The pipeline's context.
    #[must_use]
    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    /// The layout this pipeline was spawned from.
    #[must_use]
    pub fn layout(&self) -> &Rc<PipelineLayout> {
        &self.layout
    }

    /// Whether the terminal `StreamEnd` has been processed.
    #[must_use]
    pub fn ended(&self) -> bool {
        self.ended
    }

    /// Marks the pipeline active and delivers any buffered input.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        while let Some(event) = self.pending.pop_front() {
            if self.ended {
                break;
            }
            self.feed(event);
        }
    }

    /// Feeds one event into the head of the chain.
    pub fn input(&mut self, event: Event) {
        if self.ended {
            return;
        }
        if self.started {
            self.feed(event);
        } else {
            self.pending.push_back(event);
        }
    }

    fn feed(&mut self, event: Event) {
        let mut saw_end = false;
        {
            let Pipeline {
                stages,
                context,
                sink,
                ..
            } = self;
            let mut tail = |event: Event| {
                if saw_end {
                    return;
                }
                saw_end = event.is_stream_end();
                sink(event);
            };
            deliver(stages, context, event, &mut tail);
        }
        if saw_end {
            self.finish();
        }
    }

    fn finish(&mut self) {
        self.ended = true;
        self.stages.clear();
        self.pending.clear();
        let result = self.context.borrow_mut().take_result();
        if let Some(hook) = self.on_end.take() {
            hook(result);
        }
        debug!(layout = self.layout.name(), "pipeline down");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.layout.pipeline_dropped();
    }
}

/// Walks one event down the chain. Each recursion level owns one stage; a
/// stage that has emitted `StreamEnd` neither receives nor emits anything
/// afterwards.
fn deliver(
    stages: &mut [Stage],
    ctx: &ContextHandle,
    event: Event,
    sink: &mut dyn FnMut(Event),
) {
    let Some((stage, rest)) = stages.split_first_mut() else {
        sink(event);
        return;
    };
    if stage.ended {
        return;
    }
    let Stage { filter, ended } = stage;
    let mut out = |event: Event| {
        if *ended {
            return;
        }
        if event.is_stream_end() {
            *ended = true;
        }
        deliver(rest, ctx, event, sink);
    };
    filter.process(ctx, event, &mut out);
}
