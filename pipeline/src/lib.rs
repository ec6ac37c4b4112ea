// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

#![deny(
    unsafe_code,
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

//! # Pipeline Building Blocks
//!
//! This crate provides the event model and the per-connection pipeline
//! runtime: byte streams enter as [`Event`]s, flow through a chain of
//! [`Filter`]s instantiated from an immutable [`PipelineLayout`], and leave
//! through the [`Pipeline`]'s sink.
//!
//! A pipeline is strictly thread-affine: it is built, fed and torn down on
//! the worker thread that spawned it, and every event is delivered to the
//! filters synchronously, in emission order. Backpressure travels the other
//! way, as open/close notifications on the pipeline's [`Tap`].
//!
//! You can look at the [`sample_filters`] module for some examples of simple
//! filters.

mod context;
mod event;
mod filter;
mod layout;
mod pipeline;
/// Sample filters
pub mod sample_filters;
mod tap;

pub use context::{Context, ContextHandle, InboundInfo};
pub use event::{ErrorKind, Event, MessageMeta};
pub use filter::{Filter, Output};
pub use layout::PipelineLayout;
pub use pipeline::Pipeline;
pub use tap::Tap;

#[cfg(test)]
mod test {
    use crate::sample_filters::Passthrough;
    use crate::{Context, ErrorKind, Event, Pipeline, PipelineLayout};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn events_reach_the_sink_in_order() {
        let layout = PipelineLayout::new(
            "order",
            vec![Box::new(Passthrough), Box::new(Passthrough)],
        );
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink_seen = seen.clone();

        let pipeline = Pipeline::make(&layout, Context::new());
        pipeline
            .borrow_mut()
            .chain(move |evt| sink_seen.borrow_mut().push(evt));
        pipeline.borrow_mut().start();

        pipeline.borrow_mut().input(Event::MessageStart(None));
        pipeline.borrow_mut().input(Event::Data("abc".into()));
        pipeline.borrow_mut().input(Event::MessageEnd(None));
        pipeline
            .borrow_mut()
            .input(Event::StreamEnd(ErrorKind::NoError));

        let seen = seen.borrow();
        assert_eq!(seen.len(), 4);
        assert!(matches!(seen[0], Event::MessageStart(None)));
        assert!(matches!(&seen[1], Event::Data(d) if d.to_vec() == b"abc"));
        assert!(matches!(seen[2], Event::MessageEnd(None)));
        assert!(matches!(seen[3], Event::StreamEnd(ErrorKind::NoError)));
    }

    #[test]
    fn input_is_buffered_until_start() {
        let layout = PipelineLayout::new("buffered", vec![Box::new(Passthrough)]);
        let seen = Rc::new(RefCell::new(0usize));
        let sink_seen = seen.clone();

        let pipeline = Pipeline::make(&layout, Context::new());
        pipeline
            .borrow_mut()
            .chain(move |_| *sink_seen.borrow_mut() += 1);

        pipeline.borrow_mut().input(Event::Data("x".into()));
        assert_eq!(*seen.borrow(), 0);

        pipeline.borrow_mut().start();
        assert_eq!(*seen.borrow(), 1);
    }

    #[test]
    fn exactly_one_stream_end_reaches_the_sink() {
        let layout = PipelineLayout::new("single-end", vec![Box::new(Passthrough)]);
        let ends = Rc::new(RefCell::new(0usize));
        let sink_ends = ends.clone();

        let pipeline = Pipeline::make(&layout, Context::new());
        pipeline.borrow_mut().chain(move |evt| {
            if matches!(evt, Event::StreamEnd(_)) {
                *sink_ends.borrow_mut() += 1;
            }
        });
        pipeline.borrow_mut().start();

        pipeline
            .borrow_mut()
            .input(Event::StreamEnd(ErrorKind::NoError));
        pipeline
            .borrow_mut()
            .input(Event::StreamEnd(ErrorKind::ReadError));
        pipeline.borrow_mut().input(Event::Data("late".into()));

        assert_eq!(*ends.borrow(), 1);
    }

    #[test]
    fn message_pairing_is_preserved_through_the_chain() {
        let layout = PipelineLayout::new(
            "pairing",
            vec![Box::new(Passthrough), Box::new(Passthrough), Box::new(Passthrough)],
        );
        let counts = Rc::new(RefCell::new((0usize, 0usize)));
        let sink_counts = counts.clone();

        let pipeline = Pipeline::make(&layout, Context::new());
        pipeline.borrow_mut().chain(move |evt| match evt {
            Event::MessageStart(_) => sink_counts.borrow_mut().0 += 1,
            Event::MessageEnd(_) => sink_counts.borrow_mut().1 += 1,
            _ => {}
        });
        pipeline.borrow_mut().start();

        for _ in 0..5 {
            pipeline.borrow_mut().input(Event::MessageStart(None));
            pipeline.borrow_mut().input(Event::Data("body".into()));
            pipeline.borrow_mut().input(Event::MessageEnd(None));
        }
        pipeline
            .borrow_mut()
            .input(Event::StreamEnd(ErrorKind::NoError));

        assert_eq!(*counts.borrow(), (5, 5));
    }

    #[test]
    fn active_count_tracks_pipeline_lifetime() {
        let layout = PipelineLayout::new("active", vec![Box::new(Passthrough)]);
        assert_eq!(layout.active(), 0);

        let pipeline = Pipeline::make(&layout, Context::new());
        pipeline.borrow_mut().start();
        assert_eq!(layout.active(), 1);

        drop(pipeline);
        assert_eq!(layout.active(), 0);
    }

    #[test]
    fn on_end_fires_with_the_context_result() {
        let layout = PipelineLayout::new("result", vec![Box::new(Passthrough)]);
        let result = Rc::new(RefCell::new(None));
        let on_end_result = result.clone();

        let pipeline = Pipeline::make(&layout, Context::new());
        pipeline
            .borrow_mut()
            .on_end(move |value| *on_end_result.borrow_mut() = value);
        pipeline.borrow_mut().start();

        pipeline
            .borrow_mut()
            .context()
            .borrow_mut()
            .set_result(serde_json::json!("done"));
        pipeline
            .borrow_mut()
            .input(Event::StreamEnd(ErrorKind::NoError));

        assert_eq!(*result.borrow(), Some(serde_json::json!("done")));
    }
}
