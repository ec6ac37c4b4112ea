// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

use crate::context::ContextHandle;
use crate::event::Event;

/// Downstream sink handed to a filter while it processes one event.
pub type Output<'a> = dyn FnMut(Event) + 'a;

/// A unit of stream transformation.
///
/// A filter lives inside exactly one [`Pipeline`](crate::Pipeline) and is
/// only ever called on the worker thread that owns it. Configuration is
/// duplicated by [`Filter::clone_filter`] when a pipeline is instantiated
/// from its layout; runtime state is not.
///
/// Filters may assume the framing conventions of the event model: a message
/// is a matched `MessageStart … MessageEnd` pair with zero or more `Data`
/// events in between, and `StreamEnd` is terminal. The pipeline enforces the
/// terminal part: once a filter has emitted `StreamEnd`, its further output
/// is discarded and it sees no further input.
pub trait Filter {
    /// Filter name for logs and layout dumps.
    fn name(&self) -> &'static str;

    /// Handles one inbound event, emitting any number of events downstream.
    fn process(&mut self, ctx: &ContextHandle, event: Event, out: &mut Output<'_>);

    /// Returns the filter to its post-construction state. Filters holding
    /// timers or buffered events must cancel and drop them here.
    fn reset(&mut self) {}

    /// Duplicates the filter's configuration (not its state) for a new
    /// pipeline instance.
    fn clone_filter(&self) -> Box<dyn Filter>;
}
