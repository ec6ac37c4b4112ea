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

//! Metric plumbing shared by every worker thread: declarative metric specs
//! registered on the [`metrics`] facade, plus the snapshot types that the
//! worker manager fans out for and merges back together.

mod register;
mod snapshot;
mod spec;

pub use register::*;
pub use snapshot::*;
pub use spec::*;
