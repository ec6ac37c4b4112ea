// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

//! Events flowing through a pipeline.

use buffer::Data;
use std::sync::Arc;

/// Metadata attached to message boundaries. The scripting engine owns the
/// real object model; the core only carries the value through.
pub type MessageMeta = Arc<serde_json::Value>;

/// One unit of traffic through a pipeline.
///
/// Events are cheap to clone: payload bytes are chunk references and message
/// metadata is shared. Filters never mutate a received event in place; they
/// emit new ones.
#[derive(Clone, Debug)]
pub enum Event {
    /// A run of body bytes.
    Data(Data),
    /// Opens a message, optionally carrying its head metadata.
    MessageStart(Option<MessageMeta>),
    /// Closes the current message, optionally carrying tail metadata.
    MessageEnd(Option<MessageMeta>),
    /// Terminal event; nothing follows it on the same pipeline.
    StreamEnd(ErrorKind),
}

impl Event {
    /// Whether this event terminates the stream.
    #[must_use]
    pub fn is_stream_end(&self) -> bool {
        matches!(self, Event::StreamEnd(_))
    }

    /// The payload bytes of a [`Event::Data`] event.
    #[must_use]
    pub fn as_data(&self) -> Option<&Data> {
        match self {
            Event::Data(data) => Some(data),
            _ => None,
        }
    }
}

/// Why a stream ended.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Clean end of stream.
    #[default]
    #[error("no error")]
    NoError,
    /// Peer reset the connection.
    #[error("connection reset by peer")]
    ConnectionReset,
    /// Reading from the peer failed.
    #[error("read error")]
    ReadError,
    /// Writing to the peer failed.
    #[error("write error")]
    WriteError,
    /// A read did not complete in time.
    #[error("read timeout")]
    ReadTimeout,
    /// A write did not complete in time.
    #[error("write timeout")]
    WriteTimeout,
    /// No traffic for longer than the idle limit.
    #[error("idle timeout")]
    IdleTimeout,
    /// Peer name resolution failed.
    #[error("cannot resolve")]
    CannotResolve,
    /// Peer refused the connection.
    #[error("connection refused")]
    ConnectionRefused,
    /// The stream violated its framing conventions.
    #[error("protocol error")]
    ProtocolError,
    /// A buffer limit was exceeded.
    #[error("buffer overflow")]
    BufferOverflow,
    /// Anything else.
    #[error("unknown error")]
    Unknown,
}

impl ErrorKind {
    /// Whether the kind reports an actual failure.
    #[must_use]
    pub fn is_error(self) -> bool {
        self != ErrorKind::NoError
    }
}
