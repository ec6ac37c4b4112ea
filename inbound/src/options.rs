// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

use std::time::Duration;

/// Per-listener tuning, staged together with a pipeline layout and applied
/// on commit.
#[derive(Clone, Debug, Default)]
pub struct ListenerOptions {
    /// Close the connection with a read-timeout error when a single read
    /// takes longer than this.
    pub read_timeout: Option<Duration>,
    /// Close the connection with a write-timeout error when a single write
    /// takes longer than this.
    pub write_timeout: Option<Duration>,
    /// Close the connection (or collect the UDP session) after this long
    /// without any I/O progress.
    pub idle_timeout: Option<Duration>,
    /// Discover the pre-redirect destination via `SO_ORIGINAL_DST`
    /// (Linux only; the fields stay unset elsewhere).
    pub transparent: bool,
    /// Send UDP replies from a raw socket, impersonating the original
    /// destination address. Implies `transparent`.
    pub masquerade: bool,
    /// Pause the peer (tap-close up the pipeline) when this many bytes are
    /// waiting in the write buffer; resume once half of it has drained.
    pub max_buffer_size: Option<usize>,
}
