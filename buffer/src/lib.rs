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

//! Chunked, reference-counted byte buffers.
//!
//! A [`Data`] is an ordered list of *views*, each referencing a contiguous
//! region of a fixed-size *chunk*. Chunks are shared between views by
//! reference counting, so splitting a buffer ([`Data::shift`], [`Data::pop`])
//! or concatenating two buffers ([`Data::push_data`]) moves or clones view
//! descriptors without ever copying chunk bytes. This is what gives protocol
//! framing and socket-to-pipeline handoff their O(1) cost.
//!
//! Chunk storage comes from a per-thread free list (see [`pool`]); the owning
//! worker trims the list once per second and exposes its size as a metric.

pub mod pool;

use crate::pool::ChunkData;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Size in bytes of every chunk of buffer storage.
pub const CHUNK_SIZE: usize = 4096;

/// A reference to a contiguous region of one chunk.
///
/// Holds one reference on the chunk; in-place tail writes are only allowed
/// while the view is the chunk's sole referent.
#[derive(Clone)]
struct View {
    chunk: Arc<ChunkData>,
    offset: usize,
    length: usize,
}

impl View {
    fn as_slice(&self) -> &[u8] {
        &self.chunk[self.offset..self.offset + self.length]
    }

    /// Appends as much of `bytes` as fits behind this view in its chunk.
    /// Returns the number of bytes written; 0 if the chunk is shared or full.
    fn push(&mut self, bytes: &[u8]) -> usize {
        let tail = self.offset + self.length;
        let room = CHUNK_SIZE - tail;
        if room == 0 || bytes.is_empty() {
            return 0;
        }
        let Some(storage) = Arc::get_mut(&mut self.chunk) else {
            return 0;
        };
        let take = room.min(bytes.len());
        storage[tail..tail + take].copy_from_slice(&bytes[..take]);
        self.length += take;
        take
    }

    /// Splits off the last `n` bytes as a new view on the same chunk.
    fn pop(&mut self, n: usize) -> View {
        self.length -= n;
        View {
            chunk: Arc::clone(&self.chunk),
            offset: self.offset + self.length,
            length: n,
        }
    }

    /// Splits off the first `n` bytes as a new view on the same chunk.
    fn shift(&mut self, n: usize) -> View {
        let view = View {
            chunk: Arc::clone(&self.chunk),
            offset: self.offset,
            length: n,
        };
        self.offset += n;
        self.length -= n;
        view
    }
}

/// A byte buffer made of chunk views.
///
/// Cloning is shallow in bytes: the clone gets its own view list referencing
/// the same chunks.
#[derive(Clone, Default)]
pub struct Data {
    views: VecDeque<View>,
    size: usize,
}

impl Data {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a zero-filled buffer of `size` bytes.
    #[must_use]
    pub fn with_size(size: usize) -> Self {
        Self::filled(size, 0)
    }

    /// Creates a buffer of `size` bytes, every byte set to `value`.
    #[must_use]
    pub fn filled(size: usize, value: u8) -> Self {
        let mut data = Self::new();
        let mut remaining = size;
        while remaining > 0 {
            let mut chunk = pool::alloc();
            let length = remaining.min(CHUNK_SIZE);
            if let Some(storage) = Arc::get_mut(&mut chunk) {
                storage[..length].fill(value);
            }
            data.push_view(View {
                chunk,
                offset: 0,
                length,
            });
            remaining -= length;
        }
        data
    }

    /// Creates a buffer holding a copy of `bytes`.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut data = Self::new();
        data.push(bytes);
        data
    }

    /// Total number of bytes in the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Whether the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Drops all views, returning chunk storage to the pool where this buffer
    /// held the last reference.
    pub fn clear(&mut self) {
        while let Some(view) = self.views.pop_front() {
            pool::release(view.chunk);
        }
        self.size = 0;
    }

    /// Appends a copy of `bytes`.
    ///
    /// Writes in place behind the tail view while its chunk is uniquely
    /// referenced and has room; otherwise new chunks are taken from the pool.
    pub fn push(&mut self, bytes: &[u8]) {
        let mut rest = bytes;
        if let Some(tail) = self.views.back_mut() {
            let written = tail.push(rest);
            self.size += written;
            rest = &rest[written..];
        }
        while !rest.is_empty() {
            let mut view = View {
                chunk: pool::alloc(),
                offset: 0,
                length: 0,
            };
            let written = view.push(rest);
            rest = &rest[written..];
            self.push_view(view);
        }
    }

    /// Appends a single byte.
    pub fn push_u8(&mut self, byte: u8) {
        self.push(&[byte]);
    }

    /// Appends another buffer without copying chunk bytes.
    pub fn push_data(&mut self, other: &Data) {
        for view in &other.views {
            self.push_view(view.clone());
        }
    }

    /// Removes and returns the first `n` bytes (clamped to the buffer size).
    ///
    /// Where the head view is longer than the remainder of `n`, the view is
    /// split in place; no chunk bytes move.
    pub fn shift(&mut self, mut n: usize) -> Data {
        let mut out = Data::new();
        while n > 0 {
            let Some(head) = self.views.front_mut() else {
                break;
            };
            if head.length <= n {
                n -= head.length;
                if let Some(view) = self.shift_view() {
                    out.push_view(view);
                }
            } else {
                let view = head.shift(n);
                self.size -= n;
                out.push_view(view);
                break;
            }
        }
        out
    }

    /// Removes and returns the longest prefix in which no byte satisfies
    /// `pred`. The first satisfying byte stays at the head of the remainder.
    pub fn shift_until(&mut self, pred: impl Fn(u8) -> bool) -> Data {
        let mut out = Data::new();
        while let Some(head) = self.views.front_mut() {
            let n = head
                .as_slice()
                .iter()
                .position(|&b| pred(b))
                .unwrap_or(head.length);
            if n == head.length {
                if let Some(view) = self.shift_view() {
                    out.push_view(view);
                }
            } else {
                if n > 0 {
                    let view = head.shift(n);
                    self.size -= n;
                    out.push_view(view);
                }
                break;
            }
        }
        out
    }

    /// Like [`Data::shift_until`], but the first satisfying byte is included
    /// in the removed prefix.
    pub fn shift_through(&mut self, pred: impl Fn(u8) -> bool) -> Data {
        let mut out = Data::new();
        while let Some(head) = self.views.front_mut() {
            let hit = head.as_slice().iter().position(|&b| pred(b));
            let n = hit.map_or(head.length, |i| i + 1);
            if n == head.length {
                if let Some(view) = self.shift_view() {
                    out.push_view(view);
                }
                if hit.is_some() {
                    break;
                }
            } else {
                let view = head.shift(n);
                self.size -= n;
                out.push_view(view);
                break;
            }
        }
        out
    }

    /// Removes and returns the last `n` bytes (clamped to the buffer size).
    pub fn pop(&mut self, mut n: usize) -> Data {
        let mut out = Data::new();
        while n > 0 {
            let Some(tail) = self.views.back_mut() else {
                break;
            };
            if tail.length <= n {
                n -= tail.length;
                if let Some(view) = self.pop_view() {
                    out.unshift_view(view);
                }
            } else {
                let view = tail.pop(n);
                self.size -= n;
                out.unshift_view(view);
                break;
            }
        }
        out
    }

    /// Removes and returns the longest suffix in which no byte satisfies
    /// `pred`. The last satisfying byte stays at the tail of the remainder.
    pub fn pop_until(&mut self, pred: impl Fn(u8) -> bool) -> Data {
        let mut out = Data::new();
        while let Some(tail) = self.views.back_mut() {
            let mut n = 0;
            for &b in tail.as_slice().iter().rev() {
                if pred(b) {
                    break;
                }
                n += 1;
            }
            if n == tail.length {
                if let Some(view) = self.pop_view() {
                    out.unshift_view(view);
                }
            } else {
                if n > 0 {
                    let view = tail.pop(n);
                    self.size -= n;
                    out.unshift_view(view);
                }
                break;
            }
        }
        out
    }

    /// Iterates the buffer one contiguous chunk region at a time, in order.
    pub fn chunks(&self) -> Chunks<'_> {
        Chunks {
            inner: self.views.iter(),
        }
    }

    /// Copies the buffer out into a freshly allocated `Vec`.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Copies the buffer out as a string, replacing invalid UTF-8.
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.to_vec()).into_owned()
    }

    fn push_view(&mut self, view: View) {
        let size = view.length;
        if let Some(tail) = self.views.back_mut() {
            if Arc::ptr_eq(&tail.chunk, &view.chunk) && tail.offset + tail.length == view.offset {
                tail.length += size;
                self.size += size;
                return;
            }
        }
        self.size += size;
        self.views.push_back(view);
    }

    fn unshift_view(&mut self, view: View) {
        let size = view.length;
        if let Some(head) = self.views.front_mut() {
            if Arc::ptr_eq(&head.chunk, &view.chunk) && head.offset == view.offset + size {
                head.offset -= size;
                head.length += size;
                self.size += size;
                return;
            }
        }
        self.size += size;
        self.views.push_front(view);
    }

    fn shift_view(&mut self) -> Option<View> {
        let view = self.views.pop_front()?;
        self.size -= view.length;
        Some(view)
    }

    fn pop_view(&mut self) -> Option<View> {
        let view = self.views.pop_back()?;
        self.size -= view.length;
        Some(view)
    }
}

impl Drop for Data {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Data")
            .field("size", &self.size)
            .field("views", &self.views.len())
            .finish()
    }
}

impl PartialEq for Data {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size && self.to_vec() == other.to_vec()
    }
}

impl Eq for Data {}

impl From<&[u8]> for Data {
    fn from(bytes: &[u8]) -> Self {
        Self::from_slice(bytes)
    }
}

impl From<&str> for Data {
    fn from(s: &str) -> Self {
        Self::from_slice(s.as_bytes())
    }
}

impl From<Vec<u8>> for Data {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_slice(&bytes)
    }
}

/// Iterator over the contiguous regions of a [`Data`].
pub struct Chunks<'a> {
    inner: std::collections::vec_deque::Iter<'a, View>,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        self.inner.next().map(View::as_slice)
    }
}

/// A single chunk of storage checked out of the pool for direct filling,
/// e.g. by a socket read. Converting into a [`Data`] is free.
pub struct RawChunk {
    storage: Option<ChunkData>,
}

impl RawChunk {
    /// Checks a chunk out of the pool.
    #[must_use]
    pub fn alloc() -> Self {
        Self {
            storage: Some(pool::alloc_raw()),
        }
    }

    /// The whole writable chunk region.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.storage.as_deref_mut().map_or(&mut [], |s| &mut s[..])
    }

    /// Wraps the first `len` filled bytes as a buffer without copying.
    #[must_use]
    pub fn into_data(mut self, len: usize) -> Data {
        let mut data = Data::new();
        if let Some(storage) = self.storage.take() {
            let length = len.min(CHUNK_SIZE);
            data.push_view(View {
                chunk: Arc::new(storage),
                offset: 0,
                length,
            });
        }
        data
    }
}

impl Drop for RawChunk {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            pool::reclaim_raw(storage);
        }
    }
}

impl Default for RawChunk {
    fn default() -> Self {
        Self::alloc()
    }
}

/// Incremental [`Data`] assembly that batches small writes through a staging
/// chunk, for producers that emit a few bytes at a time (subprocess pipes,
/// decoders).
#[derive(Default)]
pub struct Builder {
    data: Data,
    staging: Option<(ChunkData, usize)>,
}

impl Builder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one byte.
    pub fn push_u8(&mut self, byte: u8) {
        self.push_slice(&[byte]);
    }

    /// Appends a run of bytes.
    pub fn push_slice(&mut self, bytes: &[u8]) {
        let mut rest = bytes;
        while !rest.is_empty() {
            let (storage, len) = self
                .staging
                .get_or_insert_with(|| (pool::alloc_raw(), 0));
            let take = (CHUNK_SIZE - *len).min(rest.len());
            storage[*len..*len + take].copy_from_slice(&rest[..take]);
            *len += take;
            rest = &rest[take..];
            if *len == CHUNK_SIZE {
                self.flush_staging();
            }
        }
    }

    /// Finishes assembly and returns the accumulated buffer.
    #[must_use]
    pub fn build(mut self) -> Data {
        self.flush_staging();
        std::mem::take(&mut self.data)
    }

    fn flush_staging(&mut self) {
        if let Some((storage, len)) = self.staging.take() {
            if len == 0 {
                pool::reclaim_raw(storage);
            } else {
                self.data.push_view(View {
                    chunk: Arc::new(storage),
                    offset: 0,
                    length: len,
                });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn push_concatenates() {
        let mut data = Data::new();
        data.push(b"hello, ");
        data.push(b"world");
        assert_eq!(data.len(), 12);
        assert_eq!(data.to_vec(), b"hello, world");
    }

    #[test]
    fn push_extends_tail_in_place() {
        let mut data = Data::from_slice(b"abc");
        data.push(b"def");
        // One chunk, one view: the second push landed behind the first.
        assert_eq!(data.chunks().count(), 1);
        assert_eq!(data.to_vec(), b"abcdef");
    }

    #[test]
    fn push_spills_across_chunks() {
        let mut data = Data::new();
        data.push(&vec![7u8; CHUNK_SIZE + 100]);
        assert_eq!(data.len(), CHUNK_SIZE + 100);
        assert_eq!(data.chunks().count(), 2);
        assert!(data.to_vec().iter().all(|&b| b == 7));
    }

    #[test]
    fn shift_conserves_bytes() {
        let original: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        for n in [0, 1, 17, 4096, 4097, 9_999, 10_000] {
            let mut data = Data::from_slice(&original);
            let head = data.shift(n);
            assert_eq!(head.len(), n);
            assert_eq!(data.len(), original.len() - n);
            let mut joined = head.to_vec();
            joined.extend_from_slice(&data.to_vec());
            assert_eq!(joined, original);
        }
    }

    #[test]
    fn pop_conserves_bytes() {
        let original: Vec<u8> = (0..100u8).collect();
        let mut data = Data::from_slice(&original);
        let tail = data.pop(33);
        assert_eq!(tail.to_vec(), &original[67..]);
        assert_eq!(data.to_vec(), &original[..67]);
    }

    #[test]
    fn shift_and_pop_clamp_to_size() {
        let mut data = Data::from_slice(b"abc");
        let head = data.shift(10);
        assert_eq!(head.to_vec(), b"abc");
        assert!(data.is_empty());

        let mut data = Data::from_slice(b"abc");
        let tail = data.pop(10);
        assert_eq!(tail.to_vec(), b"abc");
        assert!(data.is_empty());
    }

    #[test]
    fn shift_splits_views_without_copying() {
        let mut data = Data::from_slice(b"framing test");
        let base = data.chunks().next().map(<[u8]>::as_ptr);
        let head = data.shift(7);
        // Both halves still point into the original chunk.
        assert_eq!(head.chunks().next().map(<[u8]>::as_ptr), base);
        assert_eq!(
            data.chunks().next().map(<[u8]>::as_ptr),
            base.map(|p| p.wrapping_add(7))
        );
        assert_eq!(head.to_vec(), b"framing");
        assert_eq!(data.to_vec(), b" test");
    }

    #[test]
    fn push_data_shares_chunks() {
        let a = Data::from_slice(b"shared");
        let mut b = Data::new();
        b.push_data(&a);
        assert_eq!(
            a.chunks().next().map(<[u8]>::as_ptr),
            b.chunks().next().map(<[u8]>::as_ptr)
        );
    }

    #[test]
    fn concat_after_shift_merges_views() {
        // Splitting and re-joining contiguous halves of one chunk must give
        // back a single view.
        let mut data = Data::from_slice(b"abcdef");
        let head = data.shift(3);
        let mut joined = Data::new();
        joined.push_data(&head);
        joined.push_data(&data);
        assert_eq!(joined.chunks().count(), 1);
        assert_eq!(joined.to_vec(), b"abcdef");
    }

    #[test]
    fn shift_until_stops_before_match() {
        let mut data = Data::from_slice(b"key=value");
        let key = data.shift_until(|b| b == b'=');
        assert_eq!(key.to_vec(), b"key");
        assert_eq!(data.to_vec(), b"=value");
    }

    #[test]
    fn shift_until_without_match_takes_all() {
        let mut data = Data::from_slice(b"no delimiter here");
        let all = data.shift_until(|b| b == b'\n');
        assert_eq!(all.to_vec(), b"no delimiter here");
        assert!(data.is_empty());
    }

    #[test]
    fn shift_through_includes_match() {
        let mut data = Data::from_slice(b"line one\nline two");
        let line = data.shift_through(|b| b == b'\n');
        assert_eq!(line.to_vec(), b"line one\n");
        assert_eq!(data.to_vec(), b"line two");
    }

    #[test]
    fn shift_through_match_at_chunk_boundary() {
        let mut data = Data::new();
        data.push(&vec![b'x'; CHUNK_SIZE - 1]);
        data.push(b"\nrest");
        let line = data.shift_through(|b| b == b'\n');
        assert_eq!(line.len(), CHUNK_SIZE);
        assert_eq!(data.to_vec(), b"rest");
    }

    #[test]
    fn pop_until_keeps_match_at_tail() {
        let mut data = Data::from_slice(b"path/to/file");
        let name = data.pop_until(|b| b == b'/');
        assert_eq!(name.to_vec(), b"file");
        assert_eq!(data.to_vec(), b"path/to/");
    }

    #[test]
    fn filled_and_with_size() {
        let zeroed = Data::with_size(CHUNK_SIZE * 2 + 1);
        assert_eq!(zeroed.len(), CHUNK_SIZE * 2 + 1);
        assert!(zeroed.to_vec().iter().all(|&b| b == 0));

        let filled = Data::filled(10, 0xab);
        assert_eq!(filled.to_vec(), vec![0xab; 10]);
    }

    #[test]
    fn clone_is_shallow_in_bytes() {
        let data = Data::from_slice(b"clone me");
        let copy = data.clone();
        assert_eq!(copy, data);
        assert_eq!(
            data.chunks().next().map(<[u8]>::as_ptr),
            copy.chunks().next().map(<[u8]>::as_ptr)
        );
    }

    #[test]
    fn raw_chunk_roundtrip() {
        let mut raw = RawChunk::alloc();
        raw.bytes_mut()[..5].copy_from_slice(b"bytes");
        let data = raw.into_data(5);
        assert_eq!(data.to_vec(), b"bytes");
    }

    #[test]
    fn builder_batches_small_pushes() {
        let mut builder = Builder::new();
        for i in 0..1000u32 {
            #[allow(clippy::cast_possible_truncation)]
            builder.push_u8((i % 251) as u8);
        }
        builder.push_slice(b"tail");
        let data = builder.build();
        assert_eq!(data.len(), 1004);
        assert_eq!(data.chunks().count(), 1);
        assert_eq!(&data.to_vec()[1000..], b"tail");
    }

    #[test]
    fn prop_shift_conserves_bytes() {
        bolero::check!()
            .with_type::<(Vec<u8>, u16)>()
            .for_each(|(bytes, n)| {
                let mut data = Data::from_slice(bytes);
                let n = usize::from(*n) % (bytes.len() + 1);
                let head = data.shift(n);
                let mut joined = head.to_vec();
                joined.extend_from_slice(&data.to_vec());
                assert_eq!(&joined, bytes);
            });
    }

    #[test]
    fn prop_push_concatenates() {
        bolero::check!()
            .with_type::<(Vec<u8>, Vec<u8>)>()
            .for_each(|(a, b)| {
                let mut data = Data::from_slice(a);
                data.push(b);
                let mut expected = a.clone();
                expected.extend_from_slice(b);
                assert_eq!(data.to_vec(), expected);
            });
    }

    #[test]
    fn prop_pop_until_boundary() {
        bolero::check!()
            .with_type::<(Vec<u8>, u8)>()
            .for_each(|(bytes, needle)| {
                let needle = *needle;
                let mut data = Data::from_slice(bytes);
                let tail = data.pop_until(|b| b == needle);
                // Nothing in the removed suffix matches, and the remainder
                // either is empty or ends with a match.
                assert!(tail.to_vec().iter().all(|&b| b != needle));
                let rest = data.to_vec();
                assert!(rest.is_empty() || rest.last() == Some(&needle));
            });
    }
}
