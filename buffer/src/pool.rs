// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

//! Per-thread chunk pool.
//!
//! Chunk storage released by the last referencing buffer lands on the free
//! list of whichever thread dropped it; allocation prefers the local free
//! list over the system allocator. [`recycle`] trims the list and is driven
//! by the owning worker's once-per-second tick, so pool cleanup always runs
//! on the owning thread and its effect is observable through [`allocated`]
//! and [`pooled`].

use std::cell::{Cell, RefCell};
use std::sync::Arc;

pub(crate) type ChunkData = Box<[u8; crate::CHUNK_SIZE]>;

thread_local! {
    // Net chunks this thread has allocated minus those it has freed. A
    // thread freeing chunks another thread allocated goes negative; the
    // per-thread values sum to the process total.
    static LIVE_CHUNKS: Cell<i64> = const { Cell::new(0) };
    static SPARE: RefCell<Vec<ChunkData>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn alloc() -> Arc<ChunkData> {
    Arc::new(alloc_raw())
}

pub(crate) fn alloc_raw() -> ChunkData {
    LIVE_CHUNKS.with(|live| live.set(live.get() + 1));
    SPARE
        .with_borrow_mut(Vec::pop)
        .unwrap_or_else(|| Box::new([0u8; crate::CHUNK_SIZE]))
}

/// Drops one reference; the storage goes back on this thread's free list
/// when it was the last one.
pub(crate) fn release(chunk: Arc<ChunkData>) {
    if let Ok(storage) = Arc::try_unwrap(chunk) {
        reclaim_raw(storage);
    }
}

pub(crate) fn reclaim_raw(storage: ChunkData) {
    LIVE_CHUNKS.with(|live| live.set(live.get() - 1));
    SPARE.with_borrow_mut(|spare| spare.push(storage));
}

/// Trims this thread's free list, returning spare storage to the allocator.
pub fn recycle() {
    SPARE.with_borrow_mut(Vec::clear);
}

/// Net chunks in use as accounted by this thread. Summing the value over
/// all threads gives the process-wide count of live chunks.
#[must_use]
pub fn allocated() -> i64 {
    LIVE_CHUNKS.with(Cell::get)
}

/// Number of spare chunks on this thread's free list.
#[must_use]
pub fn pooled() -> usize {
    SPARE.with_borrow(Vec::len)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Data;

    #[test]
    fn released_chunks_are_pooled_and_recycled() {
        recycle();
        let before = pooled();
        {
            let _data = Data::with_size(crate::CHUNK_SIZE * 3);
        }
        assert_eq!(pooled(), before + 3);
        recycle();
        assert_eq!(pooled(), 0);
    }

    #[test]
    fn shared_chunks_stay_live_until_last_reference() {
        recycle();
        let data = Data::from_slice(b"shared");
        let copy = data.clone();
        drop(data);
        // The clone still references the chunk, so nothing was reclaimed.
        assert_eq!(pooled(), 0);
        drop(copy);
        assert_eq!(pooled(), 1);
    }
}
