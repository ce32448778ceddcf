//! The mark queue: a block-chain FIFO/stack shared by the collector's own
//! work list and every worker's update remembered set.

use crate::ptr::{ArrayPtr, ClosurePtr, SlotAddress};

/// A unit of work for the closure tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkQueueEntry {
    /// Trace a single closure, reached from `origin` (if known).
    MarkClosure {
        closure: ClosurePtr,
        origin: Option<SlotAddress>,
    },
    /// Trace the referent table of a function closure.
    MarkFunSrt { srt: ClosurePtr },
    /// Trace the referent table of a thunk closure.
    MarkThunkSrt { srt: ClosurePtr },
    /// Trace a slice of a pointer array, starting at `start`. Large arrays
    /// are re-pushed in chunks rather than traced in one entry so a single
    /// huge array cannot dominate a worker's time between queue checks.
    MarkArray { array: ArrayPtr, start: usize },
}

/// Number of array elements traced per [`MarkQueueEntry::MarkArray`] chunk
/// before the remainder is re-queued as a fresh entry.
pub const ARRAY_CHUNK_LENGTH: usize = 128;

/// After an update remembered set accumulates this many blocks, a push
/// reports that the caller should flush eagerly rather than wait for the
/// collector to ask.
const EAGER_FLUSH_BLOCK_THRESHOLD: usize = 8;

/// A stack of fixed-capacity blocks holding [`MarkQueueEntry`] values.
///
/// Used both as the collector's own mark queue (`is_upd_rem_set = false`)
/// and, one instance per mutator, as that worker's update remembered set
/// (`is_upd_rem_set = true`). The two modes share identical push/pop
/// mechanics; only the eager-flush hint on push differs.
#[derive(Debug)]
pub struct MarkQueue {
    blocks: Vec<Vec<MarkQueueEntry>>,
    capacity: usize,
    is_upd_rem_set: bool,
}

impl MarkQueue {
    /// Creates an empty queue with blocks of `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize, is_upd_rem_set: bool) -> Self {
        Self {
            blocks: vec![Vec::with_capacity(capacity)],
            capacity,
            is_upd_rem_set,
        }
    }

    #[must_use]
    pub fn is_upd_rem_set(&self) -> bool {
        self.is_upd_rem_set
    }

    /// Number of entries currently queued, across all blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.len() == 1 && self.blocks[0].is_empty()
    }

    /// Number of blocks currently chained, including the active one.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Pushes an entry, allocating a fresh block if the current one is
    /// full. Returns `true` when the caller (only meaningful in
    /// `is_upd_rem_set` mode) should flush eagerly rather than wait for the
    /// collector's next scheduled sync.
    pub fn push(&mut self, entry: MarkQueueEntry) -> bool {
        let top = self.blocks.last_mut().expect("mark queue always has a top block");
        if top.len() == self.capacity {
            self.blocks.push(Vec::with_capacity(self.capacity));
        }
        self.blocks
            .last_mut()
            .expect("mark queue always has a top block")
            .push(entry);
        self.needs_eager_flush()
    }

    /// Whether this queue (only meaningful in `is_upd_rem_set` mode) has
    /// grown past the point where its owner should flush eagerly. Exposed
    /// so a caller that pushed several entries through [`MarkSink::push`][p]
    /// in one go, rather than through [`push`](Self::push) directly, can
    /// still check the same threshold once at the end.
    ///
    /// [p]: crate::closure::MarkSink::push
    #[must_use]
    pub fn needs_eager_flush(&self) -> bool {
        self.is_upd_rem_set && self.blocks.len() >= EAGER_FLUSH_BLOCK_THRESHOLD
    }

    /// Pops the most recently pushed entry, freeing the owning block once it
    /// empties (except the last remaining block, which is kept around so the
    /// queue never needs to reallocate from scratch on the next push).
    pub fn pop(&mut self) -> Option<MarkQueueEntry> {
        loop {
            let top = self.blocks.last_mut()?;
            if let Some(entry) = top.pop() {
                return Some(entry);
            }
            if self.blocks.len() == 1 {
                return None;
            }
            self.blocks.pop();
        }
    }

    /// Appends another queue's blocks onto this one, draining `other`.
    ///
    /// Used to splice a flushed update remembered set into the collector's
    /// own mark queue, and to reset a worker's update remembered set back
    /// to an empty single block after a flush.
    pub fn append(&mut self, mut other: Self) {
        if other.is_empty() {
            return;
        }
        if self.blocks.last().is_some_and(Vec::is_empty) {
            self.blocks.pop();
        }
        self.blocks.append(&mut other.blocks);
    }

    /// Discards all queued entries, leaving a single empty block.
    ///
    /// Used to reset a worker's update remembered set after a flush/sync;
    /// see the note on resurrection re-entrancy in the liveness module.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.blocks.push(Vec::with_capacity(self.capacity));
    }
}

impl crate::closure::MarkSink for MarkQueue {
    fn push(&mut self, entry: MarkQueueEntry) {
        MarkQueue::push(self, entry);
    }
}
