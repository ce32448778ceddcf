//! Per-worker update remembered sets and the global list the collector
//! drains them into.

use crate::queue::MarkQueue;
use parking_lot::Mutex;
use std::sync::Arc;

/// One mutator's accumulator of closures discovered by the write barrier
/// since the last flush.
///
/// Every worker owns exactly one of these for the duration of a cycle.
/// `init` allocates it; a flush drains it into the global list and leaves
/// the worker with a fresh, empty queue so the barrier never blocks on the
/// collector.
#[derive(Debug)]
pub struct UpdRemSet {
    queue: Mutex<Option<MarkQueue>>,
    block_entries: usize,
}

impl UpdRemSet {
    /// An update remembered set with no queue allocated yet. Pushes before
    /// [`init`](Self::init) are a programming error in the host, reported
    /// as [`Error::UpdRemSetError`](crate::error::Error::UpdRemSetError).
    #[must_use]
    pub fn uninitialized(block_entries: usize) -> Self {
        Self {
            queue: Mutex::new(None),
            block_entries,
        }
    }

    /// Begins a new cycle's accumulation for this worker.
    pub fn init(&self) {
        *self.queue.lock() = Some(MarkQueue::new(self.block_entries, true));
    }

    /// Runs `f` against this worker's queue, signalling eager flush if the
    /// queue asks for one after the push.
    pub fn with_queue<R>(
        &self,
        f: impl FnOnce(&mut MarkQueue) -> R,
    ) -> crate::error::Result<R> {
        let mut guard = self.queue.lock();
        let queue = guard.as_mut().ok_or_else(|| {
            crate::error::Error::UpdRemSetError("push before init_upd_rem_set".to_string())
        })?;
        Ok(f(queue))
    }

    /// Drains this worker's queue, leaving it freshly initialized, and
    /// returns what was taken (`None` if the queue was empty or never
    /// initialized — e.g. a worker that never ran a write barrier this
    /// cycle).
    pub fn take(&self) -> Option<MarkQueue> {
        let mut guard = self.queue.lock();
        let current = guard.take()?;
        *guard = Some(MarkQueue::new(self.block_entries, true));
        if current.is_empty() { None } else { Some(current) }
    }

    /// Discards whatever has accumulated without flushing it anywhere.
    ///
    /// Used after a flush/sync handshake completes: any pushes a worker
    /// made while it was nominally stopped (e.g. from inside
    /// `resurrect_threads` re-entering the barrier) must not survive into
    /// the next cycle's accounting.
    pub fn reset(&self) {
        let mut guard = self.queue.lock();
        *guard = Some(MarkQueue::new(self.block_entries, true));
    }
}

/// The collector-side destination for flushed update remembered sets.
///
/// Workers append to this independently of each other and of the collector
/// draining it; the collector only reads it during a flush/sync handshake,
/// when mutators are guaranteed stopped.
#[derive(Debug, Default)]
pub struct GlobalUrsList {
    pending: Mutex<Vec<MarkQueue>>,
}

impl GlobalUrsList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a worker's flushed queue.
    pub fn push(&self, queue: MarkQueue) {
        if !queue.is_empty() {
            self.pending.lock().push(queue);
        }
    }

    /// Drains every pending queue, merging them into one.
    pub fn drain_all(&self, block_entries: usize) -> MarkQueue {
        let mut pending = self.pending.lock();
        let mut merged = MarkQueue::new(block_entries, false);
        for queue in pending.drain(..) {
            merged.append(queue);
        }
        merged
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// A worker registry: one [`UpdRemSet`] per live worker, keyed by an opaque
/// index the coordinator assigns (typically a capability number).
#[derive(Debug)]
pub struct UpdRemSetTable {
    workers: Vec<Arc<UpdRemSet>>,
}

impl UpdRemSetTable {
    #[must_use]
    pub fn new(worker_count: usize, block_entries: usize) -> Self {
        Self {
            workers: (0..worker_count)
                .map(|_| Arc::new(UpdRemSet::uninitialized(block_entries)))
                .collect(),
        }
    }

    #[must_use]
    pub fn worker(&self, index: usize) -> Arc<UpdRemSet> {
        Arc::clone(&self.workers[index])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Starts a fresh cycle for every worker.
    pub fn init_all(&self) {
        for w in &self.workers {
            w.init();
        }
    }

    /// Forces every worker's update remembered set to flush into `global`,
    /// regardless of whether each individually asked to. Used by the
    /// flush/sync protocol's first step, which must reach workers blocked
    /// in a foreign call as well as runnable ones.
    pub fn force_flush_all(&self, global: &GlobalUrsList) {
        for w in &self.workers {
            if let Some(queue) = w.take() {
                global.push(queue);
            }
        }
    }

    /// Discards whatever every worker has accumulated since the last flush.
    pub fn reset_all(&self) {
        for w in &self.workers {
            w.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closure::MarkSink;
    use crate::ptr::ClosurePtr;
    use crate::queue::MarkQueueEntry;

    fn push_one(urs: &UpdRemSet, addr: usize) {
        urs.with_queue(|q| {
            MarkSink::push(
                q,
                MarkQueueEntry::MarkClosure {
                    closure: ClosurePtr::from_raw(addr),
                    origin: None,
                },
            );
        })
        .unwrap();
    }

    #[test]
    fn pushing_before_init_is_an_error() {
        let urs = UpdRemSet::uninitialized(4);
        let result = urs.with_queue(|_| ());
        assert!(result.is_err());
    }

    #[test]
    fn take_drains_and_reinitializes() {
        let urs = UpdRemSet::uninitialized(4);
        urs.init();
        push_one(&urs, 8);
        let drained = urs.take().expect("non-empty queue");
        assert_eq!(drained.len(), 1);
        assert!(urs.take().is_none());
    }

    #[test]
    fn global_list_merges_all_pending_queues() {
        let table = UpdRemSetTable::new(3, 4);
        table.init_all();
        push_one(&table.worker(0), 8);
        push_one(&table.worker(2), 16);

        let global = GlobalUrsList::new();
        table.force_flush_all(&global);
        let merged = global.drain_all(4);
        assert_eq!(merged.len(), 2);
        assert!(global.is_empty());
    }

    #[test]
    fn reset_all_discards_reentrant_pushes() {
        let table = UpdRemSetTable::new(1, 4);
        table.init_all();
        push_one(&table.worker(0), 8);
        table.reset_all();
        assert!(table.worker(0).take().is_none());
    }
}
