//! The flush/sync protocol: the handshake that lets the collector stop
//! accepting write-barrier entries and move on to post-mark reconciliation.

use crate::barrier::BarrierGate;
use crate::runtime::WorkerCoordinator;
use crate::urs::{GlobalUrsList, UpdRemSet, UpdRemSetTable};
use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct FlushState {
    requested: bool,
    flushed: usize,
    n_workers: usize,
}

/// Coordinates a single flush: every worker's update remembered set lands
/// in the global list before the collector is allowed to treat the barrier
/// as disabled.
///
/// Two ways a worker's queue can land here: the coordinator can force it
/// directly (used for workers parked in a foreign call, and for the common
/// case of a host with no self-reporting mutator threads at all), or a
/// worker can notice the flush request at its own safe point and call
/// [`worker_flush`](Self::worker_flush) itself. Either way increments the
/// same counter [`wait_for_flush`](Self::wait_for_flush) is blocked on.
#[derive(Debug)]
pub struct FlushSync {
    state: Mutex<FlushState>,
    condvar: Condvar,
}

impl FlushSync {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FlushState {
                requested: false,
                flushed: 0,
                n_workers: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.state.lock().requested
    }

    /// Announces a flush, stops every worker through the coordinator, and
    /// forces each one's update remembered set into `global` on the spot.
    ///
    /// Safe to call even for workers a real scheduler would otherwise let
    /// self-report: `take` on an empty queue is a no-op, so a worker that
    /// later calls [`worker_flush`](Self::worker_flush) for the same cycle
    /// simply contributes nothing extra.
    pub fn begin_flush(
        &self,
        coordinator: &dyn WorkerCoordinator,
        workers: &UpdRemSetTable,
        global: &GlobalUrsList,
    ) {
        let n = coordinator.worker_count();
        {
            let mut state = self.state.lock();
            state.requested = true;
            state.flushed = 0;
            state.n_workers = n;
        }
        coordinator.stop_all_workers();
        workers.force_flush_all(global);
        let mut state = self.state.lock();
        state.flushed = n;
        self.condvar.notify_all();
    }

    /// Worker side of the handshake: a mutator notices `is_requested` at a
    /// safe point, flushes its own update remembered set, and reports in.
    pub fn worker_flush(&self, worker: &UpdRemSet, global: &GlobalUrsList) {
        if let Some(queue) = worker.take() {
            global.push(queue);
        }
        let mut state = self.state.lock();
        state.flushed += 1;
        if state.flushed >= state.n_workers {
            self.condvar.notify_all();
        }
    }

    /// Blocks until every worker's update remembered set has landed.
    pub fn wait_for_flush(&self) {
        let mut state = self.state.lock();
        while state.flushed < state.n_workers {
            self.condvar.wait(&mut state);
        }
    }

    /// Disables the write barrier and releases every worker, ending the
    /// handshake. The barrier must stay enabled until this runs: a worker
    /// racing ahead of `wait_for_flush` could otherwise skip the remembered
    /// set entirely for a pointer the collector has not yet marked.
    pub fn finish_flush(&self, coordinator: &dyn WorkerCoordinator, gate: &BarrierGate) {
        gate.disable();
        self.state.lock().requested = false;
        coordinator.release_all_workers();
    }
}

impl Default for FlushSync {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closure::MarkSink;
    use crate::ptr::ClosurePtr;
    use crate::queue::MarkQueueEntry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeCoordinator {
        workers: usize,
        stops: AtomicUsize,
        releases: AtomicUsize,
    }
    impl WorkerCoordinator for FakeCoordinator {
        fn worker_count(&self) -> usize {
            self.workers
        }
        fn stop_all_workers(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        fn release_all_workers(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn forced_flush_satisfies_wait_immediately() {
        let coordinator = FakeCoordinator {
            workers: 2,
            stops: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        };
        let table = UpdRemSetTable::new(2, 4);
        table.init_all();
        table
            .worker(0)
            .with_queue(|q| {
                MarkSink::push(
                    q,
                    MarkQueueEntry::MarkClosure {
                        closure: ClosurePtr::from_raw(8),
                        origin: None,
                    },
                );
            })
            .unwrap();
        let global = GlobalUrsList::new();
        let sync = FlushSync::new();

        sync.begin_flush(&coordinator, &table, &global);
        sync.wait_for_flush();

        assert_eq!(coordinator.stops.load(Ordering::SeqCst), 1);
        assert!(!global.is_empty());

        let gate = BarrierGate::new();
        gate.enable();
        sync.finish_flush(&coordinator, &gate);
        assert!(!gate.is_active());
        assert_eq!(coordinator.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn worker_self_report_also_satisfies_wait() {
        let _coordinator = FakeCoordinator {
            workers: 1,
            stops: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        };
        let table = UpdRemSetTable::new(1, 4);
        table.init_all();
        let global = GlobalUrsList::new();
        let sync = FlushSync::new();

        // Simulate a coordinator that only sets the request flag and lets
        // the worker flush itself, rather than forcing it directly.
        sync.state.lock().requested = true;
        sync.state.lock().n_workers = 1;
        sync.worker_flush(&table.worker(0), &global);
        sync.wait_for_flush();
    }
}
