//! The mark cycle: wires the mark queue, update remembered sets, flush/sync
//! protocol and liveness oracle into the external interface a host runtime
//! drives through one collection.

use crate::barrier::{self, BarrierGate};
use crate::config::{Configuration, Statistics};
use crate::error::Result;
use crate::large_objects::LargeObjectRegistry;
use crate::liveness::{
    self, ResurrectionOutcome, ThreadInfo, ThreadList, WeakEntry, WeakPointerList,
};
use crate::ptr::ClosurePtr;
use crate::queue::{MarkQueue, MarkQueueEntry};
use crate::runtime::{ClosureInfo, SegmentHeap, WorkerCoordinator};
use crate::sync::FlushSync;
use crate::urs::{GlobalUrsList, UpdRemSet, UpdRemSetTable};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, info, trace};

/// One concurrent mark cycle: the unit of state a host runtime creates once
/// per major collection and drives through `init`, `mark`, flush/sync, and
/// reconciliation.
#[derive(Debug)]
pub struct MarkCycle {
    config: Configuration,
    epoch: AtomicU8,
    queue: Mutex<MarkQueue>,
    global_urs: GlobalUrsList,
    workers: Mutex<UpdRemSetTable>,
    large_objects: LargeObjectRegistry,
    gate: BarrierGate,
    sync: FlushSync,
    weaks: Mutex<WeakPointerList>,
    threads: Mutex<ThreadList>,
    stats: Mutex<Statistics>,
}

impl MarkCycle {
    #[must_use]
    pub fn new(config: Configuration) -> Arc<Self> {
        let workers = UpdRemSetTable::new(config.workers, config.block_entries);
        Arc::new(Self {
            queue: Mutex::new(MarkQueue::new(config.block_entries, false)),
            workers: Mutex::new(workers),
            config,
            epoch: AtomicU8::new(0),
            global_urs: GlobalUrsList::new(),
            large_objects: LargeObjectRegistry::new(),
            gate: BarrierGate::new(),
            sync: FlushSync::new(),
            weaks: Mutex::new(WeakPointerList::new(Vec::new())),
            threads: Mutex::new(ThreadList::new(Vec::new())),
            stats: Mutex::new(Statistics::default()),
        })
    }

    #[must_use]
    pub fn epoch(&self) -> u8 {
        self.epoch.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn large_objects(&self) -> &LargeObjectRegistry {
        &self.large_objects
    }

    #[must_use]
    pub fn barrier_gate(&self) -> &BarrierGate {
        &self.gate
    }

    #[must_use]
    pub fn worker_update_remembered_set(&self, worker: usize) -> Arc<UpdRemSet> {
        self.workers.lock().worker(worker)
    }

    pub fn statistics(&self) -> Result<Statistics> {
        Ok(self.stats.lock().clone())
    }

    /// Begins a new cycle: bumps the mark epoch, resets every worker's
    /// update remembered set, seeds the thread and weak pointer snapshots,
    /// and enables the write barrier.
    ///
    /// The epoch wraps at 255 back to 1 rather than 0, since 0 is reserved
    /// to mean "never marked" on a fresh block.
    pub fn init(&self, threads: Vec<ClosurePtr>, weaks: Vec<WeakEntry>) {
        let next_epoch = match self.epoch.load(Ordering::Acquire) {
            0 | 255 => 1,
            e => e + 1,
        };
        self.epoch.store(next_epoch, Ordering::Release);
        *self.queue.lock() = MarkQueue::new(self.config.block_entries, false);
        self.workers.lock().init_all();
        *self.threads.lock() = ThreadList::new(threads);
        *self.weaks.lock() = WeakPointerList::new(weaks);
        *self.stats.lock() = Statistics {
            epoch: next_epoch,
            ..Statistics::default()
        };
        self.gate.enable();
        info!(epoch = next_epoch, "mark cycle initialized");
    }

    /// Seeds the mark queue with a root pointer, e.g. a thread's stack or a
    /// foreign-code-held reference.
    pub fn add_root(&self, root: ClosurePtr) {
        self.queue.lock().push(MarkQueueEntry::MarkClosure {
            closure: root,
            origin: None,
        });
    }

    /// Drains the mark queue, then pulls in anything waiting in the global
    /// update remembered set list and drains again, repeating until both
    /// are empty.
    ///
    /// This is the steady-state collector thread loop: it never blocks, so
    /// the caller is free to call it from a dedicated thread that polls the
    /// global list's emptiness itself, or from inside the flush/sync
    /// handshake once every worker's remembered set has landed.
    pub fn mark(&self, info: &dyn ClosureInfo, heap: &dyn SegmentHeap) {
        let epoch = self.epoch();
        loop {
            {
                let mut queue = self.queue.lock();
                let mut stats = self.stats.lock();
                crate::mark_loop::drain(
                    &mut queue,
                    info,
                    heap,
                    &self.large_objects,
                    &mut stats,
                    epoch,
                );
            }
            if self.global_urs.is_empty() {
                break;
            }
            let refill = self.global_urs.drain_all(self.config.block_entries);
            self.queue.lock().append(refill);
        }
        trace!(epoch, "mark queue and update remembered set drained");
    }

    /// Stops every worker, forcibly landing each one's update remembered
    /// set, the first step of ending the cycle's concurrent phase.
    pub fn begin_flush(&self, coordinator: &dyn WorkerCoordinator) {
        let workers = self.workers.lock();
        self.sync.begin_flush(coordinator, &workers, &self.global_urs);
    }

    /// Blocks until every worker's update remembered set from this flush
    /// has landed in the global list.
    pub fn wait_for_flush(&self) {
        self.sync.wait_for_flush();
    }

    /// Disables the write barrier and releases every worker. Call after
    /// [`mark`](Self::mark) has drained whatever the flush produced.
    pub fn finish_flush(&self, coordinator: &dyn WorkerCoordinator) {
        let workers = self.workers.lock();
        self.sync.finish_flush(coordinator, &self.gate);
        workers.reset_all();
        self.stats.lock().flush_syncs += 1;
        debug!("flush/sync complete, barrier disabled");
    }

    /// The write barrier, exposed for a host to wire into its own update
    /// and thunk-evaluation code paths.
    pub fn push_closure(
        &self,
        worker: usize,
        info: &dyn ClosureInfo,
        heap: &dyn SegmentHeap,
        old_value: ClosurePtr,
    ) -> Result<()> {
        let epoch = self.epoch();
        let urs = self.worker_update_remembered_set(worker);
        barrier::push_closure(
            &self.gate,
            &urs,
            &self.global_urs,
            info,
            heap,
            &self.large_objects,
            epoch,
            old_value,
        )
    }

    /// The eager thunk-update barrier, exposed for a host to call before
    /// blackholing a thunk.
    pub fn push_thunk(
        &self,
        worker: usize,
        info: &dyn ClosureInfo,
        thunk: ClosurePtr,
    ) -> Result<()> {
        let urs = self.worker_update_remembered_set(worker);
        barrier::push_thunk(&self.gate, &urs, &self.global_urs, info, thunk)
    }

    /// The eager thread-state barrier, exposed for a host to call before
    /// mutating a `TSO`'s traced fields in place.
    pub fn push_tso(
        &self,
        worker: usize,
        info: &dyn ClosureInfo,
        heap: &dyn SegmentHeap,
        tso: ClosurePtr,
    ) -> Result<()> {
        let epoch = self.epoch();
        let urs = self.worker_update_remembered_set(worker);
        barrier::push_tso(
            &self.gate,
            &urs,
            &self.global_urs,
            info,
            heap,
            &self.large_objects,
            epoch,
            tso,
        )
    }

    /// The stack-claim barrier, exposed for a host to call before resizing a
    /// stack.
    pub fn push_stack(
        &self,
        worker: usize,
        info: &dyn ClosureInfo,
        heap: &dyn SegmentHeap,
        stack: ClosurePtr,
    ) -> Result<()> {
        let epoch = self.epoch();
        let urs = self.worker_update_remembered_set(worker);
        barrier::push_stack(
            &self.gate,
            &urs,
            &self.global_urs,
            info,
            heap,
            &self.large_objects,
            &self.config,
            epoch,
            stack,
        )
    }

    /// Runs the post-mark reconciliation fixpoint: ties weak pointers to
    /// their key's now-settled liveness, resurrects any thread blocked on
    /// something that turned out dead, and repeats until nothing changes.
    ///
    /// Must only be called once [`mark`](Self::mark) has returned with both
    /// the mark queue and the global update remembered set list empty —
    /// that is the only point at which every closure's liveness is final.
    pub fn reconcile(
        &self,
        info: &dyn ClosureInfo,
        heap: &dyn SegmentHeap,
        threads: &dyn ThreadInfo,
    ) -> ReconciliationReport {
        let epoch = self.epoch();
        let mut report = ReconciliationReport::default();
        loop {
            let progressed = {
                let mut queue = self.queue.lock();
                let weaks = self.weaks.lock();
                liveness::tidy_weaks(&mut *queue, info, heap, &self.large_objects, epoch, &weaks)
            };
            if progressed {
                self.mark(info, heap);
                continue;
            }

            let dead_candidates = self.threads.lock().tidy(info, heap, &self.large_objects, epoch);
            if dead_candidates.is_empty() {
                break;
            }
            let ResurrectionOutcome {
                resurrected,
                truly_dead,
            } = {
                let mut queue = self.queue.lock();
                liveness::resurrect_threads(&mut *queue, threads, dead_candidates)
            };
            report.killed.extend(truly_dead);
            if resurrected.is_empty() {
                break;
            }
            report.resurrected.extend(resurrected);
            self.mark(info, heap);
            // Pushes made by resurrection must not survive into the next
            // cycle's barrier accounting as if they came from a mutator.
            self.workers.lock().reset_all();
        }

        let mut queue = self.queue.lock();
        let weaks = self.weaks.lock();
        report.dead_weaks = liveness::mark_dead_weaks(&mut *queue, &weaks);
        drop(queue);
        drop(weaks);
        self.mark(info, heap);

        let mut stats = self.stats.lock();
        stats.weaks_finalized = report.dead_weaks.len();
        stats.threads_resurrected = report.resurrected.len();
        report
    }
}

/// Outcome of [`MarkCycle::reconcile`].
#[derive(Debug, Default)]
pub struct ReconciliationReport {
    pub dead_weaks: Vec<WeakEntry>,
    pub resurrected: Vec<ClosurePtr>,
    pub killed: Vec<ClosurePtr>,
}
