//! The liveness oracle and post-mark reconciliation: deciding what survived
//! the snapshot, then tidying weak pointers and resurrecting threads that
//! were blocked on something now known dead.

use crate::closure::MarkSink;
use crate::large_objects::{LargeObjectFlags, LargeObjectRegistry};
use crate::ptr::ClosurePtr;
use crate::queue::MarkQueueEntry;
use crate::runtime::{Classification, ClosureInfo, SegmentHeap};
use parking_lot::Mutex;

fn push_closure(sink: &mut impl MarkSink, closure: ClosurePtr) {
    sink.push(MarkQueueEntry::MarkClosure {
        closure,
        origin: None,
    });
}

/// Whether `ptr` is known reachable under the current cycle's snapshot.
///
/// Safe to call while marking is still in progress: a closure allocated
/// after the snapshot was taken is, by construction, outside the set the
/// collector is sweeping and therefore treated as live without consulting
/// its mark bit.
#[must_use]
pub fn is_alive(
    info: &dyn ClosureInfo,
    heap: &dyn SegmentHeap,
    large: &LargeObjectRegistry,
    epoch: u8,
    ptr: ClosurePtr,
) -> bool {
    if ptr.is_null() {
        return false;
    }
    match info.classify(ptr) {
        Classification::YoungerGeneration => true,
        Classification::Whitehole => true,
        Classification::Static => info.is_claimed(ptr, epoch),
        Classification::Heap => {
            if let Some(flags) = large.flags(ptr) {
                !flags.contains(LargeObjectFlags::NONMOVING_SWEEPING) || large.is_marked(ptr)
            } else {
                let segment = heap.segment_of(ptr);
                let block = heap.block_idx_of(ptr);
                block >= heap.next_free_snap(segment) || heap.get_mark(segment, block) == epoch
            }
        }
    }
}

/// Stricter liveness check for the window after the mark queue has fully
/// drained, used by the reconciliation passes below.
///
/// Unlike [`is_alive`], this drops the post-snapshot allocation exemption
/// for small heap objects: once marking is done, a block is live only if
/// its mark byte actually matches the current epoch. An object allocated
/// after the snapshot was taken and never subsequently reached by the
/// tracer is, at this point, genuinely unreachable garbage rather than
/// something still in flight, so `is_alive`'s `block >= next_free_snap`
/// exemption no longer applies.
#[must_use]
pub fn is_now_alive(
    info: &dyn ClosureInfo,
    heap: &dyn SegmentHeap,
    large: &LargeObjectRegistry,
    epoch: u8,
    ptr: ClosurePtr,
) -> bool {
    if ptr.is_null() {
        return false;
    }
    match info.classify(ptr) {
        Classification::YoungerGeneration => true,
        Classification::Whitehole => true,
        Classification::Static => info.is_claimed(ptr, epoch),
        Classification::Heap => {
            if let Some(flags) = large.flags(ptr) {
                !flags.contains(LargeObjectFlags::NONMOVING_SWEEPING) || large.is_marked(ptr)
            } else {
                let segment = heap.segment_of(ptr);
                let block = heap.block_idx_of(ptr);
                heap.get_mark(segment, block) == epoch
            }
        }
    }
}

/// One entry on the weak pointer snapshot list.
#[derive(Debug, Clone, Copy)]
pub struct WeakEntry {
    pub handle: ClosurePtr,
    pub key: ClosurePtr,
    pub value: ClosurePtr,
    pub finalizer: Option<ClosurePtr>,
}

/// The snapshot of weak pointers taken at the start of the cycle.
#[derive(Debug, Default)]
pub struct WeakPointerList {
    pending: Mutex<Vec<WeakEntry>>,
}

impl WeakPointerList {
    #[must_use]
    pub fn new(entries: Vec<WeakEntry>) -> Self {
        Self {
            pending: Mutex::new(entries),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Runs one fixpoint step over the weak pointer snapshot: any entry whose
/// key is now known alive has its value and finalizer pushed back onto the
/// mark queue (since the key being reachable makes the weak pointer's
/// payload reachable too) and is removed from the pending list.
///
/// Returns `true` if at least one entry made progress this step. The
/// caller is expected to re-run the mark loop to drain whatever this
/// pushed, then call this again, until it returns `false` — at that point
/// whatever remains in `list` is genuinely dead and ready for
/// [`mark_dead_weaks`].
pub fn tidy_weaks(
    sink: &mut impl MarkSink,
    info: &dyn ClosureInfo,
    heap: &dyn SegmentHeap,
    large: &LargeObjectRegistry,
    epoch: u8,
    list: &WeakPointerList,
) -> bool {
    let mut pending = list.pending.lock();
    let mut still_pending = Vec::with_capacity(pending.len());
    let mut progressed = false;
    for entry in pending.drain(..) {
        if is_alive(info, heap, large, epoch, entry.key) {
            push_closure(sink, entry.value);
            if let Some(finalizer) = entry.finalizer {
                push_closure(sink, finalizer);
            }
            progressed = true;
        } else {
            still_pending.push(entry);
        }
    }
    *pending = still_pending;
    progressed
}

/// Called once [`tidy_weaks`] stops making progress: whatever remains is
/// dead. Their finalizers are still traced (so the finalizer closure itself
/// survives to be run) and the entries are returned for the caller to
/// schedule finalization and deallocate the weak pointer's own storage.
pub fn mark_dead_weaks(sink: &mut impl MarkSink, list: &WeakPointerList) -> Vec<WeakEntry> {
    let dead: Vec<WeakEntry> = list.pending.lock().drain(..).collect();
    for entry in &dead {
        if let Some(finalizer) = entry.finalizer {
            push_closure(sink, finalizer);
        }
    }
    dead
}

/// What a thread is doing, as far as the liveness oracle cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Runnable,
    Complete,
    Killed,
    /// Blocked waiting on something that can only ever wake it via a
    /// closure this collector already knows is or isn't reachable (an
    /// `MVar`, a blackhole, an STM transaction).
    Blocked,
}

/// Runtime query for thread status, needed only for the reconciliation
/// pass below.
pub trait ThreadInfo: Send + Sync {
    fn status(&self, tso: ClosurePtr) -> ThreadStatus;
}

/// The snapshot of all threads taken at the start of the cycle.
#[derive(Debug, Default)]
pub struct ThreadList {
    threads: Mutex<Vec<ClosurePtr>>,
}

impl ThreadList {
    #[must_use]
    pub fn new(threads: Vec<ClosurePtr>) -> Self {
        Self {
            threads: Mutex::new(threads),
        }
    }

    /// Removes every thread now known alive, returning the ones still
    /// unaccounted for.
    pub fn tidy(
        &self,
        info: &dyn ClosureInfo,
        heap: &dyn SegmentHeap,
        large: &LargeObjectRegistry,
        epoch: u8,
    ) -> Vec<ClosurePtr> {
        let mut threads = self.threads.lock();
        let mut dead = Vec::new();
        threads.retain(|&tso| {
            let alive = is_now_alive(info, heap, large, epoch, tso);
            if !alive {
                dead.push(tso);
            }
            alive
        });
        dead
    }
}

/// Resurrects threads blocked on something that is now known dead, by
/// raising an asynchronous exception in them and reviving the thread
/// closure itself into the mark.
///
/// Pushing a resurrected thread back onto the mark queue re-enters the
/// write barrier's territory from inside what is nominally the tail end of
/// a mark cycle; that is exactly why [`UpdRemSetTable::reset_all`]
/// (crate::urs) is called after every flush/sync handshake, discarding
/// anything a resurrection-induced push left behind that the next cycle
/// should not inherit.
pub fn resurrect_threads(
    sink: &mut impl MarkSink,
    thread_info: &dyn ThreadInfo,
    candidates: Vec<ClosurePtr>,
) -> ResurrectionOutcome {
    let mut resurrected = Vec::new();
    let mut truly_dead = Vec::new();
    for tso in candidates {
        match thread_info.status(tso) {
            ThreadStatus::Complete | ThreadStatus::Killed => truly_dead.push(tso),
            ThreadStatus::Runnable | ThreadStatus::Blocked => {
                push_closure(sink, tso);
                resurrected.push(tso);
            }
        }
    }
    ResurrectionOutcome {
        resurrected,
        truly_dead,
    }
}

/// Outcome of one [`resurrect_threads`] pass.
#[derive(Debug, Default)]
pub struct ResurrectionOutcome {
    pub resurrected: Vec<ClosurePtr>,
    pub truly_dead: Vec<ClosurePtr>,
}
