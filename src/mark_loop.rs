//! The mark loop: drains the mark queue, dispatching each entry to the
//! closure tracer, until nothing is left to do.

use crate::closure::{self, ClosureView, mark_array_chunk};
use crate::config::Statistics;
use crate::large_objects::{LargeObjectFlags, LargeObjectRegistry};
use crate::ptr::ClosurePtr;
use crate::queue::{MarkQueue, MarkQueueEntry};
use crate::runtime::{Classification, ClosureInfo, SegmentHeap};

/// Drains `queue` completely, tracing every closure reached along the way.
///
/// Mirrors the steady-state behavior of the collector thread: this never
/// blocks waiting for more work. Once the queue empties the caller decides
/// whether to refill it from the global update remembered set list or treat
/// the cycle as done; this function only knows about one queue at a time.
pub fn drain(
    queue: &mut MarkQueue,
    info: &dyn ClosureInfo,
    heap: &dyn SegmentHeap,
    large: &LargeObjectRegistry,
    stats: &mut Statistics,
    epoch: u8,
) {
    while let Some(entry) = queue.pop() {
        process_entry(queue, info, heap, large, stats, epoch, entry);
    }
}

fn process_entry(
    queue: &mut MarkQueue,
    info: &dyn ClosureInfo,
    heap: &dyn SegmentHeap,
    large: &LargeObjectRegistry,
    stats: &mut Statistics,
    epoch: u8,
    entry: MarkQueueEntry,
) {
    match entry {
        MarkQueueEntry::MarkClosure { closure, .. } => {
            mark_one(queue, info, heap, large, stats, epoch, closure);
        }
        MarkQueueEntry::MarkFunSrt { srt } | MarkQueueEntry::MarkThunkSrt { srt } => {
            mark_one(queue, info, heap, large, stats, epoch, srt);
        }
        MarkQueueEntry::MarkArray { array, start } => {
            let (chunk, total_length) = info.array_chunk(array, start);
            stats.objects_marked += chunk.len();
            mark_array_chunk(queue, array, start, total_length, &chunk);
        }
    }
}

/// Marks one closure, returning without tracing if it was already marked,
/// belongs to the moving collector, or lost a claim race to another
/// concurrent marker.
fn mark_one(
    queue: &mut MarkQueue,
    info: &dyn ClosureInfo,
    heap: &dyn SegmentHeap,
    large: &LargeObjectRegistry,
    stats: &mut Statistics,
    epoch: u8,
    ptr: ClosurePtr,
) {
    if ptr.is_null() {
        return;
    }
    match info.classify(ptr) {
        Classification::YoungerGeneration => {}
        Classification::Whitehole => {
            // Another thread is mid-overwrite; re-queue and pick it up
            // again once the drain loop gets back around to it rather than
            // spinning in place and blocking progress on everything else.
            queue.push(MarkQueueEntry::MarkClosure {
                closure: ptr,
                origin: None,
            });
        }
        Classification::Static => {
            if !info.claim_once(ptr, epoch) {
                return;
            }
            trace(queue, info, stats, epoch, ptr);
        }
        Classification::Heap => {
            if let Some(flags) = large.flags(ptr) {
                if flags.contains(LargeObjectFlags::MARKED) {
                    return;
                }
                if trace(queue, info, stats, epoch, ptr) && finish_mark(heap, large, epoch, ptr) {
                    stats.large_objects_marked += 1;
                }
            } else {
                let segment = heap.segment_of(ptr);
                let block = heap.block_idx_of(ptr);
                if block >= heap.next_free_snap(segment) {
                    // Allocated after the snapshot: the allocator is
                    // responsible for handing out objects that already
                    // satisfy the mark invariant, so there is nothing left
                    // to trace here.
                    return;
                }
                if heap.get_mark(segment, block) == epoch {
                    return;
                }
                if trace(queue, info, stats, epoch, ptr) {
                    finish_mark(heap, large, epoch, ptr);
                }
            }
        }
    }
}

/// Sets the mark bit for `ptr`, to be called only once its fields have been
/// fully enumerated: a stack that lost its claim race in [`closure::mark_closure`]
/// must never reach this, since the winner of that race is the one that
/// sets the bit. Mirrors the large/small dispatch of `finish_mark` in
/// [`crate::barrier`], so the same function backs both the mark loop and the
/// eager write-barrier tracers.
///
/// Returns `false` if a concurrent marker already finished this object
/// first, so callers can avoid double-counting statistics.
pub(crate) fn finish_mark(
    heap: &dyn SegmentHeap,
    large: &LargeObjectRegistry,
    epoch: u8,
    ptr: ClosurePtr,
) -> bool {
    if large.flags(ptr).is_some() {
        large.mark(ptr)
    } else {
        let segment = heap.segment_of(ptr);
        let block = heap.block_idx_of(ptr);
        heap.set_mark(segment, block, epoch);
        true
    }
}

/// Traces `ptr`'s fields, returning whether the mark bit should now be set.
/// This is `false` only when `ptr` is a stack or AP_STACK that lost a claim
/// race to another concurrent marker; the winner is responsible for the
/// mark bit in that case, so this must not count it as marked either.
fn trace(
    queue: &mut MarkQueue,
    info: &dyn ClosureInfo,
    stats: &mut Statistics,
    epoch: u8,
    ptr: ClosurePtr,
) -> bool {
    let view: ClosureView = info.describe(ptr);
    let should_mark = closure::mark_closure(info, queue, &view, epoch);
    if should_mark {
        stats.objects_marked += 1;
    }
    should_mark
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptr::ArrayPtr;
    use crate::runtime::{BlockIdx, SegmentId};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeHeap {
        marks: StdMutex<HashMap<(SegmentId, BlockIdx), u8>>,
    }
    impl SegmentHeap for FakeHeap {
        fn segment_of(&self, _ptr: ClosurePtr) -> SegmentId {
            0
        }
        fn block_idx_of(&self, ptr: ClosurePtr) -> BlockIdx {
            ptr.raw()
        }
        fn get_mark(&self, segment: SegmentId, block: BlockIdx) -> u8 {
            *self.marks.lock().unwrap().get(&(segment, block)).unwrap_or(&0)
        }
        fn set_mark(&self, segment: SegmentId, block: BlockIdx, epoch: u8) {
            self.marks.lock().unwrap().insert((segment, block), epoch);
        }
        fn next_free_snap(&self, _segment: SegmentId) -> BlockIdx {
            1_000_000
        }
    }

    /// A tiny graph: `8 -> [16, 24]`, `16 -> []`, `24 -> [16]` (a shared
    /// child, exercising the "already marked, skip" path).
    struct FakeInfo {
        claims: StdMutex<HashMap<(usize, u8), ()>>,
        static_claims: AtomicU8,
    }
    impl ClosureInfo for FakeInfo {
        fn classify(&self, ptr: ClosurePtr) -> Classification {
            if ptr.raw() == 100 {
                Classification::Static
            } else {
                Classification::Heap
            }
        }
        fn describe(&self, ptr: ClosurePtr) -> ClosureView {
            let payload = match ptr.raw() {
                8 => vec![ClosurePtr::from_raw(16), ClosurePtr::from_raw(24)],
                24 => vec![ClosurePtr::from_raw(16)],
                _ => vec![],
            };
            ClosureView::Constr { payload }
        }
        fn array_chunk(&self, _array: ArrayPtr, _start: usize) -> (Vec<ClosurePtr>, usize) {
            (vec![], 0)
        }
        fn is_claimed(&self, ptr: ClosurePtr, epoch: u8) -> bool {
            self.claims.lock().unwrap().contains_key(&(ptr.raw(), epoch))
        }
        fn claim_once(&self, ptr: ClosurePtr, epoch: u8) -> bool {
            if ptr.raw() == 100 {
                return self
                    .static_claims
                    .compare_exchange(0, epoch, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
            }
            self.claims.lock().unwrap().insert((ptr.raw(), epoch), ()).is_none()
        }
    }

    #[test]
    fn drain_traces_every_reachable_closure_exactly_once() {
        let info = FakeInfo {
            claims: StdMutex::new(HashMap::new()),
            static_claims: AtomicU8::new(0),
        };
        let heap = FakeHeap { marks: StdMutex::new(HashMap::new()) };
        let large = LargeObjectRegistry::new();
        let mut stats = Statistics::default();
        let mut queue = MarkQueue::new(4, false);
        queue.push(MarkQueueEntry::MarkClosure {
            closure: ClosurePtr::from_raw(8),
            origin: None,
        });

        drain(&mut queue, &info, &heap, &large, &mut stats, 1);

        assert_eq!(stats.objects_marked, 3);
        assert_eq!(heap.get_mark(0, 16), 1);
        assert_eq!(heap.get_mark(0, 24), 1);
    }

    #[test]
    fn static_closures_are_traced_once_per_epoch() {
        let info = FakeInfo {
            claims: StdMutex::new(HashMap::new()),
            static_claims: AtomicU8::new(0),
        };
        let heap = FakeHeap { marks: StdMutex::new(HashMap::new()) };
        let large = LargeObjectRegistry::new();
        let mut stats = Statistics::default();
        let mut queue = MarkQueue::new(4, false);
        queue.push(MarkQueueEntry::MarkClosure {
            closure: ClosurePtr::from_raw(100),
            origin: None,
        });
        queue.push(MarkQueueEntry::MarkClosure {
            closure: ClosurePtr::from_raw(100),
            origin: None,
        });

        drain(&mut queue, &info, &heap, &large, &mut stats, 1);
        assert_eq!(stats.objects_marked, 1);
    }
}
