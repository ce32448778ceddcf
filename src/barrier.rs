//! The write barrier: the mutator-side half of the snapshot-at-the-beginning
//! protocol.
//!
//! Every entry point here is meant to be called by generated mutator code
//! immediately before an in-place update overwrites a pointer field, so the
//! barrier can capture the value being overwritten while it is still
//! reachable. None of these allocate or block except for the eager flush
//! a full update remembered set can trigger.

use crate::closure::{self, ClosureView};
use crate::config::Configuration;
use crate::large_objects::{LargeObjectFlags, LargeObjectRegistry};
use crate::mark_loop::finish_mark;
use crate::ptr::ClosurePtr;
use crate::queue::MarkQueueEntry;
use crate::runtime::{Classification, ClosureInfo, SegmentHeap};
use crate::urs::{GlobalUrsList, UpdRemSet};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether the concurrent mark phase is currently running.
///
/// The barrier checks this before doing anything else; outside of a cycle
/// it costs one relaxed atomic load per write.
#[derive(Debug, Default)]
pub struct BarrierGate {
    active: AtomicBool,
}

impl BarrierGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn enable(&self) {
        self.active.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// True if `ptr` has not yet been marked this cycle and therefore still
/// needs a barrier entry, filtering out anything the mark phase does not
/// own: younger-generation pointers belong to the moving collector, and a
/// closure already marked this epoch needs no second entry.
///
/// Large objects are gated by snapshot membership and the `MARKED` flag
/// rather than a segment mark byte, mirroring [`crate::mark_loop`]'s and
/// [`crate::liveness`]'s own `Heap` branches.
fn needs_upd_rem_set_mark(
    info: &dyn ClosureInfo,
    heap: &dyn SegmentHeap,
    large: &LargeObjectRegistry,
    ptr: ClosurePtr,
    epoch: u8,
) -> bool {
    if ptr.is_null() {
        return false;
    }
    match info.classify(ptr) {
        Classification::YoungerGeneration => false,
        Classification::Static => !info.is_claimed(ptr, epoch),
        Classification::Whitehole => true,
        Classification::Heap => {
            if let Some(flags) = large.flags(ptr) {
                flags.contains(LargeObjectFlags::NONMOVING_SWEEPING)
                    && !flags.contains(LargeObjectFlags::MARKED)
            } else {
                let segment = heap.segment_of(ptr);
                let block = heap.block_idx_of(ptr);
                if block >= heap.next_free_snap(segment) {
                    // Allocated after the snapshot was taken; implicitly live,
                    // no need to route it through the remembered set.
                    false
                } else {
                    heap.get_mark(segment, block) != epoch
                }
            }
        }
    }
}

/// The coarser filter the eager thunk tracer applies to each payload field:
/// anything outside the younger generation is already owned by this mark
/// phase (static, or heap-allocated in the nonmoving generation), so it is
/// safe to hand to the mark queue without the fuller epoch/mark-bit test
/// `needs_upd_rem_set_mark` performs for the self-test on a TSO or stack.
fn in_nonmoving_heap(info: &dyn ClosureInfo, ptr: ClosurePtr) -> bool {
    !ptr.is_null() && !matches!(info.classify(ptr), Classification::YoungerGeneration)
}

fn push_if_needed(
    urs: &UpdRemSet,
    info: &dyn ClosureInfo,
    heap: &dyn SegmentHeap,
    large: &LargeObjectRegistry,
    epoch: u8,
    ptr: ClosurePtr,
) -> crate::error::Result<bool> {
    if !needs_upd_rem_set_mark(info, heap, large, ptr, epoch) {
        return Ok(false);
    }
    urs.with_queue(|q| {
        q.push(MarkQueueEntry::MarkClosure {
            closure: ptr,
            origin: None,
        })
    })
}

/// Flushes `urs` into `global` if a push signalled it has grown past its
/// eager-flush threshold.
fn maybe_eager_flush(urs: &UpdRemSet, global: &GlobalUrsList, should_flush: bool) {
    if should_flush && let Some(queue) = urs.take() {
        global.push(queue);
    }
}

/// Generic barrier entry point: call before overwriting any pointer field
/// with a new value, passing the value about to be overwritten.
pub fn push_closure(
    gate: &BarrierGate,
    urs: &UpdRemSet,
    global: &GlobalUrsList,
    info: &dyn ClosureInfo,
    heap: &dyn SegmentHeap,
    large: &LargeObjectRegistry,
    epoch: u8,
    old_value: ClosurePtr,
) -> crate::error::Result<()> {
    if !gate.is_active() {
        return Ok(());
    }
    let should_flush = push_if_needed(urs, info, heap, large, epoch, old_value)?;
    maybe_eager_flush(urs, global, should_flush);
    Ok(())
}

/// Thunk update barrier: call before blackholing a thunk, passing the
/// thunk's own pointer so its pre-update contents are captured.
///
/// Unlike [`push_closure`], which defers tracing to the mark loop, this
/// traces the thunk's fields eagerly before returning. A thunk is
/// overwritten in place immediately after this barrier fires, so a mark
/// loop that only received the bare pointer would read the post-update
/// fields instead of the ones the snapshot is supposed to preserve. Spins
/// until the thunk's info pointer settles out of its transient
/// mid-overwrite state before describing it.
pub fn push_thunk(
    gate: &BarrierGate,
    urs: &UpdRemSet,
    global: &GlobalUrsList,
    info: &dyn ClosureInfo,
    thunk: ClosurePtr,
) -> crate::error::Result<()> {
    if !gate.is_active() {
        return Ok(());
    }
    while matches!(info.classify(thunk), Classification::Whitehole) {
        std::hint::spin_loop();
    }
    let view = info.describe(thunk);
    let should_flush = urs.with_queue(|q| {
        match &view {
            ClosureView::WithSrt {
                srt,
                payload,
                is_thunk: true,
            } => {
                if let Some(srt) = srt {
                    q.push(MarkQueueEntry::MarkThunkSrt { srt: *srt });
                }
                for &field in payload {
                    if in_nonmoving_heap(info, field) {
                        q.push(MarkQueueEntry::MarkClosure {
                            closure: field,
                            origin: None,
                        });
                    }
                }
            }
            ClosureView::Application { function, args } => {
                q.push(MarkQueueEntry::MarkClosure {
                    closure: *function,
                    origin: None,
                });
                for field in closure::arg_payload_pointers(args) {
                    q.push(MarkQueueEntry::MarkClosure {
                        closure: field,
                        origin: None,
                    });
                }
            }
            // A concurrent update already settled this into a selector
            // thunk or a blackhole; nothing left here for the snapshot to
            // capture.
            ClosureView::ThunkSelector { .. } | ClosureView::Indirection { .. } => {}
            other => unreachable!("push_thunk: not a thunk shape: {other:?}"),
        }
        q.needs_eager_flush()
    })?;
    maybe_eager_flush(urs, global, should_flush);
    Ok(())
}

/// Thread-state barrier: call before mutating a `TSO`'s stack pointer
/// (stack squeezing, stack growth) or other traced field in place.
///
/// Traces every field eagerly, for the same snapshot reason as
/// [`push_thunk`], then sets the mark bit via [`finish_mark`] only once
/// tracing has completed.
pub fn push_tso(
    gate: &BarrierGate,
    urs: &UpdRemSet,
    global: &GlobalUrsList,
    info: &dyn ClosureInfo,
    heap: &dyn SegmentHeap,
    large: &LargeObjectRegistry,
    epoch: u8,
    tso: ClosurePtr,
) -> crate::error::Result<()> {
    if !gate.is_active() {
        return Ok(());
    }
    if !needs_upd_rem_set_mark(info, heap, large, tso, epoch) {
        return Ok(());
    }
    let ClosureView::Thread(view) = info.describe(tso) else {
        unreachable!("push_tso: not a TSO");
    };
    let should_flush = urs.with_queue(|q| {
        closure::mark_tso(q, &view);
        q.needs_eager_flush()
    })?;
    finish_mark(heap, large, epoch, tso);
    maybe_eager_flush(urs, global, should_flush);
    Ok(())
}

/// Stack barrier: call before a stack is resized, so the frames about to be
/// abandoned are still captured by the snapshot.
///
/// At most one marker may trace a given stack: this claims it with the same
/// compare-and-swap [`closure::mark_stack`] uses for the concurrent mark
/// loop's own `STACK` closures. If this call wins the claim it traces the
/// stack and sets its mark bit; if it loses, some other marker (mutator or
/// collector) already owns the trace, so this busy-waits or yields, per
/// [`Configuration::busy_wait_on_stack_claim`], until that marker is done
/// rather than racing it a second time.
pub fn push_stack(
    gate: &BarrierGate,
    urs: &UpdRemSet,
    global: &GlobalUrsList,
    info: &dyn ClosureInfo,
    heap: &dyn SegmentHeap,
    large: &LargeObjectRegistry,
    config: &Configuration,
    epoch: u8,
    stack: ClosurePtr,
) -> crate::error::Result<()> {
    if !gate.is_active() {
        return Ok(());
    }
    if !needs_upd_rem_set_mark(info, heap, large, stack, epoch) {
        return Ok(());
    }
    let ClosureView::Stack(view) = info.describe(stack) else {
        unreachable!("push_stack: not a STACK");
    };
    let mut should_flush = false;
    let claimed = urs.with_queue(|q| {
        let won = closure::mark_stack(info, q, &view, epoch);
        should_flush = q.needs_eager_flush();
        won
    })?;
    if claimed {
        finish_mark(heap, large, epoch, stack);
        maybe_eager_flush(urs, global, should_flush);
        return Ok(());
    }
    // The concurrent mark phase has already claimed the right to mark this
    // stack; wait for it to finish rather than retrying the claim.
    while needs_upd_rem_set_mark(info, heap, large, stack, epoch) {
        if config.busy_wait_on_stack_claim {
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }
    Ok(())
}
