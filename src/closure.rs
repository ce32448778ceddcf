//! The closure tracer: dispatches on a decoded closure's shape and pushes
//! every pointer field it finds onto the mark queue.

use crate::ptr::{ArrayPtr, ClosurePtr};
use crate::queue::MarkQueueEntry;
use crate::runtime::ClosureInfo;

/// A decoded view of a heap-allocated closure's pointer fields, produced by
/// [`ClosureInfo::describe`].
///
/// This stands in for dispatch on an info-table pointer: rather than the
/// tracer following a vtable, the runtime hands back a plain tagged value
/// and the tracer's dispatch is a single match, keeping every call site's
/// branch history identical across closures of the same kind.
#[derive(Debug, Clone)]
pub enum ClosureView {
    Mvar {
        head: ClosurePtr,
        tail: ClosurePtr,
        value: ClosurePtr,
    },
    TVar {
        current_value: ClosurePtr,
        watch_queue: ClosurePtr,
    },
    /// `FUN`/`THUNK` closures, both of which carry an optional static
    /// referent table alongside their free-variable payload.
    WithSrt {
        srt: Option<ClosurePtr>,
        payload: Vec<ClosurePtr>,
        is_thunk: bool,
    },
    Constr {
        payload: Vec<ClosurePtr>,
    },
    Bco {
        instrs: ClosurePtr,
        literals: ClosurePtr,
        ptrs: ClosurePtr,
    },
    /// `IND` and `BLACKHOLE` both reduce to tracing a single indirectee.
    Indirection {
        indirectee: ClosurePtr,
    },
    MutVar {
        value: ClosurePtr,
    },
    BlockingQueue {
        black_hole: ClosurePtr,
        owner: ClosurePtr,
        queue: ClosurePtr,
        link: ClosurePtr,
    },
    /// Thunk selectors are traced conservatively: the selectee is pushed
    /// without attempting to reduce the selection (no evaluation is
    /// performed during marking).
    ThunkSelector {
        selectee: ClosurePtr,
    },
    ApStack {
        function: ClosurePtr,
        stack: StackView,
    },
    /// `PAP` and `AP` closures: a function plus a bitmap-described argument
    /// block.
    Application {
        function: ClosurePtr,
        args: ArgPayload,
    },
    /// `ARR_WORDS`: unboxed payload, nothing to trace.
    ArrWords,
    PointerArray {
        array: ArrayPtr,
        length: usize,
    },
    SmallPointerArray {
        payload: Vec<ClosurePtr>,
    },
    Thread(TsoView),
    Stack(StackView),
    MutPrim {
        payload: Vec<ClosurePtr>,
    },
    TrecChunk {
        prev_chunk: Option<ClosurePtr>,
        entries: Vec<TrecEntry>,
    },
}

/// A decoded stack activation record.
#[derive(Debug, Clone)]
pub enum Frame {
    Update {
        updatee: ClosurePtr,
    },
    SmallBitmap {
        slots: Vec<ClosurePtr>,
        bitmap: u64,
    },
    LargeBitmap {
        slots: Vec<ClosurePtr>,
        bitmap: Vec<u64>,
    },
    RetBco {
        bco: ClosurePtr,
        args: ArgPayload,
    },
    RetFun {
        function: ClosurePtr,
        srt: Option<ClosurePtr>,
        args: ArgPayload,
    },
}

/// A `STACK` closure or the embedded stack payload of an `AP_STACK`.
///
/// `claim_flag`, when present, is the epoch word a marker must
/// compare-and-swap before walking the frames, serializing a concurrent
/// mutator pushing to the same stack against this worker's trace. Embedded
/// `AP_STACK` payloads have no independent claim, since the `AP_STACK`
/// closure itself is what a concurrent marker would race to claim.
#[derive(Debug, Clone)]
pub struct StackView {
    pub frames: Vec<Frame>,
    pub claim: Option<ClosurePtr>,
}

/// A thread's traceable fields.
#[derive(Debug, Clone)]
pub struct TsoView {
    pub stack: ClosurePtr,
    pub blocked_exceptions: Option<ClosurePtr>,
    pub blocking_queue: Option<ClosurePtr>,
    pub trec: Option<ClosurePtr>,
    pub bound_thread: Option<ClosurePtr>,
    pub thread_link: Option<ClosurePtr>,
    pub block_info: Option<ClosurePtr>,
}

/// One `(tvar, expected, new)` triple inside a transaction record chunk.
#[derive(Debug, Clone, Copy)]
pub struct TrecEntry {
    pub tvar: ClosurePtr,
    pub expected_value: ClosurePtr,
    pub new_value: ClosurePtr,
}

/// A bitmap-described argument block, shared by `PAP`/`AP` payloads and
/// `RET_FUN`/`RET_BCO` stack frames.
#[derive(Debug, Clone)]
pub enum ArgPayload {
    Small { slots: Vec<ClosurePtr>, bitmap: u64 },
    Large { slots: Vec<ClosurePtr>, bitmap: Vec<u64> },
}

/// Anything that can receive work from the tracer: the collector's own mark
/// queue in collector mode, or a worker's update remembered set in barrier
/// mode.
pub trait MarkSink {
    fn push(&mut self, entry: MarkQueueEntry);
}

impl<S: MarkSink + ?Sized> MarkSink for &mut S {
    fn push(&mut self, entry: MarkQueueEntry) {
        (**self).push(entry);
    }
}

fn push_closure(sink: &mut impl MarkSink, closure: ClosurePtr) {
    sink.push(MarkQueueEntry::MarkClosure {
        closure,
        origin: None,
    });
}

fn push_many(sink: &mut impl MarkSink, closures: &[ClosurePtr]) {
    for &c in closures {
        push_closure(sink, c);
    }
}

/// Decodes a small (`<= 64` slots) pointer bitmap: a `0` bit marks a pointer
/// slot, a `1` bit marks a non-pointer word to skip.
pub fn mark_small_bitmap(sink: &mut impl MarkSink, slots: &[ClosurePtr], bitmap: u64) {
    for (i, &slot) in slots.iter().enumerate() {
        if (bitmap >> i) & 1 == 0 {
            push_closure(sink, slot);
        }
    }
}

/// Decodes a large pointer bitmap spanning multiple 64-bit words.
pub fn mark_large_bitmap(sink: &mut impl MarkSink, slots: &[ClosurePtr], bitmap: &[u64]) {
    for (i, &slot) in slots.iter().enumerate() {
        let word = bitmap[i / 64];
        if (word >> (i % 64)) & 1 == 0 {
            push_closure(sink, slot);
        }
    }
}

fn mark_arg_payload(sink: &mut impl MarkSink, args: &ArgPayload) {
    match args {
        ArgPayload::Small { slots, bitmap } => mark_small_bitmap(sink, slots, *bitmap),
        ArgPayload::Large { slots, bitmap } => mark_large_bitmap(sink, slots, bitmap),
    }
}

/// A [`MarkSink`] that just collects what would have been pushed, rather
/// than pushing it anywhere. Lets a caller decode an argument bitmap into
/// its pointer fields without needing a queue or update remembered set on
/// hand yet, e.g. to filter each field individually before deciding whether
/// it needs the write barrier.
struct PointerCollector {
    pointers: Vec<ClosurePtr>,
}
impl MarkSink for PointerCollector {
    fn push(&mut self, entry: MarkQueueEntry) {
        if let MarkQueueEntry::MarkClosure { closure, .. } = entry {
            self.pointers.push(closure);
        }
    }
}

/// Decodes `args`'s bitmap into the pointer-tagged slots it covers, e.g. to
/// push each one through the write barrier's own filter rather than
/// unconditionally, the way an eagerly-traced `AP`/`PAP` payload must be.
pub(crate) fn arg_payload_pointers(args: &ArgPayload) -> Vec<ClosurePtr> {
    let mut collector = PointerCollector { pointers: vec![] };
    mark_arg_payload(&mut collector, args);
    collector.pointers
}

fn mark_frame(sink: &mut impl MarkSink, frame: &Frame) {
    match frame {
        Frame::Update { updatee } => push_closure(sink, *updatee),
        Frame::SmallBitmap { slots, bitmap } => mark_small_bitmap(sink, slots, *bitmap),
        Frame::LargeBitmap { slots, bitmap } => mark_large_bitmap(sink, slots, bitmap),
        Frame::RetBco { bco, args } => {
            push_closure(sink, *bco);
            mark_arg_payload(sink, args);
        }
        Frame::RetFun {
            function,
            srt,
            args,
        } => {
            push_closure(sink, *function);
            if let Some(srt) = srt {
                sink.push(MarkQueueEntry::MarkFunSrt { srt: *srt });
            }
            mark_arg_payload(sink, args);
        }
    }
}

/// Walks every frame of a decoded stack, claiming it first if it carries a
/// claim token.
///
/// Returns `false` without tracing anything if the claim was already held by
/// another marker; the caller is expected to treat that as "someone else is
/// handling this, move on" rather than as an error.
pub fn mark_stack(
    info: &dyn ClosureInfo,
    sink: &mut impl MarkSink,
    stack: &StackView,
    this_cycle: u8,
) -> bool {
    if let Some(owner) = stack.claim
        && !try_claim_stack(info, owner, this_cycle)
    {
        return false;
    }
    for frame in &stack.frames {
        mark_frame(sink, frame);
    }
    true
}

fn try_claim_stack(info: &dyn ClosureInfo, stack: ClosurePtr, this_cycle: u8) -> bool {
    info.claim_once(stack, this_cycle)
}

pub(crate) fn mark_tso(sink: &mut impl MarkSink, tso: &TsoView) {
    push_closure(sink, tso.stack);
    for field in [
        tso.blocked_exceptions,
        tso.blocking_queue,
        tso.bound_thread,
        tso.thread_link,
        tso.block_info,
    ] {
        if let Some(p) = field {
            push_closure(sink, p);
        }
    }
}

/// Walks a transaction record chunk's `(tvar, expected, new)` triples.
///
/// No write barrier fires while walking `TREC_CHUNK` headers: a transaction
/// under construction is thread-local and cannot be observed by another
/// mutator until it commits, so there is nothing for a barrier to protect
/// against here.
fn mark_trec_chunk(sink: &mut impl MarkSink, prev_chunk: Option<ClosurePtr>, entries: &[TrecEntry]) {
    if let Some(prev) = prev_chunk {
        push_closure(sink, prev);
    }
    for entry in entries {
        push_closure(sink, entry.tvar);
        push_closure(sink, entry.expected_value);
        push_closure(sink, entry.new_value);
    }
}

/// Traces one heap-allocated closure, dispatching on its decoded shape.
///
/// `this_cycle` is the current mark epoch, needed to arbitrate `STACK`
/// claim races. Returns `false` only when tracing a `STACK` closure lost a
/// claim race; every other variant always traces successfully.
pub fn mark_closure(
    info: &dyn ClosureInfo,
    sink: &mut impl MarkSink,
    view: &ClosureView,
    this_cycle: u8,
) -> bool {
    match view {
        ClosureView::Mvar { head, tail, value } => {
            push_closure(sink, *head);
            push_closure(sink, *tail);
            push_closure(sink, *value);
        }
        ClosureView::TVar {
            current_value,
            watch_queue,
        } => {
            push_closure(sink, *current_value);
            push_closure(sink, *watch_queue);
        }
        ClosureView::WithSrt {
            srt,
            payload,
            is_thunk,
        } => {
            push_many(sink, payload);
            if let Some(srt) = srt {
                let entry = if *is_thunk {
                    MarkQueueEntry::MarkThunkSrt { srt: *srt }
                } else {
                    MarkQueueEntry::MarkFunSrt { srt: *srt }
                };
                sink.push(entry);
            }
        }
        ClosureView::Constr { payload } => push_many(sink, payload),
        ClosureView::Bco {
            instrs,
            literals,
            ptrs,
        } => {
            push_closure(sink, *instrs);
            push_closure(sink, *literals);
            push_closure(sink, *ptrs);
        }
        ClosureView::Indirection { indirectee } => push_closure(sink, *indirectee),
        ClosureView::MutVar { value } => push_closure(sink, *value),
        ClosureView::BlockingQueue {
            black_hole,
            owner,
            queue,
            link,
        } => {
            push_closure(sink, *black_hole);
            push_closure(sink, *owner);
            push_closure(sink, *queue);
            push_closure(sink, *link);
        }
        ClosureView::ThunkSelector { selectee } => push_closure(sink, *selectee),
        ClosureView::ApStack { function, stack } => {
            push_closure(sink, *function);
            return mark_stack(info, sink, stack, this_cycle);
        }
        ClosureView::Application { function, args } => {
            push_closure(sink, *function);
            mark_arg_payload(sink, args);
        }
        ClosureView::ArrWords => {}
        ClosureView::PointerArray { array, length: _ } => {
            sink.push(MarkQueueEntry::MarkArray {
                array: *array,
                start: 0,
            });
        }
        ClosureView::SmallPointerArray { payload } => push_many(sink, payload),
        ClosureView::Thread(tso) => mark_tso(sink, tso),
        ClosureView::Stack(stack) => return mark_stack(info, sink, stack, this_cycle),
        ClosureView::MutPrim { payload } => push_many(sink, payload),
        ClosureView::TrecChunk {
            prev_chunk,
            entries,
        } => mark_trec_chunk(sink, *prev_chunk, entries),
    }
    true
}

/// Traces one chunk of a pointer array, re-queuing the remainder.
///
/// `slots` holds only the elements belonging to this chunk, starting at
/// `start` within the full array; the caller (the mark loop) is responsible
/// for slicing them out of the array before calling this.
pub fn mark_array_chunk(
    sink: &mut impl MarkSink,
    array: ArrayPtr,
    start: usize,
    total_length: usize,
    slots: &[ClosurePtr],
) {
    push_many(sink, slots);
    let next = start + slots.len();
    if next < total_length {
        sink.push(MarkQueueEntry::MarkArray {
            array,
            start: next,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};

    struct Vec1 {
        pushed: Vec<ClosurePtr>,
    }
    impl MarkSink for Vec1 {
        fn push(&mut self, entry: MarkQueueEntry) {
            if let MarkQueueEntry::MarkClosure { closure, .. } = entry {
                self.pushed.push(closure);
            }
        }
    }

    struct FakeInfo {
        claimed_at: AtomicU8,
    }
    impl ClosureInfo for FakeInfo {
        fn classify(&self, _ptr: ClosurePtr) -> crate::runtime::Classification {
            crate::runtime::Classification::Heap
        }
        fn describe(&self, _ptr: ClosurePtr) -> ClosureView {
            unreachable!()
        }
        fn array_chunk(&self, _array: ArrayPtr, _start: usize) -> (Vec<ClosurePtr>, usize) {
            unreachable!()
        }
        fn is_claimed(&self, _ptr: ClosurePtr, epoch: u8) -> bool {
            self.claimed_at.load(Ordering::Acquire) == epoch
        }
        fn claim_once(&self, _ptr: ClosurePtr, epoch: u8) -> bool {
            self.claimed_at
                .compare_exchange(0, epoch, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        }
    }

    #[test]
    fn constr_pushes_every_field() {
        let info = FakeInfo { claimed_at: AtomicU8::new(0) };
        let mut sink = Vec1 { pushed: vec![] };
        let view = ClosureView::Constr {
            payload: vec![ClosurePtr::from_raw(8), ClosurePtr::from_raw(16)],
        };
        assert!(mark_closure(&info, &mut sink, &view, 1));
        assert_eq!(sink.pushed.len(), 2);
    }

    #[test]
    fn arr_words_pushes_nothing() {
        let info = FakeInfo { claimed_at: AtomicU8::new(0) };
        let mut sink = Vec1 { pushed: vec![] };
        assert!(mark_closure(&info, &mut sink, &ClosureView::ArrWords, 1));
        assert!(sink.pushed.is_empty());
    }

    #[test]
    fn first_claim_of_a_stack_succeeds_second_fails() {
        let info = FakeInfo { claimed_at: AtomicU8::new(0) };
        let stack = StackView {
            frames: vec![],
            claim: Some(ClosurePtr::from_raw(0x100)),
        };
        let mut sink = Vec1 { pushed: vec![] };
        assert!(mark_stack(&info, &mut sink, &stack, 1));
        assert!(!mark_stack(&info, &mut sink, &stack, 1));
    }

    #[test]
    fn small_bitmap_skips_non_pointer_words() {
        let mut sink = Vec1 { pushed: vec![] };
        let slots = [
            ClosurePtr::from_raw(8),
            ClosurePtr::from_raw(16),
            ClosurePtr::from_raw(24),
        ];
        // bit 1 set -> slots[1] is a non-pointer word.
        mark_small_bitmap(&mut sink, &slots, 0b010);
        assert_eq!(sink.pushed, vec![slots[0], slots[2]]);
    }

    #[test]
    fn array_chunk_requeues_the_remainder() {
        let mut sink = Vec1 { pushed: vec![] };
        let array = ArrayPtr::from_raw(0x200);
        let slots = vec![ClosurePtr::from_raw(8), ClosurePtr::from_raw(16)];
        mark_array_chunk(&mut sink, array, 0, 5, &slots);
        assert_eq!(sink.pushed.len(), 2);
    }
}
