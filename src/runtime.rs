//! Traits implemented by the embedding runtime.
//!
//! The mark phase never allocates, parses bytecode or decides how closures
//! are laid out in memory; all of that is "the runtime" from this crate's
//! point of view. These traits are the seam: a host provides one
//! implementation tying the abstract [`ClosurePtr`](crate::ptr::ClosurePtr)
//! values the tracer pushes around back to real heap objects, real segment
//! bookkeeping and real capability/scheduler state.

use crate::closure::ClosureView;
use crate::ptr::{ArrayPtr, ClosurePtr};

/// Segment identifier for the nonmoving small-object allocator.
pub type SegmentId = usize;

/// Index of a block within a segment.
pub type BlockIdx = usize;

/// Info-table and closure-layout queries.
///
/// One call per mark-queue entry: classify the pointer, then (for anything
/// backed by real storage) decode it into a [`ClosureView`] so the tracer can
/// walk its pointer fields without knowing the concrete closure type.
pub trait ClosureInfo: Send + Sync {
    /// Classifies a pointer before the tracer commits to tracing it.
    fn classify(&self, ptr: ClosurePtr) -> Classification;

    /// Decodes a heap-allocated closure's pointer fields.
    ///
    /// Only called for pointers [`classify`](Self::classify) reported as
    /// [`Classification::Heap`].
    fn describe(&self, ptr: ClosurePtr) -> ClosureView;

    /// Fetches up to a chunk's worth of a pointer array's elements starting
    /// at `start`, plus the array's total length.
    ///
    /// Only called for closures whose [`ClosureView`] was
    /// [`ClosureView::PointerArray`].
    fn array_chunk(&self, array: ArrayPtr, start: usize) -> (Vec<ClosurePtr>, usize);

    /// Read-only check: has `ptr` already been claimed for `epoch`, by this
    /// thread or another one?
    ///
    /// Used by the write barrier's filter, which must not itself perform
    /// the claim — only the mark loop is allowed to do that, since a
    /// barrier entry that claimed a static closure without tracing it would
    /// leave it permanently unreachable to later markers.
    fn is_claimed(&self, ptr: ClosurePtr, epoch: u8) -> bool;

    /// Atomically claims `ptr` for `epoch` using whatever single claim
    /// token the runtime embeds in the closure for this purpose (a static
    /// closure's link field, or a stack's own marking-epoch word).
    ///
    /// Returns `true` the first time this is observed to succeed for a
    /// given `(ptr, epoch)` pair; every subsequent call for the same pair
    /// returns `false`, telling the caller another marker already owns it.
    fn claim_once(&self, ptr: ClosurePtr, epoch: u8) -> bool;
}

/// Where a pointer lives, established before the tracer decides whether (and
/// how) to trace it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// A static closure (`FUN_STATIC`, `THUNK_STATIC`, `CONSTR` with no free
    /// variables, and friends). Traced by linking it onto the static
    /// closure snapshot list rather than by the segment mark-bit registry.
    Static,
    /// Backed by nonmoving-heap storage (small-object segment or large
    /// object) and eligible for mark-bit tracking.
    Heap,
    /// Allocated in a younger generation; out of scope for this mark phase,
    /// the moving collector owns it.
    YoungerGeneration,
    /// Currently a whitehole: another thread is in the middle of
    /// overwriting this closure (e.g. blackholing a thunk). The caller
    /// should spin briefly and reclassify.
    Whitehole,
}

/// Opaque segment + block-index mark-bit registry for the small-object
/// nonmoving allocator.
pub trait SegmentHeap: Send + Sync {
    /// Segment containing `ptr`.
    fn segment_of(&self, ptr: ClosurePtr) -> SegmentId;
    /// Block index of `ptr` within its segment.
    fn block_idx_of(&self, ptr: ClosurePtr) -> BlockIdx;
    /// Mark-cell value currently stored for this block; `0` means "never
    /// marked".
    fn get_mark(&self, segment: SegmentId, block: BlockIdx) -> u8;
    /// Stamps the block's mark cell with `epoch`.
    fn set_mark(&self, segment: SegmentId, block: BlockIdx, epoch: u8);
    /// Blocks at or beyond this index in `segment` were allocated after the
    /// start-of-cycle snapshot and are implicitly live for this cycle.
    fn next_free_snap(&self, segment: SegmentId) -> BlockIdx;
}

/// Scheduler / capability coordination needed by the flush-sync protocol.
///
/// Out of scope for this crate: how workers are scheduled, how a foreign
/// call is detected, how a capability is released. In scope: the three
/// calls the mark phase needs to make into that machinery.
pub trait WorkerCoordinator: Send + Sync {
    /// Number of workers expected to own an update remembered set this
    /// cycle.
    fn worker_count(&self) -> usize;
    /// Stops every worker, including one blocked in a foreign call, and
    /// forces each one's update remembered set to flush via
    /// `UpdRemSet::flush_forced` before returning.
    fn stop_all_workers(&self);
    /// Resumes every worker stopped by `stop_all_workers`.
    fn release_all_workers(&self);
}
