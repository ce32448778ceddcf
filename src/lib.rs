//! # Nonmoving Mark
//!
//! The concurrent mark phase of a non-moving, snapshot-at-the-beginning
//! collector, designed to run alongside a separate young-generation moving
//! collector rather than replace it.
//!
//! ## Overview
//!
//! This crate implements the mark side of a collector for a managed heap
//! whose nonmoving generation is swept in place rather than compacted. It
//! owns the mark queue, the write barrier and its per-mutator update
//! remembered sets, the large-object partition, the flush/sync handshake
//! used to synchronize with mutators mid-cycle, and the post-mark
//! reconciliation of weak pointers and blocked threads.
//!
//! ### 🔄 **Concurrent, Snapshot-at-the-Beginning Marking**
//! - A single initial pause takes the root set and mark epoch snapshot
//! - Marking then runs concurrently with mutator threads
//! - A write barrier captures pointers a mutator is about to overwrite,
//!   preserving the snapshot's reachability guarantee
//!
//! ### ⚡ **Decoupled from Heap Layout**
//! - [`runtime::ClosureInfo`], [`runtime::SegmentHeap`] and
//!   [`runtime::WorkerCoordinator`] are the seams a host runtime implements;
//!   this crate never assumes a concrete object layout or allocator
//! - [`closure::ClosureView`] is the tracer's dispatch surface: a decoded,
//!   tagged view of a closure's pointer fields, handed back by the host
//!
//! ### 🛠️ **Configurable**
//! - [`config::Configuration`] controls worker count, mark queue block size,
//!   and whether stack-claim contention busy-waits or yields
//! - [`config::Statistics`] reports per-cycle counters for observability
//!
//! ## Architecture
//!
//! 1. **Initialization** — [`collector::MarkCycle::init`] bumps the mark
//!    epoch, resets every worker's update remembered set, and enables the
//!    write barrier.
//! 2. **Root marking** — [`collector::MarkCycle::add_root`] seeds the mark
//!    queue; [`collector::MarkCycle::mark`] drains it to a fixpoint,
//!    refilling from anything flushed into the global update remembered set
//!    list.
//! 3. **Flush/sync** — [`collector::MarkCycle::begin_flush`] and
//!    [`collector::MarkCycle::finish_flush`] bracket the handshake that lets
//!    the collector observe a consistent view of every mutator's barrier
//!    activity before disabling it.
//! 4. **Reconciliation** — [`collector::MarkCycle::reconcile`] ties off weak
//!    pointers and resurrects threads blocked on something now known dead,
//!    repeating until the cycle reaches a fixpoint.

#![allow(dead_code)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_in_result)]
#![deny(clippy::unwrap_used)]

mod barrier;
mod closure;
mod collector;
mod config;
mod error;
mod large_objects;
mod liveness;
mod mark_loop;
mod ptr;
mod queue;
mod runtime;
mod sync;
mod urs;

pub use barrier::{BarrierGate, push_closure, push_stack, push_thunk, push_tso};
pub use closure::{ArgPayload, ClosureView, Frame, MarkSink, StackView, TrecEntry, TsoView};
pub use collector::{MarkCycle, ReconciliationReport};
pub use config::{Configuration, Statistics};
pub use error::{Error, Result};
pub use large_objects::{LargeObjectFlags, LargeObjectRegistry};
pub use liveness::{
    ResurrectionOutcome, ThreadInfo, ThreadList, ThreadStatus, WeakEntry, WeakPointerList,
    is_alive, is_now_alive,
};
pub use ptr::{ArrayPtr, ClosurePtr, SlotAddress};
pub use queue::{MarkQueue, MarkQueueEntry};
pub use runtime::{BlockIdx, Classification, ClosureInfo, SegmentHeap, SegmentId, WorkerCoordinator};
pub use sync::FlushSync;
pub use urs::{GlobalUrsList, UpdRemSet, UpdRemSetTable};
