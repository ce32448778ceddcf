//! Reclamation tests
//!
//! This crate has no destructor of its own: marking decides what survives,
//! and reclaiming what didn't is two separate handoffs back to the host —
//! sweeping the large-object registry, and finalizing dead weak pointers.
//! These tests exercise both handoffs end to end through `MarkCycle`.

use nonmoving_mark::{
    ArrayPtr, Classification, ClosureInfo, ClosurePtr, ClosureView, Configuration, LargeObjectFlags,
    MarkCycle, Result, SegmentHeap, ThreadInfo, ThreadStatus, WeakEntry,
};
use std::collections::HashMap;
use std::sync::Mutex;

struct FlatHeap {
    marks: Mutex<HashMap<usize, u8>>,
}
impl SegmentHeap for FlatHeap {
    fn segment_of(&self, _ptr: ClosurePtr) -> usize {
        0
    }
    fn block_idx_of(&self, ptr: ClosurePtr) -> usize {
        ptr.raw()
    }
    fn get_mark(&self, _segment: usize, block: usize) -> u8 {
        *self.marks.lock().unwrap().get(&block).unwrap_or(&0)
    }
    fn set_mark(&self, _segment: usize, block: usize, epoch: u8) {
        self.marks.lock().unwrap().insert(block, epoch);
    }
    fn next_free_snap(&self, _segment: usize) -> usize {
        1_000_000
    }
}

struct GraphInfo {
    edges: HashMap<usize, Vec<usize>>,
}
impl ClosureInfo for GraphInfo {
    fn classify(&self, _ptr: ClosurePtr) -> Classification {
        Classification::Heap
    }
    fn describe(&self, ptr: ClosurePtr) -> ClosureView {
        let payload = self
            .edges
            .get(&ptr.raw())
            .into_iter()
            .flatten()
            .map(|&addr| ClosurePtr::from_raw(addr))
            .collect();
        ClosureView::Constr { payload }
    }
    fn array_chunk(&self, _array: ArrayPtr, _start: usize) -> (Vec<ClosurePtr>, usize) {
        (vec![], 0)
    }
    fn is_claimed(&self, _ptr: ClosurePtr, _epoch: u8) -> bool {
        false
    }
    fn claim_once(&self, _ptr: ClosurePtr, _epoch: u8) -> bool {
        true
    }
}

struct AllComplete;
impl ThreadInfo for AllComplete {
    fn status(&self, _tso: ClosurePtr) -> ThreadStatus {
        ThreadStatus::Complete
    }
}

#[test]
fn an_unreachable_large_object_is_reclaimed_by_sweep() -> Result<()> {
    let info = GraphInfo {
        edges: HashMap::from([(8, vec![16])]),
    };
    let heap = FlatHeap {
        marks: Mutex::new(HashMap::new()),
    };
    let cycle = MarkCycle::new(Configuration {
        workers: 1,
        ..Configuration::default()
    });
    cycle.init(vec![], vec![]);

    let reachable = ClosurePtr::from_raw(16);
    let garbage = ClosurePtr::from_raw(9999);
    cycle.large_objects().adopt(reachable, false);
    cycle.large_objects().adopt(garbage, false);

    cycle.add_root(ClosurePtr::from_raw(8));
    cycle.mark(&info, &heap);

    let reclaimed = cycle.large_objects().sweep();
    assert_eq!(reclaimed, vec![garbage]);
    assert!(!cycle.large_objects().is_marked(reachable));
    assert_eq!(cycle.large_objects().len(), 1);
    Ok(())
}

#[test]
fn pinned_large_objects_are_still_reclaimed_when_unreachable() -> Result<()> {
    let heap = FlatHeap {
        marks: Mutex::new(HashMap::new()),
    };
    let cycle = MarkCycle::new(Configuration {
        workers: 1,
        ..Configuration::default()
    });
    cycle.init(vec![], vec![]);

    let pinned = ClosurePtr::from_raw(9999);
    cycle.large_objects().adopt(pinned, true);
    assert!(
        cycle
            .large_objects()
            .flags(pinned)
            .unwrap()
            .contains(LargeObjectFlags::PINNED)
    );

    // Pinning only keeps the moving collector from relocating an object; it
    // has no say over whether the nonmoving sweep reclaims an unreachable
    // one.
    let info = GraphInfo {
        edges: HashMap::new(),
    };
    cycle.mark(&info, &heap);
    let reclaimed = cycle.large_objects().sweep();
    assert_eq!(reclaimed, vec![pinned]);
    Ok(())
}

#[test]
fn a_large_object_reachable_through_a_heap_closure_survives_sweep() -> Result<()> {
    let info = GraphInfo {
        edges: HashMap::from([(8, vec![9999])]),
    };
    let heap = FlatHeap {
        marks: Mutex::new(HashMap::new()),
    };
    let cycle = MarkCycle::new(Configuration {
        workers: 1,
        ..Configuration::default()
    });
    cycle.init(vec![], vec![]);

    let large = ClosurePtr::from_raw(9999);
    cycle.large_objects().adopt(large, false);
    cycle.add_root(ClosurePtr::from_raw(8));
    cycle.mark(&info, &heap);

    assert!(cycle.large_objects().is_marked(large));
    let reclaimed = cycle.large_objects().sweep();
    assert!(reclaimed.is_empty());
    assert_eq!(cycle.large_objects().len(), 1);
    Ok(())
}

#[test]
fn a_dead_weak_pointers_finalizer_traces_exactly_once_and_does_not_resurface_next_cycle()
-> Result<()> {
    let info = GraphInfo {
        edges: HashMap::new(),
    };
    let heap = FlatHeap {
        marks: Mutex::new(HashMap::new()),
    };
    let cycle = MarkCycle::new(Configuration {
        workers: 1,
        ..Configuration::default()
    });

    let weak = WeakEntry {
        handle: ClosurePtr::from_raw(4),
        key: ClosurePtr::from_raw(8),
        value: ClosurePtr::from_raw(100),
        finalizer: Some(ClosurePtr::from_raw(200)),
    };
    // First cycle: the key never marks, so the finalizer is traced and the
    // entry comes back dead exactly once.
    cycle.init(vec![], vec![weak]);
    cycle.mark(&info, &heap);
    let report = cycle.reconcile(&info, &heap, &AllComplete);
    assert_eq!(report.dead_weaks.len(), 1);
    assert_eq!(heap.get_mark(0, 200), cycle.epoch());

    // A second cycle with nothing registered must not re-report anything:
    // resubmission is the host's job, not something the collector infers.
    cycle.init(vec![], vec![]);
    cycle.mark(&info, &heap);
    let report = cycle.reconcile(&info, &heap, &AllComplete);
    assert!(report.dead_weaks.is_empty());
    Ok(())
}
