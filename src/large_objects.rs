//! The large-object registry: the two halves of the large-object set and
//! the flags tracked on each member.
//!
//! Unlike the small-object segment heap, this list is owned directly by the
//! mark phase rather than queried through an external trait, since marking
//! a large object means moving its descriptor between these two lists
//! under a single mutex.

use crate::ptr::ClosurePtr;
use parking_lot::Mutex;
use std::collections::HashMap;

bitflags::bitflags! {
    /// Per-large-object flags, mirroring the descriptor bits the block
    /// allocator keeps for any large object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LargeObjectFlags: u8 {
        /// Owned by the nonmoving generation.
        const NONMOVING = 0b0000_0001;
        /// Backed by a block-group rather than a small-object segment.
        const LARGE = 0b0000_0010;
        /// Adopted into this cycle's snapshot; eligible for the sweep that
        /// follows this mark.
        const NONMOVING_SWEEPING = 0b0000_0100;
        /// Marked reachable this cycle.
        const MARKED = 0b0000_1000;
        /// Pinned; never moved or swept regardless of reachability.
        const PINNED = 0b0001_0000;
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    flags: LargeObjectFlags,
}

/// The large-object set, partitioned by [`LargeObjectFlags::MARKED`].
#[derive(Debug, Default)]
pub struct LargeObjectRegistry {
    entries: Mutex<HashMap<ClosurePtr, Entry>>,
}

impl LargeObjectRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopts a large object evacuated into the nonmoving generation by the
    /// moving collector at the start of a major collection, joining this
    /// cycle's snapshot.
    pub fn adopt(&self, ptr: ClosurePtr, pinned: bool) {
        let mut flags = LargeObjectFlags::NONMOVING
            | LargeObjectFlags::LARGE
            | LargeObjectFlags::NONMOVING_SWEEPING;
        if pinned {
            flags |= LargeObjectFlags::PINNED;
        }
        self.entries.lock().insert(ptr, Entry { flags });
    }

    /// Marks `ptr` reachable, moving it into the marked partition. Returns
    /// `true` the first time this is observed for `ptr` this cycle; later
    /// calls against an already-marked object return `false` so callers can
    /// avoid double-counting statistics.
    pub fn mark(&self, ptr: ClosurePtr) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&ptr) else {
            return false;
        };
        if entry.flags.contains(LargeObjectFlags::MARKED) {
            return false;
        }
        entry.flags |= LargeObjectFlags::MARKED;
        true
    }

    #[must_use]
    pub fn flags(&self, ptr: ClosurePtr) -> Option<LargeObjectFlags> {
        self.entries.lock().get(&ptr).map(|e| e.flags)
    }

    #[must_use]
    pub fn is_marked(&self, ptr: ClosurePtr) -> bool {
        self.flags(ptr)
            .is_some_and(|f| f.contains(LargeObjectFlags::MARKED))
    }

    /// Clears every `MARKED` bit and drops `NONMOVING_SWEEPING` membership
    /// for objects that were never marked, i.e. performs the sweep the
    /// mark phase hands off to: unmarked snapshot members are freed by the
    /// caller after this returns their pointers.
    pub fn sweep(&self) -> Vec<ClosurePtr> {
        let mut entries = self.entries.lock();
        let mut dead = Vec::new();
        entries.retain(|&ptr, entry| {
            if entry.flags.contains(LargeObjectFlags::MARKED) {
                entry.flags.remove(LargeObjectFlags::MARKED);
                true
            } else {
                dead.push(ptr);
                false
            }
        });
        dead
    }

    #[must_use]
    pub fn marked_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| e.flags.contains(LargeObjectFlags::MARKED))
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adopted_objects_join_the_snapshot_unmarked() {
        let registry = LargeObjectRegistry::new();
        let p = ClosurePtr::from_raw(8);
        registry.adopt(p, false);
        let flags = registry.flags(p).expect("adopted");
        assert!(flags.contains(LargeObjectFlags::NONMOVING_SWEEPING));
        assert!(!flags.contains(LargeObjectFlags::MARKED));
    }

    #[test]
    fn marking_is_idempotent() {
        let registry = LargeObjectRegistry::new();
        let p = ClosurePtr::from_raw(8);
        registry.adopt(p, false);
        assert!(registry.mark(p));
        assert!(!registry.mark(p));
        assert_eq!(registry.marked_count(), 1);
    }

    #[test]
    fn sweep_reclaims_unmarked_and_clears_marks() {
        let registry = LargeObjectRegistry::new();
        let live = ClosurePtr::from_raw(8);
        let dead = ClosurePtr::from_raw(16);
        registry.adopt(live, false);
        registry.adopt(dead, false);
        registry.mark(live);

        let reclaimed = registry.sweep();
        assert_eq!(reclaimed, vec![dead]);
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_marked(live));
    }

    #[test]
    fn pinned_objects_are_flagged_but_still_trackable() {
        let registry = LargeObjectRegistry::new();
        let p = ClosurePtr::from_raw(8);
        registry.adopt(p, true);
        assert!(registry.flags(p).unwrap().contains(LargeObjectFlags::PINNED));
    }
}
