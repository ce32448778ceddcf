//! Configuration and statistics for the concurrent mark phase.

/// Mark queue block capacity, measured in entries.
///
/// Chosen to keep a block at a few kilobytes, the same sizing tradeoff made
/// for the underlying bdescr-backed block allocator this module is designed
/// to sit on top of.
pub const MARK_QUEUE_BLOCK_ENTRIES: usize = 256;

/// Configuration for a mark cycle.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Number of mutator worker threads expected to hold an update
    /// remembered set during this cycle.
    pub workers: usize,
    /// Mark queue block capacity, in entries. Exposed for tests that want
    /// to exercise block-chain growth with a small number of pushes.
    pub block_entries: usize,
    /// Whether to busy-wait (spinning) rather than yield while a worker
    /// contends for the claim token on a `STACK` closure already being
    /// marked by another thread.
    pub busy_wait_on_stack_claim: bool,
}

impl Default for Configuration {
    /// Creates a default configuration for a mark cycle.
    ///
    /// `workers` defaults to `0`, meaning "unknown until the coordinator
    /// tells us", since the number of live capabilities is a scheduler
    /// concern outside this crate.
    fn default() -> Self {
        Self {
            workers: 0,
            block_entries: MARK_QUEUE_BLOCK_ENTRIES,
            busy_wait_on_stack_claim: true,
        }
    }
}

/// Statistics about a mark cycle's progress.
#[derive(Clone, Debug, Default)]
pub struct Statistics {
    /// Current mark epoch, incremented once per cycle.
    pub epoch: u8,
    /// Closures the tracer has dispatched on and traced this cycle.
    pub objects_marked: usize,
    /// Large objects moved from the unmarked to the marked partition.
    pub large_objects_marked: usize,
    /// Entries flushed from per-worker update remembered sets into the
    /// global list.
    pub upd_rem_set_entries_flushed: usize,
    /// Number of times `begin_flush`/`wait_for_flush`/`finish_flush` ran
    /// to synchronize with mutators mid-cycle.
    pub flush_syncs: usize,
    /// Dead weak pointers finalized during post-mark reconciliation.
    pub weaks_finalized: usize,
    /// Threads resurrected because a dead weak pointer's finalizer
    /// reached them.
    pub threads_resurrected: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration() {
        let config = Configuration::default();
        assert_eq!(config.workers, 0);
        assert_eq!(config.block_entries, MARK_QUEUE_BLOCK_ENTRIES);
        assert!(config.busy_wait_on_stack_claim);
    }

    #[test]
    fn default_statistics() {
        let stats = Statistics::default();
        assert_eq!(stats.epoch, 0);
        assert_eq!(stats.objects_marked, 0);
        assert_eq!(stats.large_objects_marked, 0);
        assert_eq!(stats.upd_rem_set_entries_flushed, 0);
        assert_eq!(stats.flush_syncs, 0);
        assert_eq!(stats.weaks_finalized, 0);
        assert_eq!(stats.threads_resurrected, 0);
    }
}
