//! Error handling for the concurrent mark phase.
//!
//! Structural corruption of the heap under mark — an info-table the closure
//! tracer does not recognise, a forwarding pointer inside the nonmoving
//! generation, a stack frame with an impossible bitmap — is not modelled as
//! an `Error` here: those conditions panic, matching the halt-the-runtime
//! posture expected of a collector that finds its own data structures
//! inconsistent. [`Error`] is reserved for conditions a host runtime can
//! reasonably observe and report: lock poisoning and misuse of the
//! flush/sync protocol.

use std::sync::PoisonError;

/// Mark-phase result type.
///
/// This is a type alias for the standard library's [`Result`](core::result::Result) type with the
/// error type defaulting to [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors that can occur while driving the mark phase.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A mutex or condvar guarding shared mark state was poisoned by a
    /// panicking holder.
    #[error("mark state lock poisoned: {0}")]
    LockError(String),
    /// A flush/sync call was made outside of its expected protocol state,
    /// e.g. `finish_flush` called before `wait_for_flush` observed every
    /// worker's update remembered set land.
    #[error("flush/sync protocol violation: {0}")]
    ProtocolError(String),
    /// A worker pushed to its update remembered set before
    /// `init_upd_rem_set` ran for the current cycle.
    #[error("update remembered set not initialized for this cycle: {0}")]
    UpdRemSetError(String),
    /// Statistics counters could not be read or updated.
    #[error("failed to access mark statistics: {0}")]
    StatsError(String),
}

impl<T> From<PoisonError<T>> for Error {
    fn from(error: PoisonError<T>) -> Self {
        Error::LockError(format!("poisoned lock: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_poison_error() {
        let poison_error: PoisonError<()> = PoisonError::new(());
        let error: Error = poison_error.into();
        assert!(matches!(error, Error::LockError(_)));
    }
}
