//! Cooperative cancellation for long-running operations: wiping
//! free space, sorting a directory's cluster layout, and merging a
//! differencing chain all call back periodically so a caller can report
//! progress and ask the operation to stop early.

use std::ops::ControlFlow;

/// Reported after each unit of work (a cluster wiped, a file moved). The
/// operation checks the returned `ControlFlow` and stops as soon as
/// `ControlFlow::Break` comes back, leaving whatever it touched in a
/// consistent (if incomplete) state.
pub trait Progress {
    /// `done` and `total` are in whatever unit the calling operation counts
    /// in (clusters for wipe, entries for sort, blocks for merge).
    fn report(&mut self, done: u64, total: u64) -> ControlFlow<()>;
}

/// A no-op progress sink for callers that don't need cancellation or
/// reporting.
pub struct NullProgress;

impl Progress for NullProgress {
    fn report(&mut self, _done: u64, _total: u64) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

impl<F: FnMut(u64, u64) -> ControlFlow<()>> Progress for F {
    fn report(&mut self, done: u64, total: u64) -> ControlFlow<()> {
        self(done, total)
    }
}

pub(crate) fn check(flow: ControlFlow<()>) -> crate::error::Result<()> {
    match flow {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(()) => Err(crate::error::Error::Cancelled),
    }
}
