//! Pluggable allocation diagnostics.
//!
//! A heap reports every allocate and free to its [`Monitor`]. The monitor
//! also chooses a per-allocation `Stamp` that is stored inside each
//! allocated chunk header, so diagnostics cost header space only when a
//! monitor actually records something. [`Quiet`] stamps nothing and
//! observes nothing.

use core::panic::Location;

use crate::{diag::TaskUsage, lock::TaskId};

/// Observer of the allocation and free paths of a heap.
///
/// Hooks run with the heap lock held and must not allocate from the heap
/// they observe.
pub trait Monitor: Sync {
    /// Data kept in the header of every allocated chunk.
    type Stamp: Copy;

    /// Builds the stamp of a new allocation.
    fn stamp(&self, owner: TaskId, caller: &'static Location<'static>) -> Self::Stamp;

    /// A chunk of `size` bytes, header included, was handed out.
    fn allocated(&self, _stamp: &Self::Stamp, _size: usize) {}

    /// A chunk of `size` bytes, header included, was given back.
    fn freed(&self, _stamp: &Self::Stamp, _size: usize) {}

    /// An allocation of `size` bytes failed. Runs after the heap lock was
    /// released.
    fn exhausted(&self, _owner: TaskId, _size: usize, _caller: &'static Location<'static>) {}

    /// Task a stamp charges the allocation to, if it records one.
    fn owner(_stamp: &Self::Stamp) -> Option<TaskId> {
        None
    }

    /// Source location a stamp records, if any.
    fn caller(_stamp: &Self::Stamp) -> Option<&'static Location<'static>> {
        None
    }

    /// Current usage of `task`, if this monitor accounts per task.
    fn usage(&self, _task: TaskId) -> Option<TaskUsage> {
        None
    }

    /// Restarts peak tracking from the current usage.
    fn reset_peaks(&self) {}
}

/// Monitor that records nothing; the default of every heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct Quiet;

impl Monitor for Quiet {
    type Stamp = ();

    #[inline(always)]
    fn stamp(&self, _owner: TaskId, _caller: &'static Location<'static>) {}
}

/// A shared monitor, e.g. one usage table behind several heaps.
impl<M: Monitor> Monitor for &M {
    type Stamp = M::Stamp;

    #[inline]
    fn stamp(&self, owner: TaskId, caller: &'static Location<'static>) -> Self::Stamp {
        (**self).stamp(owner, caller)
    }

    #[inline]
    fn allocated(&self, stamp: &Self::Stamp, size: usize) {
        (**self).allocated(stamp, size)
    }

    #[inline]
    fn freed(&self, stamp: &Self::Stamp, size: usize) {
        (**self).freed(stamp, size)
    }

    fn exhausted(&self, owner: TaskId, size: usize, caller: &'static Location<'static>) {
        (**self).exhausted(owner, size, caller)
    }

    fn owner(stamp: &Self::Stamp) -> Option<TaskId> {
        M::owner(stamp)
    }

    fn caller(stamp: &Self::Stamp) -> Option<&'static Location<'static>> {
        M::caller(stamp)
    }

    fn usage(&self, task: TaskId) -> Option<TaskUsage> {
        (**self).usage(task)
    }

    fn reset_peaks(&self) {
        (**self).reset_peaks()
    }
}
