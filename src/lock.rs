//! Heap locking.
//!
//! A heap is serialized by a counted lock: the holding task may enter again
//! (from a destructor run mid-free, a signal handler, a monitor hook) and
//! has to leave as many times as it entered. Blocking itself is delegated to
//! the [`Scheduler`], which is the kernel's business, not the allocator's.

use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::error::HeapError;

/// Identity of the task an allocation is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the heap needs to know about the running task.
pub trait Scheduler: Sync {
    /// Task on whose behalf the caller runs.
    fn current(&self) -> TaskId;

    /// Whether the caller runs in interrupt context, where it must not
    /// wait for the heap lock.
    fn in_interrupt(&self) -> bool {
        false
    }

    /// Called while the heap lock is held by another task. A kernel
    /// suspends the caller here; the default just spins.
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

/// Scheduler of a system with a single thread of execution.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleTask;

impl Scheduler for SingleTask {
    fn current(&self) -> TaskId {
        TaskId(0)
    }
}

/// Scheduler mapping every host thread to its own task id.
#[cfg(feature = "std")]
#[derive(Debug, Default, Clone, Copy)]
pub struct HostThreads;

#[cfg(feature = "std")]
impl Scheduler for HostThreads {
    fn current(&self) -> TaskId {
        use core::sync::atomic::AtomicU32;

        static NEXT: AtomicU32 = AtomicU32::new(1);

        std::thread_local! {
            static ID: u32 = NEXT.fetch_add(1, Ordering::Relaxed);
        }

        TaskId(ID.with(|id| *id))
    }

    fn relax(&self) {
        std::thread::yield_now();
    }
}

const UNHELD: usize = usize::MAX;

/// Counted lock: owner plus nesting depth.
pub struct HeapLock {
    holder: AtomicUsize,
    depth: AtomicUsize,
}

impl HeapLock {
    pub const fn new() -> Self {
        Self {
            holder: AtomicUsize::new(UNHELD),
            depth: AtomicUsize::new(0),
        }
    }

    /// Enters without waiting. Succeeds if the lock is free or already
    /// held by `task`.
    pub fn try_enter(&self, task: TaskId) -> bool {
        let me = task.0 as usize;

        if self.holder.load(Ordering::Acquire) == me {
            // Only the holder touches the depth while it holds the lock.
            self.depth.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        if self
            .holder
            .compare_exchange(UNHELD, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.depth.store(1, Ordering::Relaxed);
            return true;
        }

        false
    }

    /// Enters, waiting through `scheduler` while another task holds the
    /// lock. In interrupt context a contended lock is reported as
    /// [`HeapError::WouldBlock`] instead.
    pub fn enter(&self, scheduler: &dyn Scheduler) -> Result<TaskId, HeapError> {
        let task = scheduler.current();

        while !self.try_enter(task) {
            if scheduler.in_interrupt() {
                return Err(HeapError::WouldBlock);
            }
            scheduler.relax();
        }

        Ok(task)
    }

    /// Leaves once. The lock is released when the depth drops to zero.
    pub fn leave(&self, task: TaskId) {
        debug_assert_eq!(self.holder(), Some(task), "heap lock left by a non-holder");

        if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.holder.store(UNHELD, Ordering::Release);
        }
    }

    /// Task currently holding the lock.
    pub fn holder(&self) -> Option<TaskId> {
        match self.holder.load(Ordering::Acquire) {
            UNHELD => None,
            id => Some(TaskId(id as u32)),
        }
    }

    /// Nesting depth of the current holder, zero when unheld.
    pub fn depth(&self) -> usize {
        if self.holder().is_some() {
            self.depth.load(Ordering::Relaxed)
        } else {
            0
        }
    }
}

impl Default for HeapLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicBool;

    struct Irq(AtomicBool);

    impl Scheduler for Irq {
        fn current(&self) -> TaskId {
            TaskId(9)
        }

        fn in_interrupt(&self) -> bool {
            self.0.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn reentrant_for_holder() {
        let lock = HeapLock::new();
        let me = TaskId(3);

        assert!(lock.try_enter(me));
        assert!(lock.try_enter(me));
        assert_eq!(lock.depth(), 2);

        lock.leave(me);
        assert_eq!(lock.holder(), Some(me));
        lock.leave(me);
        assert_eq!(lock.holder(), None);
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn other_task_is_excluded() {
        let lock = HeapLock::new();

        assert!(lock.try_enter(TaskId(1)));
        assert!(!lock.try_enter(TaskId(2)));
        lock.leave(TaskId(1));
        assert!(lock.try_enter(TaskId(2)));
        lock.leave(TaskId(2));
    }

    #[test]
    fn interrupt_context_does_not_wait() {
        let lock = HeapLock::new();
        let irq = Irq(AtomicBool::new(true));

        assert!(lock.try_enter(TaskId(1)));
        assert_eq!(lock.enter(&irq), Err(HeapError::WouldBlock));
        lock.leave(TaskId(1));

        assert_eq!(lock.enter(&irq), Ok(TaskId(9)));
        lock.leave(TaskId(9));
    }

    #[cfg(feature = "std")]
    #[test]
    fn host_threads_get_distinct_ids() {
        let main = HostThreads.current();
        let other = std::thread::spawn(|| HostThreads.current()).join().unwrap();

        assert_ne!(main, other);
        assert_eq!(main, HostThreads.current());
    }

    #[cfg(feature = "std")]
    #[test]
    fn contended_lock_waits_for_release() {
        use std::sync::Arc;

        let lock = Arc::new(HeapLock::new());
        let me = lock.enter(&HostThreads).unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                let task = lock.enter(&HostThreads).unwrap();
                lock.leave(task);
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(10));
        lock.leave(me);
        waiter.join().unwrap();
        assert_eq!(lock.holder(), None);
    }
}
