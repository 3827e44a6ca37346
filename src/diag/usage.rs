use core::panic::Location;

use spin::Mutex;

use crate::{config::MAX_TASKS, lock::TaskId, monitor::Monitor};

/// Stamp written by [`Recorder`] into every allocated chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocTag {
    /// Where the allocation was requested.
    pub caller: &'static Location<'static>,
    /// Task the allocation is charged to.
    pub owner: TaskId,
}

/// Heap consumption of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskUsage {
    pub task: TaskId,
    /// Bytes currently allocated, headers included.
    pub current: usize,
    /// Highest value of `current` since the last peak reset.
    pub peak: usize,
    /// Live allocations.
    pub allocations: usize,
    /// Allocations that failed for lack of memory.
    pub failures: usize,
}

impl TaskUsage {
    const fn new(task: TaskId) -> Self {
        Self { task, current: 0, peak: 0, allocations: 0, failures: 0 }
    }
}

struct TaskTable {
    slots: [Option<TaskUsage>; MAX_TASKS],
    /// Bytes charged to tasks that found the table full.
    untracked: usize,
}

impl TaskTable {
    fn entry(&mut self, task: TaskId) -> Option<&mut TaskUsage> {
        let index = match self.slots.iter().position(|slot| slot.is_some_and(|u| u.task == task)) {
            Some(index) => index,
            None => {
                let index = self.slots.iter().position(Option::is_none)?;
                self.slots[index] = Some(TaskUsage::new(task));
                index
            }
        };

        self.slots[index].as_mut()
    }

    fn find(&mut self, task: TaskId) -> Option<&mut TaskUsage> {
        self.slots.iter_mut().flatten().find(|usage| usage.task == task)
    }
}

/// Monitor accounting heap usage per task and tagging every allocation with
/// its owner and call site.
///
/// ```
/// use mmheap::{Heap, Recorder, SingleTask, TaskId};
///
/// static RECORDER: Recorder = Recorder::new();
/// static HEAP: Heap<&Recorder> = Heap::new(&RECORDER, &SingleTask);
///
/// let mut arena = vec![0u8; 4096];
/// unsafe { HEAP.init(arena.as_mut_ptr(), arena.len()).unwrap() };
///
/// let ptr = HEAP.allocate(100).unwrap();
/// assert_eq!(RECORDER.usage(TaskId(0)).unwrap().allocations, 1);
/// HEAP.free(ptr.as_ptr());
/// assert_eq!(RECORDER.usage(TaskId(0)).unwrap().current, 0);
/// ```
///
/// A task keeps its slot once it allocated; when all [`MAX_TASKS`] slots
/// are taken, further tasks are accounted in bulk (see
/// [`untracked`](Self::untracked)).
pub struct Recorder {
    table: Mutex<TaskTable>,
}

impl Recorder {
    pub const fn new() -> Self {
        Self {
            table: Mutex::new(TaskTable { slots: [None; MAX_TASKS], untracked: 0 }),
        }
    }

    /// Usage of `task`, if it ever allocated.
    pub fn usage(&self, task: TaskId) -> Option<TaskUsage> {
        self.table.lock().find(task).copied()
    }

    /// Calls `f` with the usage of every tracked task.
    pub fn for_each_task(&self, mut f: impl FnMut(&TaskUsage)) {
        let table = self.table.lock();
        table.slots.iter().flatten().for_each(|usage| f(usage));
    }

    /// Bytes allocated by tasks that did not get a slot.
    pub fn untracked(&self) -> usize {
        self.table.lock().untracked
    }

    /// Drops the slots of tasks without live allocations, e.g. after they
    /// exited.
    pub fn forget_idle(&self) {
        let mut table = self.table.lock();
        for slot in table.slots.iter_mut() {
            if slot.is_some_and(|usage| usage.allocations == 0) {
                *slot = None;
            }
        }
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor for Recorder {
    type Stamp = AllocTag;

    fn stamp(&self, owner: TaskId, caller: &'static Location<'static>) -> AllocTag {
        AllocTag { caller, owner }
    }

    fn allocated(&self, stamp: &AllocTag, size: usize) {
        let mut table = self.table.lock();
        match table.entry(stamp.owner) {
            Some(usage) => {
                usage.current += size;
                usage.peak = usage.peak.max(usage.current);
                usage.allocations += 1;
            }
            None => table.untracked += size,
        }
    }

    fn freed(&self, stamp: &AllocTag, size: usize) {
        let mut table = self.table.lock();
        match table.find(stamp.owner) {
            Some(usage) => {
                usage.current = usage.current.saturating_sub(size);
                usage.allocations = usage.allocations.saturating_sub(1);
            }
            None => table.untracked = table.untracked.saturating_sub(size),
        }
    }

    fn exhausted(&self, owner: TaskId, _size: usize, _caller: &'static Location<'static>) {
        if let Some(usage) = self.table.lock().entry(owner) {
            usage.failures += 1;
        }
    }

    fn owner(stamp: &AllocTag) -> Option<TaskId> {
        Some(stamp.owner)
    }

    fn caller(stamp: &AllocTag) -> Option<&'static Location<'static>> {
        Some(stamp.caller)
    }

    fn usage(&self, task: TaskId) -> Option<TaskUsage> {
        Recorder::usage(self, task)
    }

    fn reset_peaks(&self) {
        let mut table = self.table.lock();
        for usage in table.slots.iter_mut().flatten() {
            usage.peak = usage.current;
        }
    }
}
