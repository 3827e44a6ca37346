use core::{
    cell::UnsafeCell,
    fmt,
    ops::Range,
    panic::Location,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::{
    diag::{TaskUsage, leak, walk},
    engine::{Engine, HeapStats},
    error::HeapError,
    lock::{HeapLock, Scheduler, TaskId},
    monitor::{Monitor, Quiet},
    node::{AllocChunk, Chunk, Geometry, NodeRef},
    platform::RegionDesc,
};

/// Answer of an allocation-failure hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaim {
    /// Memory was released elsewhere; try once more.
    Retry,
    /// Add this region to the heap and try once more. The memory must be
    /// valid and unused, exactly as for [`Heap::add_region`].
    Grant(RegionDesc),
    /// Report the allocation as failed.
    GiveUp,
}

/// Called with the failed request size after an allocation found no chunk.
pub type OomHook = fn(usize) -> Reclaim;

/// Called on unrecoverable heap corruption. Must not return.
pub type FaultHandler = fn(HeapError) -> !;

fn panic_on_fault(error: HeapError) -> ! {
    panic!("heap fault: {error}")
}

struct State<S> {
    engine: Engine<S>,
    oom_hook: Option<OomHook>,
}

/// A heap: regions, size-classed free lists and the lock serializing them.
///
/// Every operation takes `&self` and locks internally, so a heap can live in
/// a `static` and be shared by all tasks:
///
/// ```
/// use mmheap::{Heap, Quiet, SingleTask};
///
/// static HEAP: Heap = Heap::new(Quiet, &SingleTask);
///
/// let mut arena = vec![0u8; 4096];
/// unsafe { HEAP.init(arena.as_mut_ptr(), arena.len()).unwrap() };
///
/// let ptr = HEAP.allocate(100).unwrap();
/// let ptr = HEAP.resize(ptr.as_ptr(), 200).unwrap();
/// HEAP.free(ptr.as_ptr());
///
/// assert_eq!(HEAP.stats().used, 0);
/// ```
///
/// Monitor hooks run with the heap lock held and must not call back into
/// the same heap.
pub struct Heap<M: Monitor = Quiet> {
    lock: HeapLock,
    scheduler: &'static dyn Scheduler,
    fault: FaultHandler,
    monitor: M,
    /// Frees that found the lock contended in interrupt context, linked
    /// through their first payload word.
    deferred: AtomicUsize,
    /// Set while a walk hands chunks to caller code. Only touched with the
    /// lock held.
    walking: AtomicBool,
    state: UnsafeCell<State<M::Stamp>>,
}

// All access to `state` happens under `lock`.
unsafe impl<M: Monitor> Sync for Heap<M> {}
unsafe impl<M: Monitor + Send> Send for Heap<M> {}

/// Proof that the calling task holds a heap's lock. Dropping it leaves the
/// lock once.
///
/// Holding a guard across several heap calls makes them atomic with respect
/// to other tasks; the heap's own entry points re-enter the lock.
pub struct HeapGuard<'a, M: Monitor> {
    heap: &'a Heap<M>,
    task: TaskId,
}

impl<M: Monitor> HeapGuard<'_, M> {
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Nesting depth of the lock, this guard included.
    pub fn depth(&self) -> usize {
        self.heap.lock.depth()
    }
}

impl<M: Monitor> Drop for HeapGuard<'_, M> {
    fn drop(&mut self) {
        self.heap.lock.leave(self.task);
    }
}

/// Marks a heap as walking until dropped, unwinding included.
struct Walking<'a>(&'a AtomicBool);

impl<'a> Walking<'a> {
    fn start(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Relaxed);
        Self(flag)
    }
}

impl Drop for Walking<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

impl<M: Monitor> Heap<M> {
    const HEADER: usize = Geometry::<M::Stamp>::HEADER;

    /// Creates an empty heap. Memory is added with [`init`](Self::init) or
    /// [`add_region`](Self::add_region).
    pub const fn new(monitor: M, scheduler: &'static dyn Scheduler) -> Self {
        Self {
            lock: HeapLock::new(),
            scheduler,
            fault: panic_on_fault,
            monitor,
            deferred: AtomicUsize::new(0),
            walking: AtomicBool::new(false),
            state: UnsafeCell::new(State { engine: Engine::new(), oom_hook: None }),
        }
    }

    /// Replaces the default fault handler, which panics.
    pub const fn with_fault_handler(mut self, fault: FaultHandler) -> Self {
        self.fault = fault;
        self
    }

    pub fn monitor(&self) -> &M {
        &self.monitor
    }

    /// Takes the heap lock on behalf of the current task.
    pub fn enter(&self) -> Result<HeapGuard<'_, M>, HeapError> {
        let task = self.lock.enter(self.scheduler)?;
        Ok(HeapGuard { heap: self, task })
    }

    /// Runs `f` on the heap state under the lock, after settling deferred
    /// frees.
    ///
    /// Fails with `WouldBlock` when called from inside a walk callback.
    fn locked<R>(&self, f: impl FnOnce(&mut State<M::Stamp>, TaskId) -> R) -> Result<R, HeapError> {
        let guard = self.enter()?;
        if self.walking.load(Ordering::Relaxed) {
            return Err(HeapError::WouldBlock);
        }
        // The lock is held, hooks never re-enter and walk callbacks are
        // turned away above, so this is the only live reference to the
        // state.
        let state = unsafe { &mut *self.state.get() };

        self.settle_deferred(state);
        Ok(f(state, guard.task))
    }

    /// Like [`locked`](Self::locked) for operations that run caller code
    /// on each chunk. Heap calls made by that code fail as contended.
    fn walked<R>(&self, f: impl FnOnce(&State<M::Stamp>) -> R) -> Result<R, HeapError> {
        self.locked(|state, _| {
            let _walking = Walking::start(&self.walking);
            f(state)
        })
    }

    fn fault(&self, error: HeapError) -> ! {
        log::error!("heap fault: {error}");
        (self.fault)(error)
    }

    /// Makes `[base, base + len)` the first region of an empty heap.
    ///
    /// # Safety
    ///
    /// The memory must be valid for reads and writes, unused by anything
    /// else, and outlive every allocation made from it.
    pub unsafe fn init(&self, base: *mut u8, len: usize) -> Result<(), HeapError> {
        let base = base as usize;
        self.locked(|state, _| {
            if !state.engine.regions().is_empty() {
                return Err(HeapError::InvalidRegion);
            }
            unsafe { state.engine.add_region(base, len) }
        })??;

        log::debug!("heap initialized at {base:#x}, {len} bytes");
        Ok(())
    }

    /// Adds every region of a board memory map, in order.
    ///
    /// # Safety
    ///
    /// See [`init`](Self::init); applies to every region.
    pub unsafe fn init_from(&self, regions: &[RegionDesc]) -> Result<(), HeapError> {
        for region in regions {
            unsafe { self.add_region(region.base as *mut u8, region.size)? };
        }

        Ok(())
    }

    /// Adds a region to the heap and returns its index.
    ///
    /// # Safety
    ///
    /// See [`init`](Self::init).
    pub unsafe fn add_region(&self, base: *mut u8, len: usize) -> Result<usize, HeapError> {
        let base = base as usize;
        let index = self.locked(|state, _| unsafe { state.engine.add_region(base, len) })??;

        log::debug!("heap region {index} added at {base:#x}, {len} bytes");
        Ok(index)
    }

    /// Grows region `index` by `size` bytes located right after its end.
    ///
    /// # Safety
    ///
    /// The new memory must be valid, unused by anything else, and outlive
    /// every allocation made from it.
    pub unsafe fn extend(&self, index: usize, size: usize) -> Result<(), HeapError> {
        self.locked(|state, _| unsafe { state.engine.extend(index, size) })??;

        log::debug!("heap region {index} extended by {size} bytes");
        Ok(())
    }

    /// Installs (or with `None` removes) the allocation-failure hook.
    pub fn set_oom_hook(&self, hook: Option<OomHook>) -> Result<(), HeapError> {
        self.locked(|state, _| state.oom_hook = hook)
    }

    /// Stamps a freshly taken chunk and reports it to the monitor.
    fn hand_out(
        &self,
        node: NodeRef<M::Stamp>,
        task: TaskId,
        caller: &'static Location<'static>,
    ) -> NonNull<u8> {
        let stamp = self.monitor.stamp(task, caller);
        unsafe {
            node.set_stamp(stamp);
            self.monitor.allocated(&stamp, node.size());
        }
        node.payload()
    }

    /// Runs the failure hook. Returns whether another attempt is worth it.
    fn reclaim(&self, size: usize) -> bool {
        let Ok(Some(hook)) = self.locked(|state, _| state.oom_hook) else {
            return false;
        };

        match hook(size) {
            Reclaim::Retry => true,
            Reclaim::Grant(region) => {
                match unsafe { self.add_region(region.base as *mut u8, region.size) } {
                    Ok(_) => true,
                    Err(error) => {
                        log::warn!("region granted for {size} bytes rejected: {error}");
                        false
                    }
                }
            }
            Reclaim::GiveUp => false,
        }
    }

    /// Reports a failed allocation to the log and the monitor.
    pub(crate) fn exhausted(&self, size: usize, caller: &'static Location<'static>) {
        let task = self.scheduler.current();
        let stats = self.stats();

        log::warn!(
            "allocation of {size} bytes failed (task {task}, {caller}): {} bytes free, largest {}",
            stats.free,
            stats.largest_free,
        );
        self.monitor.exhausted(task, size, caller);
    }

    /// One attempt at `take`, without the failure hook.
    fn try_obtain(
        &self,
        caller: &'static Location<'static>,
        mut take: impl FnMut(&mut Engine<M::Stamp>) -> Option<NodeRef<M::Stamp>>,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        self.locked(|state, task| take(&mut state.engine).map(|node| self.hand_out(node, task, caller)))
    }

    /// Takes a chunk with `take`, consulting the failure hook once.
    fn obtain(
        &self,
        size: usize,
        caller: &'static Location<'static>,
        mut take: impl FnMut(&mut Engine<M::Stamp>) -> Option<NodeRef<M::Stamp>>,
    ) -> Option<NonNull<u8>> {
        let mut retried = false;

        loop {
            match self.try_obtain(caller, &mut take) {
                Ok(Some(ptr)) => return Some(ptr),
                Ok(None) => {}
                Err(_) => return None,
            }

            if retried || !self.reclaim(size) {
                break;
            }
            retried = true;
        }

        self.exhausted(size, caller);
        None
    }

    /// Allocation that neither runs the failure hook nor reports a failure.
    pub(crate) fn allocate_quietly(
        &self,
        size: usize,
        caller: &'static Location<'static>,
    ) -> Option<NonNull<u8>> {
        let need = Engine::<M::Stamp>::chunk_size(size)?;
        self.try_obtain(caller, |engine| unsafe { engine.take(need) }).ok().flatten()
    }

    /// Runs the failure hook, then makes one more quiet attempt.
    pub(crate) fn allocate_after_reclaim(
        &self,
        size: usize,
        caller: &'static Location<'static>,
    ) -> Option<NonNull<u8>> {
        if !self.reclaim(size) {
            return None;
        }
        self.allocate_quietly(size, caller)
    }

    /// Allocates at least `size` bytes, aligned to the heap granularity.
    ///
    /// A zero-byte request gets a unique pointer to the smallest chunk.
    /// Returns `None` when no region has room, or when called in interrupt
    /// context while another task holds the lock.
    #[track_caller]
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let caller = Location::caller();
        let Some(need) = Engine::<M::Stamp>::chunk_size(size) else {
            self.exhausted(size, caller);
            return None;
        };

        self.obtain(size, caller, |engine| unsafe { engine.take(need) })
    }

    /// Allocates `count * size` zeroed bytes. `None` also on overflow.
    #[track_caller]
    pub fn zeroed_allocate(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let bytes = count.checked_mul(size)?;
        let ptr = self.allocate(bytes)?;

        unsafe { ptr.as_ptr().write_bytes(0, bytes) };
        Some(ptr)
    }

    /// Allocates `size` bytes at an address that is a multiple of `align`.
    #[track_caller]
    pub fn aligned_allocate(&self, align: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        if !align.is_power_of_two() {
            return Err(HeapError::InvalidAlignment);
        }

        let caller = Location::caller();
        let Some(need) = Engine::<M::Stamp>::chunk_size(size) else {
            self.exhausted(size, caller);
            return Err(HeapError::OutOfMemory);
        };

        self.obtain(size, caller, |engine| unsafe { engine.take_aligned(need, align) })
            .ok_or(HeapError::OutOfMemory)
    }

    fn release(&self, state: &mut State<M::Stamp>, ptr: usize) -> Result<(), HeapError> {
        let node = state.engine.lookup(ptr)?;

        unsafe {
            let stamp = node.stamp();
            let size = node.size();
            state.engine.give_back(node);
            self.monitor.freed(&stamp, size);
        }

        Ok(())
    }

    /// Frees an allocation. Null is ignored.
    ///
    /// A pointer this heap did not hand out, or one freed already, is a
    /// fault: the fault handler runs and this call does not return.
    pub fn free(&self, ptr: *mut u8) {
        if let Err(error) = self.try_free(ptr) {
            self.fault(error);
        }
    }

    /// Like [`free`](Self::free), reporting faults to the caller instead.
    ///
    /// In interrupt context with the lock held elsewhere, the free is
    /// deferred to the next operation that takes the lock.
    pub fn try_free(&self, ptr: *mut u8) -> Result<(), HeapError> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(());
        };

        match self.locked(|state, _| self.release(state, ptr.as_ptr() as usize)) {
            Ok(result) => result,
            Err(HeapError::WouldBlock) => {
                self.defer(ptr);
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    fn defer(&self, ptr: NonNull<u8>) {
        let link = ptr.as_ptr().cast::<usize>();
        let mut head = self.deferred.load(Ordering::Relaxed);

        loop {
            // Payloads are granularity-aligned and at least a word long.
            unsafe { link.write(head) };
            match self.deferred.compare_exchange_weak(
                head,
                link as usize,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    fn settle_deferred(&self, state: &mut State<M::Stamp>) {
        let mut next = self.deferred.swap(0, Ordering::Acquire);

        while next != 0 {
            let ptr = next;
            next = unsafe { (ptr as *const usize).read() };
            if let Err(error) = self.release(state, ptr) {
                self.fault(error);
            }
        }
    }

    /// Resizes an allocation, moving it when it cannot grow where it is.
    ///
    /// Null behaves as [`allocate`](Self::allocate); a size of zero frees
    /// the allocation and returns `None`. On failure the old allocation is
    /// left untouched.
    #[track_caller]
    pub fn resize(&self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
        let Some(old) = NonNull::new(ptr) else {
            return self.allocate(size);
        };
        if size == 0 {
            self.free(ptr);
            return None;
        }

        let caller = Location::caller();
        let Some(need) = Engine::<M::Stamp>::chunk_size(size) else {
            self.exhausted(size, caller);
            return None;
        };

        let mut retried = false;
        loop {
            let moved = self.locked(|state, task| -> Result<Option<NonNull<u8>>, HeapError> {
                let engine = &mut state.engine;
                let node = engine.lookup(old.as_ptr() as usize)?;

                unsafe {
                    let stamp = node.stamp();
                    let old_size = node.size();
                    let keep = old_size - Self::HEADER;

                    let resized = if need <= old_size {
                        engine.trim(node, need);
                        Some(node)
                    } else if engine.grow_in_place(node, need) {
                        Some(node)
                    } else if let Some(prev) = engine.grow_backward(node, need, keep) {
                        Some(prev)
                    } else if let Some(new) = engine.take(need) {
                        // Growing, so the old payload is the shorter one.
                        ptr::copy_nonoverlapping(node.payload().as_ptr(), new.payload().as_ptr(), keep);
                        engine.give_back(node);
                        Some(new)
                    } else {
                        None
                    };

                    Ok(resized.map(|node| {
                        self.monitor.freed(&stamp, old_size);
                        self.hand_out(node, task, caller)
                    }))
                }
            });

            match moved {
                Ok(Ok(Some(ptr))) => return Some(ptr),
                Ok(Ok(None)) => {}
                Ok(Err(error)) => self.fault(error),
                Err(_) => return None,
            }

            if retried || !self.reclaim(size) {
                break;
            }
            retried = true;
        }

        self.exhausted(size, caller);
        None
    }

    /// Payload bytes usable behind `ptr`, at least what was requested.
    /// Zero for null.
    pub fn usable_size(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }

        match self.locked(|state, _| state.engine.lookup(ptr as usize)) {
            Ok(Ok(node)) => unsafe { node.size() - Self::HEADER },
            Ok(Err(error)) => self.fault(error),
            Err(_) => 0,
        }
    }

    /// Whether `ptr` lies inside one of this heap's regions.
    pub fn is_member(&self, ptr: *const u8) -> bool {
        self.locked(|state, _| state.engine.is_member(ptr as usize)).unwrap_or(false)
    }

    /// Usage summary. All zero when the lock cannot be taken.
    pub fn stats(&self) -> HeapStats {
        self.locked(|state, _| state.engine.stats()).unwrap_or_default()
    }

    /// Validates every chunk header, the sentinels, the free lists and the
    /// byte accounting.
    pub fn check_corruption(&self) -> Result<(), HeapError> {
        self.locked(|state, _| state.engine.check())?
    }

    /// Visits every chunk in address order, region by region.
    ///
    /// `f` runs with the heap lock held. Allocations it makes from this heap
    /// fail, its frees are deferred until the walk ends, and queries see an
    /// unavailable heap.
    pub fn walk(&self, f: impl FnMut(Chunk<M::Stamp>)) -> Result<(), HeapError> {
        self.walked(|state| state.engine.walk(f))
    }

    /// Writes one line per live allocation, then a summary line.
    ///
    /// `out` is written with the heap lock held, as for [`walk`](Self::walk):
    /// a writer that needs memory from this heap fails with `fmt::Error`.
    pub fn dump_live_allocations(&self, out: &mut impl fmt::Write) -> fmt::Result {
        self.walked(|state| walk::dump_live::<M>(&state.engine, out))
            .map_err(|_| fmt::Error)?
    }

    /// Usage of `task`, if the monitor accounts per task.
    pub fn per_task_usage(&self, task: TaskId) -> Option<TaskUsage> {
        self.monitor.usage(task)
    }

    /// Restarts peak tracking, heap-wide and per task, from current usage.
    pub fn reset_peaks(&self) {
        if self.locked(|state, _| state.engine.reset_peak()).is_ok() {
            self.monitor.reset_peaks();
        }
    }

    /// Reports allocations that no word of `roots`, nor of any allocation
    /// reachable from them, points into. Returns how many were found.
    ///
    /// `marks` needs one byte per live allocation, otherwise the scan
    /// fails with [`HeapError::OutOfMemory`].
    ///
    /// `on_leak` runs with the heap lock held, as for [`walk`](Self::walk).
    ///
    /// # Safety
    ///
    /// Every root range must be readable.
    pub unsafe fn leak_check(
        &self,
        roots: &[Range<usize>],
        marks: &mut [u8],
        on_leak: impl FnMut(&AllocChunk<M::Stamp>),
    ) -> Result<usize, HeapError> {
        self.walked(|state| unsafe { leak::leak_check(&state.engine, roots, marks, on_leak) })?
    }

    /// Empties the heap and hands every region back through `f`, as it was
    /// originally given. Outstanding allocations become dangling.
    pub fn teardown(&self, mut f: impl FnMut(RegionDesc)) -> Result<(), HeapError> {
        let regions = self.locked(|state, _| state.engine.clear())?;

        for region in regions.as_slice() {
            log::debug!("heap region at {:#x} released, {} bytes", region.base, region.len);
            f(RegionDesc::new(region.base, region.len));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::SingleTask;

    #[repr(align(4096))]
    struct Arena([u8; 4096]);

    fn arena() -> Box<Arena> {
        Box::new(Arena([0; 4096]))
    }

    struct Interrupt;

    impl Scheduler for Interrupt {
        fn current(&self) -> TaskId {
            TaskId(1)
        }

        fn in_interrupt(&self) -> bool {
            true
        }
    }

    #[test]
    fn init_only_once() {
        let heap: Heap = Heap::new(Quiet, &SingleTask);
        let mut first = arena();
        let mut second = arena();

        unsafe {
            heap.init(first.0.as_mut_ptr(), 4096).unwrap();
            assert_eq!(heap.init(second.0.as_mut_ptr(), 4096), Err(HeapError::InvalidRegion));
            assert_eq!(heap.add_region(second.0.as_mut_ptr(), 4096), Ok(1));
        }
    }

    #[test]
    fn guard_nests_with_heap_calls() {
        let heap: Heap = Heap::new(Quiet, &SingleTask);
        let mut memory = arena();
        unsafe { heap.init(memory.0.as_mut_ptr(), 4096).unwrap() };

        let guard = heap.enter().unwrap();
        let ptr = heap.allocate(32).unwrap();
        assert_eq!(guard.depth(), 1);
        heap.free(ptr.as_ptr());
        drop(guard);

        assert_eq!(heap.lock.holder(), None);
    }

    #[test]
    fn contended_free_in_interrupt_is_deferred() {
        let heap: Heap = Heap::new(Quiet, &Interrupt);
        let mut memory = arena();
        unsafe { heap.init(memory.0.as_mut_ptr(), 4096).unwrap() };

        let ptr = heap.allocate(64).unwrap();
        let used = heap.stats().used;
        assert!(used > 0);

        assert!(heap.lock.try_enter(TaskId(7)));
        assert!(heap.allocate(16).is_none());
        heap.free(ptr.as_ptr());
        heap.lock.leave(TaskId(7));

        assert_eq!(heap.stats().used, 0);
        heap.check_corruption().unwrap();
    }

    #[test]
    fn walk_callback_cannot_reenter() {
        let heap: Heap = Heap::new(Quiet, &SingleTask);
        let mut memory = arena();
        unsafe { heap.init(memory.0.as_mut_ptr(), 4096).unwrap() };

        let ptr = heap.allocate(64).unwrap();
        let mut seen = 0;
        let mut nested = None;

        heap.walk(|_| {
            seen += 1;
            if seen == 1 {
                nested = Some(heap.allocate(100));
                heap.free(ptr.as_ptr());
                assert_eq!(heap.stats(), HeapStats::default());
            }
        })
        .unwrap();

        assert_eq!(seen, 2);
        assert_eq!(nested, Some(None));

        // The free made during the walk lands afterwards.
        let stats = heap.stats();
        assert_eq!((stats.used, stats.free_chunks), (0, 1));
        heap.check_corruption().unwrap();
        assert!(heap.allocate(100).is_some());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_faults() {
        let heap: Heap = Heap::new(Quiet, &SingleTask);
        let mut memory = arena();
        unsafe { heap.init(memory.0.as_mut_ptr(), 4096).unwrap() };

        let a = heap.allocate(64).unwrap();
        let _b = heap.allocate(64).unwrap();
        heap.free(a.as_ptr());
        heap.free(a.as_ptr());
    }

    #[test]
    fn oom_hook_grants_memory() {
        static mut SPARE: Arena = Arena([0; 4096]);

        fn grant(_size: usize) -> Reclaim {
            let base = unsafe { (&raw mut SPARE) as usize };
            Reclaim::Grant(RegionDesc::new(base, 4096))
        }

        let heap: Heap = Heap::new(Quiet, &SingleTask);
        let mut memory = arena();
        unsafe { heap.init(memory.0.as_mut_ptr(), 4096).unwrap() };
        heap.set_oom_hook(Some(grant)).unwrap();

        let first = heap.allocate(3000).unwrap();
        let second = heap.allocate(3000).unwrap();
        assert!(heap.is_member(first.as_ptr()) && heap.is_member(second.as_ptr()));

        let stats = heap.stats();
        assert_eq!(stats.total, 2 * (4096 - 2 * Geometry::<()>::GRAN));
        assert_eq!(stats.alloc_chunks, 2);
        heap.check_corruption().unwrap();
    }

    #[test]
    fn failed_resize_keeps_old_allocation() {
        let heap: Heap = Heap::new(Quiet, &SingleTask);
        let mut memory = arena();
        unsafe { heap.init(memory.0.as_mut_ptr(), 4096).unwrap() };

        let ptr = heap.allocate(100).unwrap();
        unsafe { ptr.as_ptr().write_bytes(0x11, 100) };

        assert!(heap.resize(ptr.as_ptr(), 8192).is_none());
        assert_eq!(unsafe { *ptr.as_ptr().add(99) }, 0x11);
        assert_eq!(heap.stats().alloc_chunks, 1);
    }
}
