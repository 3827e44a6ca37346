use core::{panic::Location, ptr::NonNull};

use crate::{
    config::{MAX_APP_HEAPS, MAX_KERNEL_HEAPS},
    error::HeapError,
    heap::Heap,
    monitor::{Monitor, Quiet},
};

/// The heaps of a system: a few kernel heaps addressed by index and named
/// per-application heaps.
///
/// Board bring-up creates the heaps, registers their regions, then
/// registers the heaps here before anything allocates through the registry.
/// Code that only holds a pointer uses [`heap_for_address`] or [`free`] to
/// find where it came from.
///
/// [`heap_for_address`]: Self::heap_for_address
/// [`free`]: Self::free
pub struct HeapRegistry<'a, M: Monitor = Quiet> {
    kernel: [Option<&'a Heap<M>>; MAX_KERNEL_HEAPS],
    apps: [Option<(&'a str, &'a Heap<M>)>; MAX_APP_HEAPS],
}

impl<'a, M: Monitor> HeapRegistry<'a, M> {
    pub const fn new() -> Self {
        Self {
            kernel: [None; MAX_KERNEL_HEAPS],
            apps: [None; MAX_APP_HEAPS],
        }
    }

    /// Registers a kernel heap and returns its index.
    pub fn add_kernel(&mut self, heap: &'a Heap<M>) -> Result<usize, HeapError> {
        let index = self
            .kernel
            .iter()
            .position(Option::is_none)
            .ok_or(HeapError::RegistryFull)?;

        self.kernel[index] = Some(heap);
        Ok(index)
    }

    pub fn kernel(&self, index: usize) -> Option<&'a Heap<M>> {
        self.kernel.get(index).copied().flatten()
    }

    /// Registers the heap of application `name`, replacing a previous heap
    /// of the same name.
    pub fn add_app(&mut self, name: &'a str, heap: &'a Heap<M>) -> Result<(), HeapError> {
        let slot = match self.apps.iter().position(|app| app.is_some_and(|(n, _)| n == name)) {
            Some(index) => index,
            None => self
                .apps
                .iter()
                .position(Option::is_none)
                .ok_or(HeapError::RegistryFull)?,
        };

        self.apps[slot] = Some((name, heap));
        Ok(())
    }

    /// Unregisters the heap of application `name`, typically right before
    /// tearing it down.
    pub fn remove_app(&mut self, name: &str) -> Option<&'a Heap<M>> {
        let slot = self.apps.iter_mut().find(|app| app.is_some_and(|(n, _)| n == name))?;
        slot.take().map(|(_, heap)| heap)
    }

    pub fn app(&self, name: &str) -> Option<&'a Heap<M>> {
        self.apps
            .iter()
            .flatten()
            .find(|(n, _)| *n == name)
            .map(|&(_, heap)| heap)
    }

    fn heaps(&self) -> impl Iterator<Item = &'a Heap<M>> + '_ {
        let kernel = self.kernel.iter().flatten().copied();
        let apps = self.apps.iter().flatten().map(|&(_, heap)| heap);
        kernel.chain(apps)
    }

    /// Heap owning `ptr`, kernel heaps first.
    pub fn heap_for_address(&self, ptr: *const u8) -> Option<&'a Heap<M>> {
        self.heaps().find(|heap| heap.is_member(ptr))
    }

    /// Allocates from the first kernel heap with room.
    ///
    /// Failure hooks only run once no kernel heap has room as it stands, and
    /// the failure is reported to every kernel heap only when all of them
    /// still fail afterwards.
    #[track_caller]
    pub fn kernel_allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let caller = Location::caller();
        let heaps = || self.kernel.iter().flatten();

        heaps()
            .find_map(|heap| heap.allocate_quietly(size, caller))
            .or_else(|| heaps().find_map(|heap| heap.allocate_after_reclaim(size, caller)))
            .or_else(|| {
                heaps().for_each(|heap| heap.exhausted(size, caller));
                None
            })
    }

    /// Frees `ptr` into whichever registered heap owns it.
    pub fn free(&self, ptr: *mut u8) -> Result<(), HeapError> {
        if ptr.is_null() {
            return Ok(());
        }

        let heap = self
            .heap_for_address(ptr)
            .ok_or(HeapError::NotMember { addr: ptr as usize })?;
        heap.try_free(ptr)
    }
}

impl<M: Monitor> Default for HeapRegistry<'_, M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::SingleTask;

    #[repr(align(4096))]
    struct Arena([u8; 4096]);

    fn heap_with(arena: &mut Arena) -> Heap {
        let heap = Heap::new(Quiet, &SingleTask);
        unsafe { heap.init(arena.0.as_mut_ptr(), 4096).unwrap() };
        heap
    }

    #[test]
    fn routes_free_to_owner() {
        let mut a = Box::new(Arena([0; 4096]));
        let mut b = Box::new(Arena([0; 4096]));
        let kernel = heap_with(&mut a);
        let app = heap_with(&mut b);

        let mut registry = HeapRegistry::new();
        assert_eq!(registry.add_kernel(&kernel), Ok(0));
        registry.add_app("init", &app).unwrap();

        let ptr = app.allocate(40).unwrap();
        assert!(core::ptr::eq(registry.heap_for_address(ptr.as_ptr()).unwrap(), &app));

        registry.free(ptr.as_ptr()).unwrap();
        assert_eq!(app.stats().used, 0);

        let stray = 0x10 as *mut u8;
        assert_eq!(registry.free(stray), Err(HeapError::NotMember { addr: 0x10 }));
        assert_eq!(registry.free(core::ptr::null_mut()), Ok(()));
    }

    #[test]
    fn kernel_allocate_falls_through() {
        let mut a = Box::new(Arena([0; 4096]));
        let mut b = Box::new(Arena([0; 4096]));
        let first = heap_with(&mut a);
        let second = heap_with(&mut b);

        let mut registry = HeapRegistry::new();
        registry.add_kernel(&first).unwrap();
        registry.add_kernel(&second).unwrap();
        assert_eq!(registry.add_kernel(&second), Err(HeapError::RegistryFull));

        let whole = first.stats().largest_free - 64;
        let _fill = first.allocate(whole).unwrap();
        let ptr = registry.kernel_allocate(1024).unwrap();
        assert!(second.is_member(ptr.as_ptr()));
    }

    #[test]
    fn kernel_fallthrough_is_not_a_failure() {
        use crate::{diag::Recorder, heap::Reclaim, lock::TaskId};
        use core::sync::atomic::{AtomicUsize, Ordering};

        static HOOK_CALLS: AtomicUsize = AtomicUsize::new(0);

        fn give_up(_size: usize) -> Reclaim {
            HOOK_CALLS.fetch_add(1, Ordering::Relaxed);
            Reclaim::GiveUp
        }

        let recorder = Recorder::new();
        let mut a = Box::new(Arena([0; 4096]));
        let mut b = Box::new(Arena([0; 4096]));
        let first = Heap::new(&recorder, &SingleTask);
        let second = Heap::new(&recorder, &SingleTask);
        unsafe {
            first.init(a.0.as_mut_ptr(), 4096).unwrap();
            second.init(b.0.as_mut_ptr(), 4096).unwrap();
        }
        first.set_oom_hook(Some(give_up)).unwrap();

        let mut registry = HeapRegistry::new();
        registry.add_kernel(&first).unwrap();
        registry.add_kernel(&second).unwrap();

        let _fill = first.allocate(first.stats().largest_free - 64).unwrap();
        let ptr = registry.kernel_allocate(1024).unwrap();
        assert!(second.is_member(ptr.as_ptr()));
        assert_eq!(HOOK_CALLS.load(Ordering::Relaxed), 0);
        assert_eq!(recorder.usage(TaskId(0)).unwrap().failures, 0);

        assert!(registry.kernel_allocate(8192).is_none());
        assert_eq!(HOOK_CALLS.load(Ordering::Relaxed), 1);
        assert_eq!(recorder.usage(TaskId(0)).unwrap().failures, 2);
    }

    #[test]
    fn apps_by_name() {
        let mut a = Box::new(Arena([0; 4096]));
        let mut b = Box::new(Arena([0; 4096]));
        let old = heap_with(&mut a);
        let new = heap_with(&mut b);

        let mut registry = HeapRegistry::new();
        registry.add_app("shell", &old).unwrap();
        registry.add_app("shell", &new).unwrap();
        assert!(core::ptr::eq(registry.app("shell").unwrap(), &new));

        assert!(registry.remove_app("shell").is_some());
        assert!(registry.app("shell").is_none());
        assert!(registry.remove_app("shell").is_none());
    }
}
