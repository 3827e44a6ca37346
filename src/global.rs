use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use crate::{heap::Heap, monitor::Monitor, node::Geometry};

/// Lets a heap serve as the `#[global_allocator]`.
///
/// ```no_run
/// use mmheap::{Heap, Quiet, SingleTask};
///
/// #[global_allocator]
/// static HEAP: Heap = Heap::new(Quiet, &SingleTask);
/// ```
///
/// Regions still have to be added before the first allocation.
unsafe impl<M: Monitor> GlobalAlloc for Heap<M> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = if layout.align() <= Geometry::<M::Stamp>::GRAN {
            self.allocate(layout.size())
        } else {
            self.aligned_allocate(layout.align(), layout.size()).ok()
        };

        ptr.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() {
            unsafe { ptr.write_bytes(0, layout.size()) };
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= Geometry::<M::Stamp>::GRAN {
            return self.resize(ptr, new_size).map_or(ptr::null_mut(), NonNull::as_ptr);
        }

        // Over-aligned blocks may not keep their alignment when moved by
        // `resize`.
        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
            return ptr::null_mut();
        };
        let new = unsafe { self.alloc(new_layout) };
        if !new.is_null() {
            unsafe {
                ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
                self.dealloc(ptr, layout);
            }
        }
        new
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lock::SingleTask, monitor::Quiet};

    #[repr(align(4096))]
    struct Arena([u8; 4096]);

    #[test]
    fn layouts_are_honoured() {
        let heap: Heap = Heap::new(Quiet, &SingleTask);
        let mut arena = Box::new(Arena([0; 4096]));
        unsafe { heap.init(arena.0.as_mut_ptr(), 4096).unwrap() };

        unsafe {
            let layout = Layout::from_size_align(24, 8).unwrap();
            let small = heap.alloc_zeroed(layout);
            assert!(!small.is_null());
            assert!(core::slice::from_raw_parts(small, 24).iter().all(|&b| b == 0));

            let wide = Layout::from_size_align(64, 256).unwrap();
            let aligned = heap.alloc(wide);
            assert_eq!(aligned as usize % 256, 0);

            aligned.write_bytes(0x3C, 64);
            let grown = heap.realloc(aligned, wide, 200);
            assert_eq!(grown as usize % 256, 0);
            assert_eq!(*grown.add(63), 0x3C);

            heap.dealloc(grown, Layout::from_size_align(200, 256).unwrap());
            heap.dealloc(small, layout);
        }

        assert_eq!(heap.stats().used, 0);
        heap.check_corruption().unwrap();
    }
}
