use std::{
    alloc::{GlobalAlloc, Layout},
    sync::Once,
    thread,
};

use mmheap::{Heap, HostRegion, HostThreads, Quiet};

static HEAP: Heap = Heap::new(Quiet, &HostThreads);

/// Maps the first region on the first allocation, which may come before
/// `main` runs.
struct OnDemand;

static READY: Once = Once::new();

unsafe impl GlobalAlloc for OnDemand {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        READY.call_once(|| {
            if let Some(region) = HostRegion::map(16 * 1024 * 1024) {
                let _ = unsafe { HEAP.init_from(&[region.leak()]) };
            }
        });
        unsafe { HEAP.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { HEAP.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        unsafe { HEAP.realloc(ptr, layout, new_size) }
    }
}

#[global_allocator]
static ALLOCATOR: OnDemand = OnDemand;

fn main() {
    let mut v = Vec::new();
    for i in 0..1000u32 {
        v.push(i);
    }
    println!("vector of {} lives at {:p}", v.len(), v.as_ptr());
    drop(v);

    // Merge example
    let a = Box::new([0u8; 64]);
    let b = Box::new([0u8; 64]);
    let ptr_a = a.as_ptr();

    drop(a);
    drop(b);

    let c = Box::new([0u8; 128]);
    let ptr_c = c.as_ptr();

    if ptr_a == ptr_c {
        println!("Correctly reused at {:p}", ptr_c);
    } else {
        println!("Not reused. A was at {:p} and C is at {:p}", ptr_a, ptr_c);
    }

    let workers = (0..4usize)
        .map(|n| thread::spawn(move || (0..100).map(|i| Box::new(i * n)).map(|b| *b).sum::<usize>()))
        .collect::<Vec<_>>();
    for worker in workers {
        println!("worker sum {}", worker.join().unwrap());
    }

    println!("{:?}", HEAP.stats());
}
