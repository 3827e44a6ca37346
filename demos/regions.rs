use mmheap::{Heap, HeapRegistry, HostRegion, Quiet, Recorder, SingleTask, page_size};

static RECORDER: Recorder = Recorder::new();

fn main() {
    // Two pages with a gap between them.
    let memory = HostRegion::map(4 * page_size()).unwrap();
    let kernel = Heap::new(&RECORDER, &SingleTask);
    unsafe {
        kernel.add_region(memory.as_ptr(), page_size()).unwrap();
        kernel.add_region(memory.as_ptr().add(2 * page_size()), page_size()).unwrap();
    }

    let app_memory = HostRegion::map(page_size()).unwrap();
    let app = Heap::new(&RECORDER, &SingleTask);
    unsafe { app.init(app_memory.as_ptr(), app_memory.len()).unwrap() };

    let mut registry = HeapRegistry::new();
    registry.add_kernel(&kernel).unwrap();
    registry.add_app("shell", &app).unwrap();

    let mut held = Vec::new();
    while let Some(ptr) = registry.kernel_allocate(700) {
        held.push(ptr);
    }
    println!("{} kernel allocations before running out", held.len());

    let line = registry.app("shell").unwrap().allocate(32).unwrap();

    let mut dump = String::new();
    kernel.dump_live_allocations(&mut dump).unwrap();
    print!("{dump}");

    RECORDER.for_each_task(|usage| println!("{usage:?}"));

    for ptr in held {
        registry.free(ptr.as_ptr()).unwrap();
    }
    registry.free(line.as_ptr()).unwrap();

    println!("kernel {:?}", kernel.stats());
    println!("app    {:?}", app.stats());
}
