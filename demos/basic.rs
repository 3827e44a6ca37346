use mmheap::{Heap, HostRegion, Quiet, SingleTask};

fn main() {
    let memory = HostRegion::map(4096).expect("no memory from the host");
    let heap = Heap::new(Quiet, &SingleTask);
    unsafe { heap.init(memory.as_ptr(), memory.len()).unwrap() };

    println!("fresh heap: {:?}", heap.stats());

    let first = heap.allocate(100).unwrap();
    println!("first  {:p}, usable {}", first, heap.usable_size(first.as_ptr()));
    let second = heap.allocate(50).unwrap();
    println!("second {:p}, usable {}", second, heap.usable_size(second.as_ptr()));

    println!("Freeing first");
    heap.free(first.as_ptr());

    let third = heap.allocate(64).unwrap();
    println!("third  {:p}, should reuse {:p}", third, first);

    let third = heap.resize(third.as_ptr(), 1000).unwrap();
    println!("third grew to {:p}", third);

    heap.free(second.as_ptr());
    heap.free(third.as_ptr());

    heap.check_corruption().unwrap();
    println!("drained heap: {:?}", heap.stats());
}
