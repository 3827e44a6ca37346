//! Conservative leak detection.
//!
//! Every word of the root ranges that points into the payload of an
//! allocated chunk marks that chunk reachable, and the payloads of reachable
//! chunks are scanned in turn. Whatever stays unmarked is reported. Like any
//! conservative scan it cannot tell pointers from integers, so it may miss
//! leaks but never reports a chunk whose address is stored somewhere it
//! scanned.

use core::{mem, ops::Range};

use crate::{
    engine::Engine,
    error::HeapError,
    node::{AllocChunk, Chunk, Geometry},
    utils::align_up,
};

const UNSEEN: u8 = 0;
const REACHED: u8 = 1;
const SCANNED: u8 = 2;

/// Walk-order index of the allocated chunk whose payload contains `addr`.
fn locate<S: Copy>(engine: &Engine<S>, addr: usize) -> Option<usize> {
    let mut index = 0;

    for region in engine.regions() {
        let hit = region.contains(addr);
        let mut node = region.first_chunk::<S>();

        while node.addr() < region.hi {
            unsafe {
                let size = node.size();
                if size == 0 {
                    return None;
                }

                if node.is_allocated() {
                    let payload = node.payload().as_ptr() as usize;
                    if hit && payload <= addr && addr < node.addr() + size {
                        return Some(index);
                    }
                    index += 1;
                }

                if hit && addr < node.addr() + size {
                    // Header or free chunk.
                    return None;
                }

                node = node.next();
            }
        }
    }

    None
}

/// Marks every chunk referenced from the words of `range`.
unsafe fn scan<S: Copy>(engine: &Engine<S>, range: Range<usize>, marks: &mut [u8]) {
    let word = mem::size_of::<usize>();
    let Some(mut at) = align_up(range.start, word) else {
        return;
    };

    while at.saturating_add(word) <= range.end {
        let value = unsafe { (at as *const usize).read_volatile() };
        if let Some(index) = locate(engine, value) {
            if marks[index] == UNSEEN {
                marks[index] = REACHED;
            }
        }
        at += word;
    }
}

/// Runs a leak scan and calls `on_leak` for every unreachable allocation.
/// Returns the number of leaks.
///
/// `marks` needs one byte per allocated chunk.
pub(crate) unsafe fn leak_check<S: Copy>(
    engine: &Engine<S>,
    roots: &[Range<usize>],
    marks: &mut [u8],
    mut on_leak: impl FnMut(&AllocChunk<S>),
) -> Result<usize, HeapError> {
    let live = engine.stats().alloc_chunks;
    let marks = marks.get_mut(..live).ok_or(HeapError::OutOfMemory)?;
    marks.fill(UNSEEN);

    for root in roots {
        unsafe { scan(engine, root.clone(), marks) };
    }

    // Propagate until no reached chunk is left unscanned.
    loop {
        let mut progress = false;
        let mut index = 0;

        engine.walk(|chunk| {
            if let Chunk::Alloc(chunk) = chunk {
                if marks[index] == REACHED {
                    marks[index] = SCANNED;
                    let end = chunk.addr + chunk.size - Geometry::<S>::HEADER;
                    unsafe { scan(engine, chunk.addr..end, marks) };
                    progress = true;
                }
                index += 1;
            }
        });

        if !progress {
            break;
        }
    }

    let mut leaks = 0;
    let mut index = 0;
    engine.walk(|chunk| {
        if let Chunk::Alloc(chunk) = chunk {
            if marks[index] == UNSEEN {
                leaks += 1;
                on_leak(&chunk);
            }
            index += 1;
        }
    });

    Ok(leaks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(4096))]
    struct Arena([u8; 4096]);

    fn need(request: usize) -> usize {
        Engine::<()>::chunk_size(request).unwrap()
    }

    #[test]
    fn unreferenced_chunks_are_reported() {
        let mut arena = Box::new(Arena([0; 4096]));
        let mut engine = Engine::<()>::new();
        unsafe { engine.add_region(arena.0.as_mut_ptr() as usize, 4096).unwrap() };

        let (kept, child, lost) = unsafe {
            (
                engine.take(need(32)).unwrap(),
                engine.take(need(32)).unwrap(),
                engine.take(need(32)).unwrap(),
            )
        };

        // `kept` is rooted through an interior pointer and points at
        // `child`. Nothing refers to `lost`.
        let root = [kept.payload().as_ptr() as usize + 8];
        unsafe { (kept.payload().as_ptr() as *mut usize).write(child.payload().as_ptr() as usize) };

        let roots = [root.as_ptr() as usize..root.as_ptr() as usize + mem::size_of_val(&root)];
        let mut marks = [0u8; 8];
        let mut leaked = Vec::new();

        let count = unsafe {
            leak_check(&engine, &roots, &mut marks, |chunk| leaked.push(chunk.addr)).unwrap()
        };

        assert_eq!(count, 1);
        assert_eq!(leaked, vec![lost.payload().as_ptr() as usize]);
    }

    #[test]
    fn mark_buffer_must_cover_live_chunks() {
        let mut arena = Box::new(Arena([0; 4096]));
        let mut engine = Engine::<()>::new();

        unsafe {
            engine.add_region(arena.0.as_mut_ptr() as usize, 4096).unwrap();
            engine.take(need(8)).unwrap();
            engine.take(need(8)).unwrap();

            let result = leak_check(&engine, &[], &mut [0u8; 1], |_| {});
            assert_eq!(result, Err(HeapError::OutOfMemory));
        }
    }
}
