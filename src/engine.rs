//! Allocation algorithms over the region table and the free lists.
//!
//! The [`Engine`] is the unlocked state of a heap. Every method assumes the
//! caller holds the heap lock and that the region memory stays valid; the
//! [`Heap`](crate::Heap) wrapper provides both.

use core::ptr;

use crate::{
    class::class_of,
    error::HeapError,
    freelist::FreeList,
    node::{AllocChunk, Chunk, FreeChunk, Geometry, MAX_CHUNK, NodeRef},
    region::{Region, RegionTable},
    utils::{align_down, align_up},
};

/// Usage summary of a heap, in the spirit of `mallinfo`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes covered by chunks, sentinels excluded.
    pub total: usize,
    /// Bytes in allocated chunks, headers included.
    pub used: usize,
    /// Bytes in free chunks.
    pub free: usize,
    /// Size of the largest free chunk.
    pub largest_free: usize,
    /// Number of free chunks.
    pub free_chunks: usize,
    /// Number of allocated chunks.
    pub alloc_chunks: usize,
    /// Highest value `used` has reached.
    pub peak: usize,
}

pub(crate) struct Engine<S> {
    regions: RegionTable,
    free: FreeList<S>,
    /// Sum of the region spans, low sentinels included.
    total: usize,
    used: usize,
    peak: usize,
    allocs: usize,
}

impl<S: Copy> Engine<S> {
    const GRAN: usize = Geometry::<S>::GRAN;
    const HEADER: usize = Geometry::<S>::HEADER;

    pub const fn new() -> Self {
        Self {
            regions: RegionTable::new(),
            free: FreeList::new(),
            total: 0,
            used: 0,
            peak: 0,
            allocs: 0,
        }
    }

    /// Chunk size serving a request of `request` payload bytes. A zero-byte
    /// request gets the smallest chunk.
    pub fn chunk_size(request: usize) -> Option<usize> {
        let size = align_up(request.checked_add(Self::HEADER)?, Self::GRAN)?;
        (size <= MAX_CHUNK).then_some(size)
    }

    pub fn regions(&self) -> &[Region] {
        self.regions.as_slice()
    }

    /// Makes `[base, base + len)` part of the heap and returns the index of
    /// the new region.
    ///
    /// # Safety
    ///
    /// The memory must be valid for reads and writes and owned by the heap
    /// from now on.
    pub unsafe fn add_region(&mut self, base: usize, len: usize) -> Result<usize, HeapError> {
        if self.regions.is_full() {
            return Err(HeapError::RegionTableFull);
        }

        let len = if len > MAX_CHUNK {
            log::debug!("region at {base:#x} clamped from {len} to {MAX_CHUNK} bytes");
            MAX_CHUNK
        } else {
            len
        };

        if self.regions.overlaps(base, len) {
            return Err(HeapError::InvalidRegion);
        }

        let region = Region::layout::<S>(base, len).ok_or(HeapError::InvalidRegion)?;

        unsafe {
            let low = region.low_sentinel::<S>();
            low.set_prev(0, true);
            low.set_size(Self::GRAN);

            let high = region.high_sentinel::<S>();
            high.set_size(0);

            let first = region.first_chunk::<S>();
            first.set_prev(Self::GRAN, true);
            first.set_size(region.hi - first.addr());
            first.publish(false);

            self.free.insert(first);
        }

        self.total += region.span();
        Ok(self.regions.push(region))
    }

    /// Grows region `index` over `size` bytes that became available right
    /// after its end. The old high sentinel turns into a chunk that merges
    /// with a free predecessor.
    ///
    /// # Safety
    ///
    /// `[end, end + size)` of the region must be valid memory owned by the
    /// heap from now on.
    pub unsafe fn extend(&mut self, index: usize, size: usize) -> Result<(), HeapError> {
        let region = *self.regions.get(index).ok_or(HeapError::InvalidRegion)?;

        if self.regions.overlaps(region.end(), size) {
            return Err(HeapError::InvalidRegion);
        }

        let new_end = region.end().checked_add(size).ok_or(HeapError::InvalidRegion)?;
        let new_hi = align_down(new_end, Self::GRAN)
            .checked_sub(Self::HEADER)
            .ok_or(HeapError::InvalidRegion)?;

        if new_hi < region.hi + Self::GRAN || new_hi - region.lo > MAX_CHUNK {
            return Err(HeapError::InvalidRegion);
        }

        let grow = new_hi - region.hi;

        unsafe {
            let old = region.high_sentinel::<S>();
            NodeRef::<S>::at(new_hi).set_size(0);
            old.set_size(grow);
            old.publish(true);

            if let Some(entry) = self.regions.get_mut(index) {
                entry.len += size;
                entry.hi = new_hi;
            }
            self.total += grow;

            self.release(old);
        }

        Ok(())
    }

    /// Takes the best-fitting free chunk of at least `need` bytes, splits off
    /// the remainder and marks it allocated.
    ///
    /// # Safety
    ///
    /// `need` must come from [`chunk_size`](Self::chunk_size).
    pub unsafe fn take(&mut self, need: usize) -> Option<NodeRef<S>> {
        let node = unsafe { self.claim(need)? };

        self.charge(unsafe { node.size() });
        self.allocs += 1;
        Some(node)
    }

    /// Unlinks and splits a best-fitting chunk. No accounting.
    unsafe fn claim(&mut self, need: usize) -> Option<NodeRef<S>> {
        let node = self.free.find_best_fit(need)?;

        unsafe {
            self.free.remove(node);

            let size = node.size();
            if size - need >= Self::GRAN {
                // The chunk after a free chunk is allocated, so the
                // remainder cannot merge with it.
                let rest = NodeRef::<S>::at(node.addr() + need);
                rest.set_size(size - need);
                node.set_size(need);
                node.publish(true);
                rest.publish(false);
                self.free.insert(rest);
            } else {
                node.publish(true);
            }
        }

        Some(node)
    }

    /// Like [`take`](Self::take), with the payload aligned to `align`, a
    /// power of two.
    ///
    /// # Safety
    ///
    /// `need` must come from [`chunk_size`](Self::chunk_size).
    pub unsafe fn take_aligned(&mut self, need: usize, align: usize) -> Option<NodeRef<S>> {
        // Payloads are always granularity-aligned.
        if align <= Self::GRAN {
            return unsafe { self.take(need) };
        }

        // Enough slack to slide the payload forward by less than `align`
        // and still leave a full chunk behind.
        let want = need.checked_add(align)?.checked_add(Self::GRAN)?;
        if want > MAX_CHUNK {
            return None;
        }

        unsafe {
            let mut node = self.claim(want)?;
            let payload = node.payload().as_ptr() as usize;
            let aligned = align_up(payload, align)?;

            if aligned != payload {
                // Both addresses are granularity-aligned, so the lead is
                // at least one granule.
                let moved = NodeRef::<S>::at(aligned - Self::HEADER);
                let lead = moved.addr() - node.addr();
                let rest = node.size() - lead;

                moved.set_size(rest);
                moved.publish(true);
                node.set_size(lead);
                node.publish(false);

                // `node` came off a free list, so its predecessor is
                // allocated and the lead needs no merging.
                self.free.insert(node);
                node = moved;
            }

            self.split_tail(node, need);
            self.charge(node.size());
            self.allocs += 1;
            Some(node)
        }
    }

    /// Frees an allocated chunk.
    ///
    /// # Safety
    ///
    /// `node` must be an allocated chunk of this heap.
    pub unsafe fn give_back(&mut self, node: NodeRef<S>) {
        unsafe {
            self.used -= node.size();
            self.allocs -= 1;
            self.release(node);
        }
    }

    /// Shrinks an allocated chunk to `need` bytes, freeing the tail when it
    /// is at least one granule. Smaller tails stay with the chunk.
    ///
    /// # Safety
    ///
    /// `node` must be an allocated chunk of at least `need` bytes.
    pub unsafe fn trim(&mut self, node: NodeRef<S>, need: usize) {
        let freed = unsafe { self.split_tail(node, need) };
        self.used -= freed;
    }

    /// Cuts `node` down to `need` bytes and releases the tail. Returns the
    /// bytes released. No accounting.
    unsafe fn split_tail(&mut self, node: NodeRef<S>, need: usize) -> usize {
        unsafe {
            let size = node.size();
            if size < need + Self::GRAN {
                return 0;
            }

            let tail = NodeRef::<S>::at(node.addr() + need);
            tail.set_size(size - need);
            node.set_size(need);
            node.publish(true);
            tail.publish(true);

            self.release(tail);
            size - need
        }
    }

    /// Grows an allocated chunk to `need` bytes by absorbing a free
    /// successor. Returns `false` when the successor cannot provide it.
    ///
    /// # Safety
    ///
    /// `node` must be an allocated chunk of this heap.
    pub unsafe fn grow_in_place(&mut self, node: NodeRef<S>, need: usize) -> bool {
        unsafe {
            let size = node.size();
            let next = node.next();

            if next.is_allocated() || size + next.size() < need {
                return false;
            }

            self.free.remove(next);
            node.set_size(size + next.size());
            node.publish(true);

            self.split_tail(node, need);
            self.charge(node.size() - size);
        }

        true
    }

    /// Grows an allocated chunk to `need` bytes by merging it into a free
    /// predecessor (and a free successor, if any) and moving the first
    /// `keep` payload bytes down. Returns the new chunk.
    ///
    /// # Safety
    ///
    /// `node` must be an allocated chunk of this heap with at least `keep`
    /// payload bytes.
    pub unsafe fn grow_backward(
        &mut self,
        node: NodeRef<S>,
        need: usize,
        keep: usize,
    ) -> Option<NodeRef<S>> {
        unsafe {
            if node.prev_allocated() {
                return None;
            }

            let prev = node.prev();
            let next = node.next();
            let size = node.size();
            let next_free = !next.is_allocated();
            let total = prev.size() + size + if next_free { next.size() } else { 0 };

            if total < need {
                return None;
            }

            self.free.remove(prev);
            if next_free {
                self.free.remove(next);
            }

            prev.set_size(total);
            prev.publish(true);

            ptr::copy(node.payload().as_ptr(), prev.payload().as_ptr(), keep);

            self.split_tail(prev, need);
            self.charge(prev.size() - size);
            Some(prev)
        }
    }

    /// Merges a chunk that is about to become free with its free
    /// neighbours and links the result into the free list. No accounting.
    unsafe fn release(&mut self, node: NodeRef<S>) {
        unsafe {
            let mut node = node;
            let mut size = node.size();

            let next = node.next();
            if !next.is_allocated() {
                self.free.remove(next);
                size += next.size();
                node.set_size(size);
            }

            if !node.prev_allocated() {
                let prev = node.prev();
                self.free.remove(prev);
                size += prev.size();
                prev.set_size(size);
                node = prev;
            }

            node.publish(false);
            self.free.insert(node);
        }
    }

    fn charge(&mut self, size: usize) {
        self.used += size;
        self.peak = self.peak.max(self.used);
    }

    /// Checks that `ptr` is the payload of an allocated chunk of this heap.
    pub fn validate(&self, ptr: usize) -> Result<NodeRef<S>, HeapError> {
        let region = self.regions.find(ptr).ok_or(HeapError::NotMember { addr: ptr })?;

        let addr = ptr.wrapping_sub(Self::HEADER);
        let corrupt = HeapError::CorruptHeader { addr };
        if addr < region.lo + Self::GRAN || addr % Self::GRAN != Geometry::<S>::NODE_OFFSET {
            return Err(corrupt);
        }

        unsafe {
            let node = NodeRef::<S>::at(addr);
            let size = node.size();
            if size == 0 || size % Self::GRAN != 0 || size > region.hi - addr {
                return Err(corrupt);
            }

            let next = node.next();
            if next.prev_size() != size {
                return Err(corrupt);
            }
            if !next.prev_allocated() {
                return Err(HeapError::DoubleFree { addr });
            }

            Ok(node)
        }
    }

    /// Node of the payload at `ptr`, validated when `checks` is enabled.
    pub fn lookup(&self, ptr: usize) -> Result<NodeRef<S>, HeapError> {
        if cfg!(feature = "checks") {
            self.validate(ptr)
        } else {
            Ok(unsafe { NodeRef::at(ptr - Self::HEADER) })
        }
    }

    pub fn is_member(&self, addr: usize) -> bool {
        self.regions.find(addr).is_some()
    }

    /// Visits every chunk of every region in address order, sentinels
    /// excluded.
    pub fn walk(&self, mut f: impl FnMut(Chunk<S>)) {
        for region in self.regions.as_slice() {
            let mut node = region.first_chunk::<S>();

            while node.addr() < region.hi {
                unsafe {
                    let size = node.size();
                    if size == 0 {
                        // Corrupt; check_corruption reports it.
                        break;
                    }

                    if node.is_allocated() {
                        f(Chunk::Alloc(AllocChunk {
                            addr: node.payload().as_ptr() as usize,
                            size,
                            stamp: node.stamp(),
                        }));
                    } else {
                        f(Chunk::Free(FreeChunk { addr: node.addr(), size }));
                    }

                    node = node.next();
                }
            }
        }
    }

    pub fn stats(&self) -> HeapStats {
        let sentinels = self.regions.len() * Self::GRAN;
        let total = self.total - sentinels;

        let largest_free = self
            .free
            .classes()
            .filter_map(|chain| chain.iter().last())
            .map(|node| unsafe { node.size() })
            .max()
            .unwrap_or(0);

        HeapStats {
            total,
            used: self.used,
            free: total - self.used,
            largest_free,
            free_chunks: self.free.len(),
            alloc_chunks: self.allocs,
            peak: self.peak,
        }
    }

    pub fn reset_peak(&mut self) {
        self.peak = self.used;
    }

    /// Validates every invariant of the heap: chunk sizes and back links,
    /// sentinels, eager coalescing, byte accounting and free-list contents.
    pub fn check(&self) -> Result<(), HeapError> {
        let corrupt = |addr: usize| Err(HeapError::CorruptHeader { addr });

        let mut sum = 0;
        let mut free_bytes = 0;
        let mut free_count = 0;
        let mut alloc_count = 0;

        for region in self.regions.as_slice() {
            unsafe {
                let low = region.low_sentinel::<S>();
                if low.size() != Self::GRAN || !low.is_allocated() {
                    return corrupt(low.addr());
                }
                sum += Self::GRAN;

                let mut node = region.first_chunk::<S>();
                let mut prev_size = Self::GRAN;
                let mut prev_free = false;

                while node.addr() != region.hi {
                    let size = node.size();
                    if node.addr() > region.hi
                        || size == 0
                        || size % Self::GRAN != 0
                        || node.prev_size() != prev_size
                    {
                        return corrupt(node.addr());
                    }

                    let free = !node.is_allocated();
                    if free && prev_free {
                        return corrupt(node.addr());
                    }

                    if free {
                        free_bytes += size;
                        free_count += 1;
                    } else {
                        alloc_count += 1;
                    }

                    sum += size;
                    prev_size = size;
                    prev_free = free;
                    node = node.next();
                }

                let high = region.high_sentinel::<S>();
                if high.size() != 0 || high.prev_size() != prev_size {
                    return corrupt(high.addr());
                }
            }
        }

        let origin = self.regions.as_slice().first().map_or(0, |r| r.lo);
        let sentinels = self.regions.len() * Self::GRAN;
        if sum != self.total
            || alloc_count != self.allocs
            || self.used != self.total - sentinels - free_bytes
        {
            return corrupt(origin);
        }

        let mut listed = 0;
        let mut listed_bytes = 0;
        for (class, chain) in self.free.classes().enumerate() {
            let mut last = 0;
            for node in chain {
                listed += 1;
                if listed > free_count || !self.is_member(node.addr()) {
                    return corrupt(node.addr());
                }

                unsafe {
                    let size = node.size();
                    if node.is_allocated() || class_of::<S>(size) != class || size < last {
                        return corrupt(node.addr());
                    }
                    last = size;
                    listed_bytes += size;
                }
            }
        }

        if listed != free_count || listed_bytes != free_bytes {
            return corrupt(origin);
        }

        Ok(())
    }

    /// Forgets every region. Returns the regions that were owned.
    pub fn clear(&mut self) -> RegionTable {
        let regions = core::mem::replace(&mut self.regions, RegionTable::new());
        self.free.clear();
        self.total = 0;
        self.used = 0;
        self.peak = 0;
        self.allocs = 0;
        regions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type G = Geometry<()>;

    #[repr(align(4096))]
    struct Arena([u8; 8192]);

    impl Arena {
        fn new() -> Box<Self> {
            Box::new(Self([0; 8192]))
        }

        fn base(&mut self) -> usize {
            self.0.as_mut_ptr() as usize
        }
    }

    fn engine(arena: &mut Arena, len: usize) -> Engine<()> {
        let mut engine = Engine::new();
        unsafe { engine.add_region(arena.base(), len).unwrap() };
        engine
    }

    fn need(request: usize) -> usize {
        Engine::<()>::chunk_size(request).unwrap()
    }

    #[test]
    fn chunk_size_rounds_to_granularity() {
        assert_eq!(need(0), G::GRAN);
        assert_eq!(need(1), align_up(1 + G::HEADER, G::GRAN).unwrap());
        assert_eq!(need(G::GRAN - G::HEADER), G::GRAN);
        assert_eq!(need(G::GRAN - G::HEADER + 1), 2 * G::GRAN);
        assert!(Engine::<()>::chunk_size(usize::MAX).is_none());
    }

    #[test]
    fn fresh_region_is_one_free_chunk() {
        let mut arena = Arena::new();
        let engine = engine(&mut arena, 4096);
        let stats = engine.stats();

        assert_eq!(stats.total, 4096 - 2 * G::GRAN);
        assert_eq!(stats.largest_free, stats.total);
        assert_eq!(stats.free_chunks, 1);
        assert_eq!(stats.used, 0);
        engine.check().unwrap();
    }

    #[test]
    fn take_splits_and_give_back_merges() {
        let mut arena = Arena::new();
        let mut engine = engine(&mut arena, 4096);
        let before = engine.stats();

        unsafe {
            let a = engine.take(need(100)).unwrap();
            let b = engine.take(need(50)).unwrap();
            assert_eq!(b.addr(), a.addr() + need(100));
            engine.check().unwrap();

            engine.give_back(a);
            engine.check().unwrap();
            assert_eq!(engine.stats().free_chunks, 2);

            engine.give_back(b);
            engine.check().unwrap();
        }

        assert_eq!(engine.stats(), HeapStats { peak: need(100) + need(50), ..before });
    }

    #[test]
    fn exact_fit_is_not_split() {
        let mut arena = Arena::new();
        let mut engine = engine(&mut arena, 4096);
        let whole = engine.stats().total;

        unsafe {
            let node = engine.take(whole).unwrap();
            assert_eq!(node.size(), whole);
            assert!(engine.take(G::GRAN).is_none());
            engine.give_back(node);
        }
        engine.check().unwrap();
    }

    #[test]
    fn trim_and_grow_in_place() {
        let mut arena = Arena::new();
        let mut engine = engine(&mut arena, 4096);

        unsafe {
            let node = engine.take(need(256)).unwrap();
            engine.trim(node, need(64));
            assert_eq!(node.size(), need(64));
            engine.check().unwrap();

            assert!(engine.grow_in_place(node, need(512)));
            assert_eq!(node.size(), need(512));
            assert_eq!(engine.stats().peak, need(512));
            engine.check().unwrap();

            let _blocker = engine.take(need(16)).unwrap();
            assert!(!engine.grow_in_place(node, need(1024)));
            engine.check().unwrap();
        }
    }

    #[test]
    fn grow_backward_moves_payload() {
        let mut arena = Arena::new();
        let mut engine = engine(&mut arena, 4096);

        unsafe {
            let a = engine.take(need(128)).unwrap();
            let b = engine.take(need(64)).unwrap();
            let _c = engine.take(need(64)).unwrap();
            ptr::write_bytes(b.payload().as_ptr(), 0xAB, 64);

            engine.give_back(a);
            let moved = engine.grow_backward(b, need(160), 64).unwrap();
            assert_eq!(moved.addr(), a.addr());

            let bytes = core::slice::from_raw_parts(moved.payload().as_ptr(), 64);
            assert!(bytes.iter().all(|&b| b == 0xAB));
            engine.check().unwrap();
        }
    }

    #[test]
    fn aligned_take() {
        let mut arena = Arena::new();
        let mut engine = engine(&mut arena, 8192);

        unsafe {
            let _pad = engine.take(need(8)).unwrap();
            for align in [G::GRAN * 2, 256, 1024] {
                let node = engine.take_aligned(need(40), align).unwrap();
                assert_eq!(node.payload().as_ptr() as usize % align, 0);
                assert!(node.size() >= need(40));
                assert_eq!(engine.stats().peak, engine.stats().used);
                engine.check().unwrap();
            }
        }
    }

    #[test]
    fn two_regions_never_merge() {
        let mut first = Arena::new();
        let mut second = Arena::new();
        let mut engine = Engine::<()>::new();

        unsafe {
            engine.add_region(first.base(), 4096).unwrap();
            engine.add_region(second.base(), 4096).unwrap();
        }

        let stats = engine.stats();
        assert_eq!(stats.total, 8192 - 4 * G::GRAN);
        assert_eq!(stats.free_chunks, 2);
        assert_eq!(stats.largest_free, 4096 - 2 * G::GRAN);

        unsafe {
            let whole = engine.take(4096 - 2 * G::GRAN).unwrap();
            engine.give_back(whole);
        }
        assert_eq!(engine.stats().free_chunks, 2);
        engine.check().unwrap();
    }

    #[test]
    fn overlapping_region_is_rejected() {
        let mut arena = Arena::new();
        let mut engine = engine(&mut arena, 4096);
        let base = arena.base();

        unsafe {
            assert_eq!(engine.add_region(base + 2048, 1024), Err(HeapError::InvalidRegion));
            assert_eq!(engine.add_region(base + 4096, 16), Err(HeapError::InvalidRegion));
        }
    }

    #[test]
    fn extend_recycles_high_sentinel() {
        let mut arena = Arena::new();
        let mut engine = engine(&mut arena, 4096);

        unsafe {
            let node = engine.take(need(64)).unwrap();
            engine.extend(0, 4096).unwrap();
            engine.check().unwrap();

            let stats = engine.stats();
            assert_eq!(stats.total, 8192 - 2 * G::GRAN);
            assert_eq!(stats.free_chunks, 1);
            assert_eq!(stats.largest_free, stats.total - node.size());
        }
    }

    #[test]
    fn validate_catches_double_free_and_garbage() {
        let mut arena = Arena::new();
        let mut engine = engine(&mut arena, 4096);

        unsafe {
            let node = engine.take(need(64)).unwrap();
            let _keep = engine.take(need(64)).unwrap();
            let ptr = node.payload().as_ptr() as usize;

            assert_eq!(engine.validate(ptr), Ok(node));
            engine.give_back(node);
            assert_eq!(engine.validate(ptr), Err(HeapError::DoubleFree { addr: node.addr() }));
            assert!(matches!(engine.validate(ptr + 8), Err(HeapError::CorruptHeader { .. })));
            assert_eq!(engine.validate(16), Err(HeapError::NotMember { addr: 16 }));
        }
    }

    #[test]
    fn check_detects_scribbled_header() {
        let mut arena = Arena::new();
        let mut engine = engine(&mut arena, 4096);

        unsafe {
            let node = engine.take(need(64)).unwrap();
            engine.check().unwrap();
            node.set_size(node.size() + 8);
        }
        assert!(matches!(engine.check(), Err(HeapError::CorruptHeader { .. })));
    }
}
