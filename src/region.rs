use crate::{
    config::MAX_REGIONS,
    node::{Geometry, MAX_CHUNK, NodeRef},
    utils::{align_down, align_up_to_offset},
};

/// One contiguous memory extent contributed to a heap.
///
/// A region is capped by two sentinel chunks that are permanently marked
/// allocated, so coalescing never looks outside the region and never merges
/// two regions, even physically adjacent ones.
///
/// ```text
///  base                                                        base + len
///   |                                                               |
///   v                                                               v
///   +-----+-----------+---------+-----------+---------+-----------+--+
///   | pad | low (G)   | chunk   | chunk     |  ...    | high (0)  |  |
///   +-----+-----------+---------+-----------+---------+-----------+--+
///         ^ lo                                        ^ hi
/// ```
///
/// The low sentinel is a zero-payload chunk of one granule, the high
/// sentinel a bare header of size zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Start of the memory handed to the heap.
    pub base: usize,
    /// Length of the memory handed to the heap.
    pub len: usize,
    /// Address of the low sentinel.
    pub lo: usize,
    /// Address of the high sentinel.
    pub hi: usize,
}

impl Region {
    const EMPTY: Self = Self { base: 0, len: 0, lo: 0, hi: 0 };

    /// Computes the sentinel placement for `[base, base + len)`, or `None`
    /// if the extent cannot hold both sentinels and one minimum chunk.
    pub(crate) fn layout<S>(base: usize, len: usize) -> Option<Self> {
        let gran = Geometry::<S>::GRAN;
        let header = Geometry::<S>::HEADER;

        let end = base.checked_add(len)?;
        let lo = align_up_to_offset(base, gran, Geometry::<S>::NODE_OFFSET)?;
        let hi = align_down(end, gran).checked_sub(header)?;

        // Low sentinel plus at least one free chunk.
        let first = lo.checked_add(gran)?;
        if hi < first.checked_add(gran)? {
            return None;
        }

        // Headers cannot describe larger chunks.
        if hi - first > MAX_CHUNK {
            return None;
        }

        Some(Self { base, len, lo, hi })
    }

    /// End of the memory handed to the heap.
    #[inline]
    pub fn end(&self) -> usize {
        self.base + self.len
    }

    /// Bytes covered by chunks, low sentinel included.
    #[inline]
    pub fn span(&self) -> usize {
        self.hi - self.lo
    }

    /// Whether `addr` lies inside the chunks of this region.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.lo <= addr && addr < self.hi
    }

    fn overlaps(&self, base: usize, end: usize) -> bool {
        base < self.end() && self.base < end
    }

    pub(crate) fn low_sentinel<S: Copy>(&self) -> NodeRef<S> {
        unsafe { NodeRef::at(self.lo) }
    }

    pub(crate) fn high_sentinel<S: Copy>(&self) -> NodeRef<S> {
        unsafe { NodeRef::at(self.hi) }
    }

    /// First real chunk, right after the low sentinel.
    pub(crate) fn first_chunk<S: Copy>(&self) -> NodeRef<S> {
        unsafe { NodeRef::at(self.lo + Geometry::<S>::GRAN) }
    }
}

/// Fixed table of the regions of one heap, in registration order.
pub(crate) struct RegionTable {
    regions: [Region; MAX_REGIONS],
    count: usize,
}

impl RegionTable {
    pub const fn new() -> Self {
        Self {
            regions: [Region::EMPTY; MAX_REGIONS],
            count: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.count == MAX_REGIONS
    }

    pub fn push(&mut self, region: Region) -> usize {
        debug_assert!(!self.is_full());
        self.regions[self.count] = region;
        self.count += 1;
        self.count - 1
    }

    pub fn get(&self, index: usize) -> Option<&Region> {
        self.as_slice().get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Region> {
        self.regions[..self.count].get_mut(index)
    }

    pub fn as_slice(&self) -> &[Region] {
        &self.regions[..self.count]
    }

    /// Region whose chunks contain `addr`.
    pub fn find(&self, addr: usize) -> Option<&Region> {
        self.as_slice().iter().find(|region| region.contains(addr))
    }

    /// Whether `[base, base + len)` intersects memory already owned.
    pub fn overlaps(&self, base: usize, len: usize) -> bool {
        let end = base.saturating_add(len);
        self.as_slice().iter().any(|region| region.overlaps(base, end))
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }
}
