//! In-place chunk headers.
//!
//! Every chunk starts with an [`AllocNode`]. While a chunk is free the same
//! memory is read as a [`FreeNode`], whose two extra links overlap what is
//! otherwise the first bytes of the payload:
//!
//! ```text
//!            allocated                         free
//! +-----------------------------+  +-----------------------------+
//! | preceding | size | stamp    |  | preceding | size | stamp    |
//! +-----------------------------+  +-----------------------------+
//! |                             |  | forward link                |
//! |          payload            |  | back link                   |
//! |                             |  |          (unused)           |
//! +-----------------------------+  +-----------------------------+
//! ```
//!
//! `preceding` holds the size of the physically previous chunk, and its high
//! bit tells whether that previous chunk is allocated. The status of a chunk
//! therefore lives in the header of the chunk that follows it.
//!
//! Headers are never turned into Rust references. A [`NodeRef`] is only an
//! address and all field accesses are unaligned reads and writes, because
//! with 16-bit headers a node address need not be word aligned.

use core::{
    marker::PhantomData,
    mem,
    ptr::{self, NonNull},
};

use crate::config::{MAX_CLASSES, MAX_SHIFT, MIN_MIN_SHIFT};

/// Width of the `preceding` and `size` header fields.
#[cfg(not(feature = "small"))]
pub type Size = usize;
#[cfg(feature = "small")]
pub type Size = u16;

/// High bit of `preceding`: the previous chunk is allocated.
pub(crate) const ALLOC_BIT: Size = 1 << (Size::BITS - 1);

/// Largest chunk size representable in a header.
pub(crate) const MAX_CHUNK: usize = (ALLOC_BIT - 1) as usize;

/// Header common to allocated and free chunks.
#[repr(C)]
pub(crate) struct AllocNode<S> {
    preceding: Size,
    size: Size,
    stamp: S,
}

/// Header of a free chunk.
#[repr(C)]
pub(crate) struct FreeNode<S> {
    head: AllocNode<S>,
    forward: usize,
    back: usize,
}

/// Sizes derived from the header layout for a given stamp type.
pub(crate) struct Geometry<S>(PhantomData<S>);

impl<S> Geometry<S> {
    /// Bytes in front of every payload.
    pub const HEADER: usize = mem::size_of::<AllocNode<S>>();

    /// Minimum chunk size; every chunk size is a multiple of it.
    pub const GRAN: usize = {
        let gran = mem::size_of::<FreeNode<S>>().next_power_of_two();
        assert!(gran >= 1 << MIN_MIN_SHIFT);
        assert!(Self::HEADER <= gran);
        gran
    };

    pub const MIN_SHIFT: u32 = Self::GRAN.trailing_zeros();

    /// Number of size classes actually used with this layout.
    pub const CLASSES: usize = {
        assert!(Self::MIN_SHIFT <= MAX_SHIFT);
        let classes = (MAX_SHIFT - Self::MIN_SHIFT + 1) as usize;
        assert!(classes <= MAX_CLASSES);
        classes
    };

    /// Residue of every node address modulo the granularity. Placing nodes
    /// here makes every payload granularity-aligned.
    pub const NODE_OFFSET: usize = Self::GRAN - Self::HEADER;

    // Field offsets follow from `repr(C)` ordering.
    const STAMP_OFFSET: usize = round_up(2 * mem::size_of::<Size>(), mem::align_of::<S>());
    const FORWARD_OFFSET: usize = round_up(Self::HEADER, mem::align_of::<usize>());
    const BACK_OFFSET: usize = Self::FORWARD_OFFSET + mem::size_of::<usize>();
}

const PRECEDING_OFFSET: usize = 0;
const SIZE_OFFSET: usize = mem::size_of::<Size>();

const fn round_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Address of a chunk header inside some region.
pub(crate) struct NodeRef<S> {
    addr: usize,
    marker: PhantomData<S>,
}

impl<S> Clone for NodeRef<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for NodeRef<S> {}

impl<S> PartialEq for NodeRef<S> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl<S> Eq for NodeRef<S> {}

impl<S> core::fmt::Debug for NodeRef<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "NodeRef({:#x})", self.addr)
    }
}

impl<S: Copy> NodeRef<S> {
    /// Views the header at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must point to a header inside a region owned by the caller.
    #[inline]
    pub const unsafe fn at(addr: usize) -> Self {
        Self { addr, marker: PhantomData }
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.addr
    }

    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        // A node address is never zero, so neither is its payload.
        unsafe { NonNull::new_unchecked((self.addr + Geometry::<S>::HEADER) as *mut u8) }
    }

    #[inline]
    unsafe fn read_field<T>(self, offset: usize) -> T {
        unsafe { ptr::read_unaligned((self.addr + offset) as *const T) }
    }

    #[inline]
    unsafe fn write_field<T>(self, offset: usize, value: T) {
        unsafe { ptr::write_unaligned((self.addr + offset) as *mut T, value) }
    }

    /// Size of this chunk, header included. Zero for a high sentinel.
    #[inline]
    pub unsafe fn size(self) -> usize {
        unsafe { self.read_field::<Size>(SIZE_OFFSET) as usize }
    }

    #[inline]
    pub unsafe fn set_size(self, size: usize) {
        debug_assert!(size <= MAX_CHUNK);
        unsafe { self.write_field::<Size>(SIZE_OFFSET, size as Size) }
    }

    /// Size of the physically previous chunk.
    #[inline]
    pub unsafe fn prev_size(self) -> usize {
        unsafe { (self.read_field::<Size>(PRECEDING_OFFSET) & !ALLOC_BIT) as usize }
    }

    /// Whether the physically previous chunk is allocated.
    #[inline]
    pub unsafe fn prev_allocated(self) -> bool {
        unsafe { self.read_field::<Size>(PRECEDING_OFFSET) & ALLOC_BIT != 0 }
    }

    /// Records the size and status of the physically previous chunk.
    #[inline]
    pub unsafe fn set_prev(self, size: usize, allocated: bool) {
        debug_assert!(size <= MAX_CHUNK);
        let flag = if allocated { ALLOC_BIT } else { 0 };
        unsafe { self.write_field::<Size>(PRECEDING_OFFSET, size as Size | flag) }
    }

    #[inline]
    pub unsafe fn next(self) -> Self {
        unsafe { Self::at(self.addr + self.size()) }
    }

    #[inline]
    pub unsafe fn prev(self) -> Self {
        unsafe { Self::at(self.addr - self.prev_size()) }
    }

    /// High sentinels are the only chunks of size zero.
    #[inline]
    pub unsafe fn is_sentinel_end(self) -> bool {
        unsafe { self.size() == 0 }
    }

    /// Status of this chunk, read from the following header.
    #[inline]
    pub unsafe fn is_allocated(self) -> bool {
        unsafe { self.is_sentinel_end() || self.next().prev_allocated() }
    }

    /// Writes this chunk's size and status into the following header.
    #[inline]
    pub unsafe fn publish(self, allocated: bool) {
        unsafe {
            let size = self.size();
            self.next().set_prev(size, allocated);
        }
    }

    #[inline]
    pub unsafe fn stamp(self) -> S {
        unsafe { self.read_field::<S>(Geometry::<S>::STAMP_OFFSET) }
    }

    #[inline]
    pub unsafe fn set_stamp(self, stamp: S) {
        unsafe { self.write_field::<S>(Geometry::<S>::STAMP_OFFSET, stamp) }
    }

    /// Next entry of the free list, only meaningful while the chunk is free.
    #[inline]
    pub unsafe fn forward(self) -> Option<Self> {
        let addr = unsafe { self.read_field::<usize>(Geometry::<S>::FORWARD_OFFSET) };
        (addr != 0).then(|| unsafe { Self::at(addr) })
    }

    #[inline]
    pub unsafe fn back(self) -> Option<Self> {
        let addr = unsafe { self.read_field::<usize>(Geometry::<S>::BACK_OFFSET) };
        (addr != 0).then(|| unsafe { Self::at(addr) })
    }

    #[inline]
    pub unsafe fn set_forward(self, node: Option<Self>) {
        unsafe { self.write_field(Geometry::<S>::FORWARD_OFFSET, node.map_or(0, Self::addr)) }
    }

    #[inline]
    pub unsafe fn set_back(self, node: Option<Self>) {
        unsafe { self.write_field(Geometry::<S>::BACK_OFFSET, node.map_or(0, Self::addr)) }
    }
}

/// A chunk as seen by a heap walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk<S> {
    Alloc(AllocChunk<S>),
    Free(FreeChunk),
}

/// An allocated chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocChunk<S> {
    /// Payload address, as returned to the allocating caller.
    pub addr: usize,
    /// Chunk size, header included.
    pub size: usize,
    /// Monitor stamp written when the chunk was allocated.
    pub stamp: S,
}

/// A free chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeChunk {
    /// Header address.
    pub addr: usize,
    /// Chunk size, header included.
    pub size: usize,
}

impl<S> Chunk<S> {
    pub fn size(&self) -> usize {
        match self {
            Self::Alloc(chunk) => chunk.size,
            Self::Free(chunk) => chunk.size,
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, Self::Free(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(64))]
    struct Buf([u8; 256]);

    #[test]
    fn geometry_without_stamp() {
        assert_eq!(Geometry::<()>::HEADER, 2 * mem::size_of::<Size>());
        assert!(Geometry::<()>::GRAN.is_power_of_two());
        assert!(Geometry::<()>::GRAN >= mem::size_of::<FreeNode<()>>());
        assert_eq!(Geometry::<()>::NODE_OFFSET + Geometry::<()>::HEADER, Geometry::<()>::GRAN);
    }

    #[test]
    fn stamp_grows_header() {
        assert!(Geometry::<[usize; 2]>::HEADER > Geometry::<()>::HEADER);
        assert!(Geometry::<[usize; 2]>::GRAN >= Geometry::<()>::GRAN);
    }

    #[test]
    fn status_lives_in_next_header() {
        let mut buf = Buf([0; 256]);
        let base = buf.0.as_mut_ptr() as usize;
        unsafe {
            let a = NodeRef::<()>::at(base);
            a.set_size(64);
            let b = a.next();
            b.set_size(0);
            assert_eq!(b.addr(), base + 64);

            a.publish(true);
            assert!(a.is_allocated());
            assert!(b.prev_allocated());
            assert_eq!(b.prev_size(), 64);
            assert_eq!(b.prev(), a);

            a.publish(false);
            assert!(!a.is_allocated());
            assert_eq!(b.prev_size(), 64);
            // Terminal sentinel.
            assert!(b.is_allocated());
        }
    }

    #[test]
    fn free_links_roundtrip() {
        let mut buf = Buf([0; 256]);
        let base = buf.0.as_mut_ptr() as usize;
        unsafe {
            let a = NodeRef::<u32>::at(base);
            let b = NodeRef::<u32>::at(base + 64);
            a.set_forward(Some(b));
            a.set_back(None);
            assert_eq!(a.forward(), Some(b));
            assert_eq!(a.back(), None);
            a.set_stamp(7);
            assert_eq!(a.stamp(), 7);
            assert_eq!(a.forward(), Some(b));
        }
    }
}
