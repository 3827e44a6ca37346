//! Build-time configuration of the heap manager.
//!
//! Everything here is a constant so that every table the allocator owns can
//! be a fixed-size array: the allocator cannot allocate its own metadata.

/// Maximum number of disjoint regions a single heap can stitch together.
pub const MAX_REGIONS: usize = 4;

/// Chunks of `1 << MAX_SHIFT` bytes and above all share the last size class.
#[cfg(not(feature = "small"))]
pub const MAX_SHIFT: u32 = 22;
#[cfg(feature = "small")]
pub const MAX_SHIFT: u32 = 15;

/// Smallest granularity shift any header layout can produce. A free node is
/// always at least two sizes and two links wide, which is never below 16
/// bytes.
pub(crate) const MIN_MIN_SHIFT: u32 = 4;

/// Upper bound of the number of size classes over all header layouts.
pub(crate) const MAX_CLASSES: usize = (MAX_SHIFT - MIN_MIN_SHIFT + 1) as usize;

/// Number of tasks the diagnostics table tracks individually.
pub const MAX_TASKS: usize = 32;

/// Number of kernel heaps a [`HeapRegistry`](crate::HeapRegistry) can hold.
pub const MAX_KERNEL_HEAPS: usize = 2;

/// Number of named application heaps a [`HeapRegistry`](crate::HeapRegistry)
/// can hold.
pub const MAX_APP_HEAPS: usize = 8;
