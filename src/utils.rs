//! Address arithmetic shared by every module of the allocator.

/// Rounds `value` up to the next multiple of `alignment`, which must be a
/// power of two. Returns `None` on overflow.
///
/// Used for chunk sizes (multiples of the granularity) and for the payload
/// addresses handed out by aligned allocation.
#[inline]
pub const fn align_up(value: usize, alignment: usize) -> Option<usize> {
    match value.checked_add(alignment - 1) {
        Some(v) => Some(v & !(alignment - 1)),
        None => None,
    }
}

/// Rounds `value` down to a multiple of `alignment` (a power of two).
#[inline]
pub const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

/// Smallest address `>= value` that is congruent to `offset` modulo
/// `alignment`. `offset` must be below `alignment`.
#[inline]
pub const fn align_up_to_offset(value: usize, alignment: usize, offset: usize) -> Option<usize> {
    match value.checked_add(alignment - offset) {
        Some(v) => match align_up(v, alignment) {
            Some(a) => Some(a - (alignment - offset)),
            None => None,
        },
        None => None,
    }
}
