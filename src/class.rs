//! Size-class index of the free lists.
//!
//! Chunk sizes are multiples of the granularity `G`. Sizes below `2G` are
//! classed linearly, one class per granularity step, and from `2G` upwards by
//! `floor(log2(size / G))`. Both rules put `2G` in class 1, so the mapping is
//! continuous and monotonic. Everything at or above `1 << MAX_SHIFT` lands in
//! the last class.

use crate::node::Geometry;

/// Sizes below this many granules are classed linearly.
const LINEAR_UNITS: usize = 2;

/// Returns the free-list class of a chunk of `size` bytes.
#[inline]
pub(crate) fn class_of<S>(size: usize) -> usize {
    let units = size >> Geometry::<S>::MIN_SHIFT;
    let class = if units < LINEAR_UNITS {
        units.saturating_sub(1)
    } else {
        (usize::BITS - 1 - units.leading_zeros()) as usize
    };
    class.min(Geometry::<S>::CLASSES - 1)
}

/// Smallest chunk size that falls into `class`.
#[cfg(test)]
pub(crate) fn class_floor<S>(class: usize) -> usize {
    Geometry::<S>::GRAN << class
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_SHIFT;

    type G = Geometry<()>;

    #[test]
    fn smallest_sizes_are_linear() {
        assert_eq!(class_of::<()>(0), 0);
        assert_eq!(class_of::<()>(G::GRAN), 0);
        assert_eq!(class_of::<()>(2 * G::GRAN), 1);
    }

    #[test]
    fn boundary_between_linear_and_log() {
        assert_eq!(class_of::<()>(2 * G::GRAN), 1);
        assert_eq!(class_of::<()>(3 * G::GRAN), 1);
        assert_eq!(class_of::<()>(4 * G::GRAN), 2);
        assert_eq!(class_of::<()>(7 * G::GRAN), 2);
        assert_eq!(class_of::<()>(8 * G::GRAN), 3);
    }

    #[test]
    fn huge_sizes_share_last_class() {
        let last = G::CLASSES - 1;
        assert_eq!(class_of::<()>(1 << MAX_SHIFT), last);
        assert_eq!(class_of::<()>(usize::MAX & !(G::GRAN - 1)), last);
    }

    #[test]
    fn class_floor_maps_back() {
        for class in 0..G::CLASSES {
            assert_eq!(class_of::<()>(class_floor::<()>(class)), class);
        }
    }

    #[test]
    fn monotonic() {
        let mut last = 0;
        for units in 0..(1usize << 12) {
            let class = class_of::<()>(units * G::GRAN);
            assert!(class >= last, "class dropped at {} granules", units);
            last = class;
        }
    }
}
