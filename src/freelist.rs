use crate::{
    class::class_of,
    config::MAX_CLASSES,
    list::Chain,
    node::{Geometry, NodeRef},
};

/// Size-classed free lists of one heap.
///
/// There is one [`Chain`] per size class (see [`crate::class`]). Each chain
/// is kept in ascending size order, so the first entry large enough is also
/// the tightest fit of its class, and the first entry of any higher class is
/// large enough for anything classed below it.
///
/// ```text
///  class 0  [ 32 ] -> [ 32 ] -> [ 32 ]
///  class 1  [ 64 ] -> [ 96 ]
///  class 2  (empty)
///  class 3  [ 256 ] -> [ 288 ] -> [ 480 ]
///   ...
///  last     [ 9 MiB ]
/// ```
///
/// Equal sizes keep insertion order.
pub(crate) struct FreeList<S> {
    classes: [Chain<S>; MAX_CLASSES],
}

impl<S: Copy> FreeList<S> {
    pub const fn new() -> Self {
        Self {
            classes: [const { Chain::new() }; MAX_CLASSES],
        }
    }

    /// Links a free chunk into the chain of its class.
    ///
    /// The caller must have published the chunk as free already; only the
    /// size and the links are used here.
    ///
    /// **SAFETY**: `node` must be a free chunk that is in no chain.
    pub unsafe fn insert(&mut self, node: NodeRef<S>) {
        unsafe {
            let size = node.size();
            let chain = &mut self.classes[class_of::<S>(size)];

            let mut last = None;
            let mut at = chain.first();
            while let Some(entry) = at {
                if entry.size() > size {
                    break;
                }
                last = Some(entry);
                at = entry.forward();
            }

            chain.insert_before(node, at, last);
        }
    }

    /// Unlinks a free chunk. Its size must not have changed since
    /// [`insert`](Self::insert).
    ///
    /// **SAFETY**: `node` must be linked in this free list.
    pub unsafe fn remove(&mut self, node: NodeRef<S>) {
        unsafe {
            let class = class_of::<S>(node.size());
            self.classes[class].remove(node);
        }
    }

    /// Returns the smallest chunk of at least `size` bytes without unlinking
    /// it, or `None` when no class at or above `class_of(size)` can serve it.
    pub fn find_best_fit(&self, size: usize) -> Option<NodeRef<S>> {
        let first = class_of::<S>(size);

        for chain in &self.classes[first..Geometry::<S>::CLASSES] {
            if chain.is_empty() {
                continue;
            }

            // Chains are sorted, so the first fit is the best fit.
            let fit = chain.iter().find(|node| unsafe { node.size() } >= size);
            if fit.is_some() {
                return fit;
            }
        }

        None
    }

    /// Iterates every class chain, smallest class first.
    pub fn classes(&self) -> impl Iterator<Item = &Chain<S>> {
        self.classes[..Geometry::<S>::CLASSES].iter()
    }

    /// Number of free chunks over all classes.
    pub fn len(&self) -> usize {
        self.classes().map(Chain::len).sum()
    }

    /// Forgets every entry.
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}
