use core::marker::PhantomData;

use crate::node::NodeRef;

/// Intrusive doubly-linked chain of free chunks.
///
/// The chain owns no memory: its links live inside the free chunks
/// themselves (see [`NodeRef::forward`] and [`NodeRef::back`]). That is the
/// only way an allocator can keep lists without allocating.
///
/// ```text
///  head
///   |
///   v
/// +------+ forward +------+ forward +------+
/// | Free | ------> | Free | ------> | Free | ---> None
/// |      | <------ |      | <------ |      |
/// +------+  back   +------+  back   +------+
/// ```
pub(crate) struct Chain<S> {
    head: Option<NodeRef<S>>,
    len: usize,
}

pub(crate) struct Iter<'a, S> {
    current: Option<NodeRef<S>>,
    marker: PhantomData<&'a Chain<S>>,
}

impl<S: Copy> Chain<S> {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Option<NodeRef<S>> {
        self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Links `node` right in front of `at`, or at the end of the chain when
    /// `at` is `None`. `last` must be the current last entry when `at` is
    /// `None`.
    ///
    /// **SAFETY**: `node` must be a free chunk not linked anywhere, `at` and
    /// `last` must belong to this chain.
    pub unsafe fn insert_before(
        &mut self,
        node: NodeRef<S>,
        at: Option<NodeRef<S>>,
        last: Option<NodeRef<S>>,
    ) {
        unsafe {
            let back = match at {
                Some(at) => at.back(),
                None => last,
            };

            node.set_forward(at);
            node.set_back(back);

            if let Some(at) = at {
                at.set_back(Some(node));
            }

            match back {
                Some(back) => back.set_forward(Some(node)),
                None => self.head = Some(node),
            }
        }

        self.len += 1;
    }

    /// Unlinks `node` in *O(1)*.
    ///
    /// **SAFETY**: `node` must currently be linked in this chain.
    pub unsafe fn remove(&mut self, node: NodeRef<S>) {
        unsafe {
            let forward = node.forward();
            let back = node.back();

            match back {
                Some(back) => back.set_forward(forward),
                None => self.head = forward,
            }

            if let Some(forward) = forward {
                forward.set_back(back);
            }
        }

        self.len -= 1;
    }

    pub fn iter(&self) -> Iter<'_, S> {
        Iter {
            current: self.head,
            marker: PhantomData,
        }
    }
}

impl<S: Copy> Iterator for Iter<'_, S> {
    type Item = NodeRef<S>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;

        // Links of a chunk linked in the chain are valid.
        self.current = unsafe { node.forward() };

        Some(node)
    }
}

impl<'a, S: Copy> IntoIterator for &'a Chain<S> {
    type Item = NodeRef<S>;
    type IntoIter = Iter<'a, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
