use core::fmt;

/// Everything that can go wrong inside a heap.
///
/// Running out of memory is the only failure a caller is expected to handle
/// routinely; allocation entry points report it as `None`. Header and
/// ownership violations are unrecoverable and are routed to the heap's
/// fault handler unless the caller used one of the `try_` entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// No free chunk large enough, in any region.
    OutOfMemory,
    /// Region is too small, wraps the address space or overlaps another one.
    InvalidRegion,
    /// The heap already owns `MAX_REGIONS` regions.
    RegionTableFull,
    /// The chunk at `addr` is already free.
    DoubleFree { addr: usize },
    /// The chunk header at `addr` fails the sanity checks.
    CorruptHeader { addr: usize },
    /// `addr` does not belong to any region of the heap.
    NotMember { addr: usize },
    /// Alignment is not a power of two.
    InvalidAlignment,
    /// The lock is contended and the caller must not block, or the heap is
    /// in the middle of a walk.
    WouldBlock,
    /// A registry table has no free slot.
    RegistryFull,
}

impl HeapError {
    /// Whether continuing after this error risks corrupting the heap.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DoubleFree { .. } | Self::CorruptHeader { .. } | Self::NotMember { .. }
        )
    }
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::InvalidRegion => f.write_str("invalid region"),
            Self::RegionTableFull => f.write_str("region table full"),
            Self::DoubleFree { addr } => write!(f, "double free of chunk at {addr:#x}"),
            Self::CorruptHeader { addr } => write!(f, "corrupt chunk header at {addr:#x}"),
            Self::NotMember { addr } => write!(f, "{addr:#x} is not owned by this heap"),
            Self::InvalidAlignment => f.write_str("alignment is not a power of two"),
            Self::WouldBlock => f.write_str("heap lock contended or heap busy walking"),
            Self::RegistryFull => f.write_str("heap registry full"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for HeapError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors() {
        assert!(HeapError::DoubleFree { addr: 0x10 }.is_fatal());
        assert!(HeapError::NotMember { addr: 0x10 }.is_fatal());
        assert!(!HeapError::OutOfMemory.is_fatal());
        assert!(!HeapError::InvalidAlignment.is_fatal());
    }

    #[test]
    fn display_includes_address() {
        let msg = HeapError::CorruptHeader { addr: 0x2000_0040 }.to_string();
        assert_eq!(msg, "corrupt chunk header at 0x20000040");
    }
}
