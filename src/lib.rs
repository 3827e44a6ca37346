//! A heap manager for small kernels.
//!
//! Each [`Heap`] is assembled from up to [`MAX_REGIONS`](config::MAX_REGIONS)
//! disjoint memory regions. Chunk headers live in place, free chunks sit in
//! size-ordered lists with one list per power-of-two size class, and freed
//! chunks merge with their free neighbours right away. Allocation is a
//! best-fit search that starts at the request's class.
//!
//! ```
//! use mmheap::{Heap, HostRegion, HostThreads, Quiet};
//!
//! static HEAP: Heap = Heap::new(Quiet, &HostThreads);
//!
//! let region = HostRegion::map(64 * 1024).unwrap();
//! unsafe { HEAP.init_from(&[region.desc()]).unwrap() };
//!
//! let buf = HEAP.zeroed_allocate(16, 8).unwrap();
//! HEAP.free(buf.as_ptr());
//!
//! HEAP.teardown(|_| {}).unwrap();
//! ```
//!
//! The allocator never allocates for itself: every table has a fixed size
//! chosen in [`config`]. Locking is a counted lock whose waiting strategy
//! belongs to a [`Scheduler`], and diagnostics are a [`Monitor`] chosen per
//! heap: [`Quiet`] costs nothing, [`Recorder`] tags every allocation with
//! its task and call site.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

pub mod config;
mod class;
mod diag;
mod engine;
mod error;
mod freelist;
mod global;
mod heap;
mod list;
mod lock;
mod monitor;
mod node;
mod platform;
mod region;
mod registry;
mod utils;

pub use diag::{AllocTag, Recorder, TaskUsage};
pub use engine::HeapStats;
pub use error::HeapError;
pub use heap::{FaultHandler, Heap, HeapGuard, OomHook, Reclaim};
pub use lock::{HeapLock, Scheduler, SingleTask, TaskId};
pub use monitor::{Monitor, Quiet};
pub use node::{AllocChunk, Chunk, FreeChunk, Size};
pub use platform::RegionDesc;
pub use registry::HeapRegistry;

#[cfg(feature = "std")]
pub use lock::HostThreads;
#[cfg(feature = "std")]
pub use platform::{Host, HostRegion, PlatformMemory, page_size};
