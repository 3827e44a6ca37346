//! Where region memory comes from.
//!
//! A heap never asks anyone for memory by itself: regions are handed to it
//! as [`RegionDesc`]s, usually straight from the board's memory map. On a
//! host, [`HostRegion`] maps fresh pages from the operating system to back a
//! region.

/// A block of memory to be handed to a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionDesc {
    /// First byte of the block.
    pub base: usize,
    /// Length of the block in bytes.
    pub size: usize,
}

impl RegionDesc {
    pub const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// One past the last byte.
    pub const fn end(&self) -> usize {
        self.base + self.size
    }
}

#[cfg(feature = "std")]
pub use host::{Host, HostRegion, PlatformMemory, page_size};

#[cfg(feature = "std")]
mod host {
    use core::{
        ptr::NonNull,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::RegionDesc;
    use crate::utils::align_up;

    /// Abstraction over the page-granular memory services of the host
    /// kernel. The heap itself has no idea which API is behind it.
    pub trait PlatformMemory {
        /// Requests `len` bytes of fresh, zeroed, read-write memory.
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

        /// Gives `len` bytes at `addr` back to the kernel.
        unsafe fn return_memory(addr: *mut u8, len: usize);

        /// Virtual memory page size in bytes.
        fn page_size() -> usize;
    }

    /// The operating system this crate runs on.
    pub struct Host;

    /// Page size of the host, queried once.
    pub fn page_size() -> usize {
        static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

        match PAGE_SIZE.load(Ordering::Relaxed) {
            0 => {
                let size = Host::page_size();
                PAGE_SIZE.store(size, Ordering::Relaxed);
                size
            }
            size => size,
        }
    }

    #[cfg(unix)]
    mod unix {
        use core::{ffi::c_void, ptr::NonNull};

        use libc::{c_int, mmap, munmap, off_t, size_t};

        use super::{Host, PlatformMemory};

        impl PlatformMemory for Host {
            unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
                const ADDR: *mut c_void = core::ptr::null_mut();
                const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
                const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
                const FD: c_int = -1;
                const OFFSET: off_t = 0;

                unsafe {
                    match mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) {
                        libc::MAP_FAILED => None,
                        addr => NonNull::new(addr.cast::<u8>()),
                    }
                }
            }

            unsafe fn return_memory(addr: *mut u8, len: usize) {
                if unsafe { munmap(addr.cast::<c_void>(), len as size_t) } != 0 {
                    log::warn!("munmap of {len} bytes at {addr:p} failed");
                }
            }

            fn page_size() -> usize {
                unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
            }
        }
    }

    #[cfg(windows)]
    mod windows {
        use core::{ffi::c_void, mem::MaybeUninit, ptr::NonNull};

        use windows::Win32::System::{Memory, SystemInformation};

        use super::{Host, PlatformMemory};

        impl PlatformMemory for Host {
            unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
                let protection = Memory::PAGE_READWRITE;
                let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

                unsafe { NonNull::new(Memory::VirtualAlloc(None, len, flags, protection).cast()) }
            }

            unsafe fn return_memory(addr: *mut u8, len: usize) {
                let released =
                    unsafe { Memory::VirtualFree(addr.cast::<c_void>(), 0, Memory::MEM_RELEASE) };
                if released.is_err() {
                    log::warn!("VirtualFree of {len} bytes at {addr:p} failed");
                }
            }

            fn page_size() -> usize {
                unsafe {
                    let mut system_info = MaybeUninit::uninit();
                    SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                    system_info.assume_init().dwPageSize as usize
                }
            }
        }
    }

    /// Pages mapped from the host, returned to it on drop.
    ///
    /// A heap using the memory must be torn down (or the region leaked)
    /// before the `HostRegion` goes away.
    #[derive(Debug)]
    pub struct HostRegion {
        ptr: NonNull<u8>,
        len: usize,
    }

    // Plain memory, nothing thread-bound about it.
    unsafe impl Send for HostRegion {}
    unsafe impl Sync for HostRegion {}

    impl HostRegion {
        /// Maps at least `len` bytes, rounded up to whole pages.
        pub fn map(len: usize) -> Option<Self> {
            let len = align_up(len.max(1), page_size())?;
            let ptr = unsafe { Host::request_memory(len)? };

            log::debug!("mapped {len} bytes at {ptr:p}");
            Some(Self { ptr, len })
        }

        pub fn as_ptr(&self) -> *mut u8 {
            self.ptr.as_ptr()
        }

        pub fn len(&self) -> usize {
            self.len
        }

        pub fn is_empty(&self) -> bool {
            self.len == 0
        }

        pub fn desc(&self) -> RegionDesc {
            RegionDesc::new(self.ptr.as_ptr() as usize, self.len)
        }

        /// Gives up ownership of the pages, which then stay mapped for the
        /// life of the process.
        pub fn leak(self) -> RegionDesc {
            let desc = self.desc();
            core::mem::forget(self);
            desc
        }
    }

    impl Drop for HostRegion {
        fn drop(&mut self) {
            log::debug!("unmapping {} bytes at {:p}", self.len, self.ptr);
            unsafe { Host::return_memory(self.ptr.as_ptr(), self.len) }
        }
    }

}
