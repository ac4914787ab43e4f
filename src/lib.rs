//! # guestmem
//!
//! Memory subsystem for embeddable, userspace virtual-machine runtimes.
//!
//! Guest programs get a flat virtual address space backed by host memory
//! obtained from the operating system, built from three layers:
//!
//! - [`Pmm`]: a binary buddy allocator handing out page-aligned runs of
//!   host memory in power-of-two sizes.
//! - [`PageDir`] + [`VmCache`]: a multi-level page directory translating
//!   guest virtual addresses to host addresses with lazy demand allocation,
//!   fronted by a direct-mapped translation cache for hot loads and stores.
//! - [`KernelHeap`]: a byte-granular allocator layered on the page manager,
//!   with size-class slab heaps for small objects and bitmap-indexed
//!   sub-heaps for larger ones.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use guestmem::{vm, KernelHeap, PageDir, Pmm, Result, VmCache};
//!
//! fn main() -> Result<()> {
//!     let pmm = Arc::new(Pmm::new_from_os(16 * 1024 * 1024)?);
//!
//!     // Guest loads and stores through a page directory and cache
//!     let dir = PageDir::new(Arc::clone(&pmm))?;
//!     let mut cache = VmCache::new();
//!     vm::store::<u32>(&mut cache, &dir, 0xdead_bee4, 12345).expect("store");
//!     assert_eq!(vm::load::<u32>(&mut cache, &dir, 0xdead_bee4), Ok(12345));
//!
//!     // Runtime-internal allocations through the kernel-style heap
//!     let heap = KernelHeap::new(Arc::clone(&pmm), 1024 * 1024)?;
//!     let region = heap.alloc(100).expect("alloc");
//!     heap.free(region);
//!     Ok(())
//! }
//! ```

pub mod debug;
mod error;

mod bitset;
pub mod host;
pub mod kheap;
pub mod pmm;
pub mod vm;

// Re-exports
pub use error::{Error, Result};
pub use host::HostMemory;
pub use kheap::{KernelHeap, Region};
pub use pmm::Pmm;
pub use vm::{PageDir, VmCache, VmFault};

/// Page size in bytes. A power of two; the unit of wholesale transfer for
/// every layer.
pub const PAGE_SIZE: usize = 4096;

/// log2(PAGE_SIZE), for shifting instead of dividing.
pub const PAGE_SIZE_BITS: u32 = 12;

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(1 << PAGE_SIZE_BITS == PAGE_SIZE);

/// Round `x` up to the nearest multiple of `a` (a power of two).
pub(crate) const fn align_up(x: usize, a: usize) -> usize {
    (x + a - 1) & !(a - 1)
}

/// Round `x` down to the nearest multiple of `a` (a power of two).
pub(crate) const fn align_down(x: usize, a: usize) -> usize {
    x & !(a - 1)
}
