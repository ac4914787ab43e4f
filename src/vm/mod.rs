//! Virtual memory: guest address translation.
//!
//! Guest programs see a flat virtual address space starting at
//! [`VM_ADDR_MIN`]. A [`PageDir`] maps guest virtual frame numbers to host
//! pages through a multi-level page directory with lazy demand allocation,
//! and a [`VmCache`] short-circuits the directory walk for hot loads and
//! stores. [`load`] and [`store`] tie the two together: an inlined cache
//! lookup with a slow-path miss handler that validates the access, walks the
//! directory and installs the translation.

mod cache;
mod pagedir;

pub use cache::{VmCache, VM_CACHE_LEN};
pub use pagedir::PageDir;

use std::fmt;
use std::mem;

use thiserror::Error;

use crate::{PAGE_SIZE, PAGE_SIZE_BITS};

/// Guest virtual address width in bits.
pub const VM_ADDR_BITS: u32 = 48;

/// Lowest mappable guest address. Zero stays a null sentinel.
pub const VM_ADDR_MIN: u64 = PAGE_SIZE as u64;

/// Highest mappable guest address.
pub const VM_ADDR_MAX: u64 = (1 << VM_ADDR_BITS) - 1;

/// Page-table index bits per level.
pub const VM_PTAB_BITS: u32 = 9;

/// Page-table depth.
pub const VM_PTAB_LEVELS: u32 = 4;

/// Entries per page-table node.
pub const VM_PTAB_LEN: usize = 1 << VM_PTAB_BITS;

/// Byte size of one page-table node; exactly one page.
pub const VM_PTAB_SIZE: usize = VM_PTAB_LEN * mem::size_of::<u64>();

/// Mask selecting the page-address bits of a guest address.
pub(crate) const VM_ADDR_PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

const _: () = assert!(VM_PTAB_SIZE == PAGE_SIZE);
const _: () = assert!(VM_PTAB_BITS * VM_PTAB_LEVELS == VM_ADDR_BITS - PAGE_SIZE_BITS);

/// Virtual frame number of `vaddr`.
#[inline]
pub(crate) fn vfn(vaddr: u64) -> u64 {
    vaddr >> PAGE_SIZE_BITS
}

/// Page address of `vaddr` (offset bits cleared).
#[inline]
pub(crate) fn page_addr(vaddr: u64) -> u64 {
    vaddr & VM_ADDR_PAGE_MASK
}

/// Offset of `vaddr` within its page.
#[inline]
pub(crate) fn addr_offset(vaddr: u64) -> u64 {
    vaddr & (PAGE_SIZE as u64 - 1)
}

/// Direction of a guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmOpKind {
    Load,
    Store,
}

impl fmt::Display for VmOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmOpKind::Load => write!(f, "load"),
            VmOpKind::Store => write!(f, "store"),
        }
    }
}

/// Operation tag handed to the cache-miss handler: access direction plus
/// access size in bytes, which doubles as the required alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmOp(u32);

impl VmOp {
    pub const fn new(kind: VmOpKind, size: u32) -> VmOp {
        VmOp(((kind as u32) << 8) | size)
    }

    pub const fn kind(self) -> VmOpKind {
        if self.0 >> 8 == 0 {
            VmOpKind::Load
        } else {
            VmOpKind::Store
        }
    }

    /// Access size in bytes; also the natural alignment of the access.
    pub const fn alignment(self) -> u32 {
        self.0 & 0xff
    }
}

/// Translation faults. These are guest-trappable: the runtime decides
/// whether to deliver them to the guest or tear the machine down.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmFault {
    /// Address outside `[VM_ADDR_MIN, VM_ADDR_MAX]`.
    #[error("out-of-range virtual address {0:#x}")]
    OutOfRange(u64),

    /// Address not aligned to the access size.
    #[error("misaligned {size}-byte {op} at {vaddr:#x}")]
    Misaligned { vaddr: u64, size: u32, op: VmOpKind },

    /// The physical memory manager could not back a first-touch page.
    #[error("out of backing memory mapping {0:#x}")]
    OutOfMemory(u64),
}

mod sealed {
    pub trait Sealed {}
}

/// Primitive value types a guest can load and store.
pub trait Primitive: Copy + sealed::Sealed {}

macro_rules! impl_primitive {
    ($($t:ty),*) => {
        $(
            impl sealed::Sealed for $t {}
            impl Primitive for $t {}
        )*
    };
}

impl_primitive!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Load a `T` from guest address `vaddr`.
///
/// The cache lookup is inlined into the caller; a miss validates the access,
/// walks the page directory (allocating the backing page on first touch) and
/// installs the translation before reading.
#[inline]
pub fn load<T: Primitive>(cache: &mut VmCache, dir: &PageDir, vaddr: u64) -> Result<T, VmFault> {
    let size = mem::size_of::<T>() as u32;
    let mut haddr = cache.lookup(vaddr, size as u64);
    if haddr == 0 {
        let diff = cache_miss(cache, dir, vaddr, VmOp::new(VmOpKind::Load, size))?;
        haddr = diff.wrapping_add(vaddr);
    }
    Ok(unsafe { (haddr as usize as *const T).read() })
}

/// Store `value` as a `T` at guest address `vaddr`.
#[inline]
pub fn store<T: Primitive>(
    cache: &mut VmCache,
    dir: &PageDir,
    vaddr: u64,
    value: T,
) -> Result<(), VmFault> {
    let size = mem::size_of::<T>() as u32;
    let mut haddr = cache.lookup(vaddr, size as u64);
    if haddr == 0 {
        let diff = cache_miss(cache, dir, vaddr, VmOp::new(VmOpKind::Store, size))?;
        haddr = diff.wrapping_add(vaddr);
    }
    unsafe { (haddr as usize as *mut T).write(value) };
    Ok(())
}

/// Slow path for [`load`]/[`store`]: validate the access, walk the page
/// directory and install the translation. Returns the host address delta for
/// `vaddr`'s page.
fn cache_miss(cache: &mut VmCache, dir: &PageDir, vaddr: u64, op: VmOp) -> Result<u64, VmFault> {
    crate::debug_vm!("cache miss {:#x} ({} {}B)", vaddr, op.kind(), op.alignment());

    if !(VM_ADDR_MIN..=VM_ADDR_MAX).contains(&vaddr) {
        return Err(VmFault::OutOfRange(vaddr));
    }

    let alignment = op.alignment() as u64;
    if vaddr & (alignment - 1) != 0 {
        return Err(VmFault::Misaligned {
            vaddr,
            size: op.alignment(),
            op: op.kind(),
        });
    }

    let hpage_addr = dir
        .lookup_hpage(vfn(vaddr))
        .map_err(|_| VmFault::OutOfMemory(vaddr))?;

    Ok(cache.add(page_addr(vaddr), hpage_addr as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmm::Pmm;
    use std::sync::Arc;

    const MIB: usize = 1024 * 1024;

    fn setup() -> (Arc<Pmm>, PageDir, VmCache) {
        let mm = Arc::new(Pmm::new_from_os(4 * MIB).unwrap());
        let dir = PageDir::new(Arc::clone(&mm)).unwrap();
        (mm, dir, VmCache::new())
    }

    #[test]
    fn test_op_tag() {
        let op = VmOp::new(VmOpKind::Store, 4);
        assert_eq!(op.kind(), VmOpKind::Store);
        assert_eq!(op.alignment(), 4);
        assert_eq!(VmOp::new(VmOpKind::Load, 8).kind(), VmOpKind::Load);
    }

    #[test]
    fn test_store_load_roundtrip() {
        let (_mm, dir, mut cache) = setup();

        store::<u32>(&mut cache, &dir, 0xdeadbee4, 12345).unwrap();
        assert_eq!(load::<u32>(&mut cache, &dir, 0xdeadbee4).unwrap(), 12345);
        // Second load hits the cache
        assert_eq!(load::<u32>(&mut cache, &dir, 0xdeadbee4).unwrap(), 12345);
    }

    #[test]
    fn test_load_after_invalidate() {
        let (_mm, dir, mut cache) = setup();

        store::<u64>(&mut cache, &dir, 0x20000, 0xfeed_face_cafe_f00d).unwrap();
        cache.invalidate();
        // Miss re-walks the directory and finds the same page
        assert_eq!(
            load::<u64>(&mut cache, &dir, 0x20000).unwrap(),
            0xfeed_face_cafe_f00d
        );
    }

    #[test]
    fn test_install_matches_translate() {
        let (_mm, dir, mut cache) = setup();

        let vaddr = 0x7f0040u64;
        store::<u8>(&mut cache, &dir, vaddr, 0x5a).unwrap();
        let haddr = cache.lookup(vaddr, 1);
        assert_ne!(haddr, 0);
        assert_eq!(haddr as usize, dir.translate(vaddr).unwrap());
    }

    #[test]
    fn test_out_of_range_fault() {
        let (_mm, dir, mut cache) = setup();

        assert_eq!(
            load::<u32>(&mut cache, &dir, 0x10).unwrap_err(),
            VmFault::OutOfRange(0x10)
        );
        assert_eq!(
            load::<u32>(&mut cache, &dir, VM_ADDR_MAX + 1).unwrap_err(),
            VmFault::OutOfRange(VM_ADDR_MAX + 1)
        );
    }

    #[test]
    fn test_misaligned_fault() {
        let (_mm, dir, mut cache) = setup();

        let err = store::<u32>(&mut cache, &dir, 0xdeadbee2, 1).unwrap_err();
        assert_eq!(
            err,
            VmFault::Misaligned {
                vaddr: 0xdeadbee2,
                size: 4,
                op: VmOpKind::Store,
            }
        );
    }

    #[test]
    fn test_alignment_strengthened_access_refaults() {
        let (_mm, dir, mut cache) = setup();

        // A 4-byte store installs the page translation
        store::<u32>(&mut cache, &dir, 0xdeadbee4, 7).unwrap();
        assert_ne!(cache.lookup(0xdeadbee4, 4), 0);

        // The same address is only 4-byte aligned, so an 8-byte access must
        // not be satisfied by the cached entry; the miss handler re-checks
        // alignment and faults.
        assert_eq!(cache.lookup(0xdeadbee4, 8), 0);
        assert_eq!(
            load::<u64>(&mut cache, &dir, 0xdeadbee4).unwrap_err(),
            VmFault::Misaligned {
                vaddr: 0xdeadbee4,
                size: 8,
                op: VmOpKind::Load,
            }
        );
    }

    #[test]
    fn test_fault_on_backing_exhaustion() {
        let mm = Arc::new(Pmm::new_from_os(2 * MIB).unwrap());
        let dir = PageDir::new(Arc::clone(&mm)).unwrap();
        let mut cache = VmCache::new();

        // Touch pages until the manager runs dry
        let mut vaddr = VM_ADDR_MIN;
        let fault = loop {
            match store::<u8>(&mut cache, &dir, vaddr, 1) {
                Ok(()) => vaddr += PAGE_SIZE as u64,
                Err(fault) => break fault,
            }
        };
        assert_eq!(fault, VmFault::OutOfMemory(vaddr));
    }
}
