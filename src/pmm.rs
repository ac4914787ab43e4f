//! Physical memory manager.
//!
//! A binary buddy allocator over a contiguous host memory region. The region
//! is arranged in sub-ranges half the size of larger sub-ranges; blocks are
//! managed per order of power of two (order 0 is one page, order 1 two pages,
//! order 2 four pages, and so on). Two blocks of the same order that were
//! produced by splitting the block one order up are "buddies" and are merged
//! back together when both are free.
//!
//! Per order the manager keeps one free list, with list nodes embedded in the
//! free blocks themselves, and one bitset with a bit per block of that order.
//! A set bit means the block is currently allocated at that order, which is
//! also how [`Pmm::free_pages`] deduces the size of an allocation: the lowest
//! order whose bit is set for the address is the order it was handed out at.

use std::ptr::{self, NonNull};
use std::sync::Mutex;

use crate::debug_pmm;
use crate::error::{Error, Result};
use crate::host::HostMemory;
use crate::{align_down, align_up, PAGE_SIZE};

/// Largest power-of-two order of pages in the buddy tree.
///
/// The value has almost no impact on capacity: bitset storage varies only a
/// few bytes between 12 and 20. A small value gives few free lists with many
/// entries each, a large value many free lists with few entries each. 20
/// covers 4 GiB runs at 4 KiB pages.
pub const MAX_ORDER: usize = 20;

const ORDERS: usize = MAX_ORDER + 1;

/// Number of pages in the largest order.
const MAX_ORDER_NPAGES: usize = 1 << MAX_ORDER;

/// List node embedded in the first bytes of every free block.
#[repr(C)]
struct FreeBlock {
    prev: *mut FreeBlock,
    next: *mut FreeBlock,
}

struct PmmInner {
    /// Number of free bytes available to allocate
    free_size: usize,
    /// Per-order use bitsets, carved from the top of the managed region
    bitsets: [*mut u8; ORDERS],
    /// Per-order free lists, null-terminated and doubly linked
    freelists: [*mut FreeBlock; ORDERS],
}

/// Buddy allocator over a contiguous host region.
///
/// All mutating operations are serialized by a single internal mutex, so a
/// `Pmm` can be shared between threads behind an `Arc`.
pub struct Pmm {
    /// Usable range start (page-aligned, read-only after creation)
    start_addr: usize,
    /// Usable range end (exclusive, read-only after creation)
    end_addr: usize,
    inner: Mutex<PmmInner>,
    /// OS mapping backing the region, when this Pmm owns one
    _host: Option<HostMemory>,
}

// Safety: the raw bitset and free-list pointers reference memory owned by
// the managed region for the lifetime of the Pmm, and every access to them
// happens under the inner mutex.
unsafe impl Send for Pmm {}
unsafe impl Sync for Pmm {}

unsafe fn bit_get(bits: *mut u8, bit: usize) -> bool {
    *bits.add(bit / 8) & (1 << (bit % 8)) != 0
}

unsafe fn bit_set(bits: *mut u8, bit: usize) {
    *bits.add(bit / 8) |= 1 << (bit % 8);
}

unsafe fn bit_clear(bits: *mut u8, bit: usize) {
    *bits.add(bit / 8) &= !(1 << (bit % 8));
}

unsafe fn list_push(head: &mut *mut FreeBlock, node: *mut FreeBlock) {
    let old_head = *head;
    (*node).prev = ptr::null_mut();
    (*node).next = old_head;
    if !old_head.is_null() {
        (*old_head).prev = node;
    }
    *head = node;
}

unsafe fn list_pop(head: &mut *mut FreeBlock) -> *mut FreeBlock {
    let node = *head;
    if !node.is_null() {
        let next = (*node).next;
        if !next.is_null() {
            (*next).prev = ptr::null_mut();
        }
        *head = next;
    }
    node
}

unsafe fn list_remove(head: &mut *mut FreeBlock, node: *mut FreeBlock) {
    if (*node).prev.is_null() {
        debug_assert_eq!(*head, node);
        *head = (*node).next;
    } else {
        (*(*node).prev).next = (*node).next;
    }
    if !(*node).next.is_null() {
        (*(*node).next).prev = (*node).prev;
    }
}

unsafe fn list_len(mut node: *mut FreeBlock) -> usize {
    let mut n = 0;
    while !node.is_null() {
        n += 1;
        node = (*node).next;
    }
    n
}

impl Pmm {
    /// Create a manager over a caller-provided region.
    ///
    /// Fails with [`Error::RegionTooSmall`] when the region cannot hold the
    /// per-order bitsets plus at least one usable page.
    ///
    /// # Safety
    ///
    /// `[ptr, ptr + len)` must be valid, writable memory that outlives the
    /// returned `Pmm` and is not accessed through any other path while the
    /// `Pmm` exists.
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Result<Pmm> {
        Self::create(ptr, len, None)
    }

    /// Create a manager over a fresh OS allocation of `len` bytes.
    pub fn new_from_os(len: usize) -> Result<Pmm> {
        // The page granule must be an even multiple (or divisor) of the
        // host's, or host mappings would straddle our page boundaries.
        let host_page = HostMemory::page_size();
        if host_page % PAGE_SIZE != 0 && PAGE_SIZE % host_page != 0 {
            return Err(Error::NotSupported(format!(
                "page size {} incompatible with host page size {}",
                PAGE_SIZE, host_page
            )));
        }
        let host = HostMemory::new(len)?;
        let (ptr, size) = (host.as_mut_ptr(), host.size());
        unsafe { Self::create(ptr, size, Some(host)) }
    }

    unsafe fn create(ptr: *mut u8, len: usize, host: Option<HostMemory>) -> Result<Pmm> {
        let start = align_up(ptr as usize, PAGE_SIZE);
        let end = ptr as usize + len;
        if end <= start {
            return Err(Error::RegionTooSmall(len));
        }
        let mut memsize = end - start;

        // Bitset k needs one bit per order-k block, plus two trailing bytes
        // absorbing the imaginary end-buddy sentinel and rounding slack.
        let nchunks = memsize / PAGE_SIZE;
        let bset_nbytes = nchunks / 8;
        let bitset_size = |order: usize| (bset_nbytes >> order) + 2;
        let bset_total: usize = (0..ORDERS).map(bitset_size).sum();

        // Usable span: everything below the bitsets, minus one page of
        // headroom, aligned down to a page boundary.
        memsize = memsize
            .checked_sub(bset_total + PAGE_SIZE)
            .ok_or(Error::RegionTooSmall(len))?;
        memsize = align_down(memsize, PAGE_SIZE);
        if memsize == 0 {
            return Err(Error::RegionTooSmall(len));
        }

        // Pack the per-order bitsets ascending from the reserved tail
        let mut bitsets = [ptr::null_mut(); ORDERS];
        let mut bitset_at = end - bset_total;
        for (order, slot) in bitsets.iter_mut().enumerate() {
            let size = bitset_size(order);
            ptr::write_bytes(bitset_at as *mut u8, 0, size);
            *slot = bitset_at as *mut u8;
            bitset_at += size;
        }

        let mut inner = PmmInner {
            free_size: memsize,
            bitsets,
            freelists: [ptr::null_mut(); ORDERS],
        };
        let start_addr = start;
        let end_addr = start + memsize;

        debug_pmm!(
            "managing {:#x}..{:#x} ({} pages, {} B of bitsets)",
            start_addr,
            end_addr,
            memsize / PAGE_SIZE,
            bset_total
        );

        // Seed the free lists: greedily take the largest power-of-two page
        // run that fits, capped at the top order. Clear the block's bit and
        // set the bit of the notional buddy past its end so that merging
        // during later frees never crosses a seeded boundary.
        let mut npages_total = memsize / PAGE_SIZE;
        let mut at = start_addr;
        while npages_total > 0 {
            let npages = floor_pow2(npages_total).min(MAX_ORDER_NPAGES);
            npages_total -= npages;
            let order = npages.trailing_zeros() as usize;
            let block_size = PAGE_SIZE << order;

            list_push(&mut inner.freelists[order], at as *mut FreeBlock);
            let bit = (at - start_addr) / block_size;
            bit_clear(inner.bitsets[order], bit);
            bit_set(inner.bitsets[order], bit + 1);

            debug_pmm!("initial free block {}:{:#x} ({} pages)", order, at, npages);
            at += block_size;
        }

        Ok(Pmm {
            start_addr,
            end_addr,
            inner: Mutex::new(inner),
            _host: host,
        })
    }

    /// Total number of managed pages.
    pub fn cap(&self) -> usize {
        (self.end_addr - self.start_addr) / PAGE_SIZE
    }

    /// Number of pages currently free.
    pub fn avail_total(&self) -> usize {
        self.inner.lock().unwrap().free_size / PAGE_SIZE
    }

    /// Largest per-order free page count.
    pub fn avail_maxregion(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        let mut npages = 0;
        for order in 0..ORDERS {
            let n = unsafe { list_len(inner.freelists[order]) } << order;
            if n > npages {
                npages = n;
            }
        }
        npages
    }

    /// Start address of the usable range.
    pub fn start_addr(&self) -> usize {
        self.start_addr
    }

    /// Allocate a run of `npages` contiguous pages.
    ///
    /// `npages` must be a power of two; the same count is implied when the
    /// run is later released with [`Pmm::free_pages`]. Returns `None` when
    /// no free block of sufficient order exists.
    pub fn alloc_pages(&self, npages: usize) -> Option<NonNull<u8>> {
        if npages == 0 {
            return None;
        }
        assert!(
            npages.is_power_of_two(),
            "can only allocate a power-of-two page count (got {})",
            npages
        );
        let order = npages.trailing_zeros() as usize;

        let mut inner = self.inner.lock().unwrap();
        let rel = Self::alloc1(&mut inner, self.start_addr, order)?;
        inner.free_size -= npages * PAGE_SIZE;

        let addr = self.start_addr + rel;
        debug_pmm!("alloc {} pages -> {:#x}", npages, addr);
        NonNull::new(addr as *mut u8)
    }

    /// Allocate the largest power-of-two page run between `min_npages` and
    /// `req_npages` (rounded up to a power of two).
    ///
    /// Returns the run and the granted page count.
    pub fn alloc_pages_min(&self, req_npages: usize, min_npages: usize) -> Option<(NonNull<u8>, usize)> {
        let min = min_npages.max(1).next_power_of_two();
        let mut npages = req_npages.max(min).next_power_of_two();
        loop {
            if let Some(ptr) = self.alloc_pages(npages) {
                return Some((ptr, npages));
            }
            if npages <= min {
                return None;
            }
            npages >>= 1;
        }
    }

    /// Release a run previously returned by [`Pmm::alloc_pages`].
    ///
    /// The run's size is deduced from the per-order bitsets. Panics when
    /// `ptr` is not a page-aligned address inside the managed region or was
    /// not handed out by this manager.
    pub fn free_pages(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        assert!(addr % PAGE_SIZE == 0, "freeing a non-page-aligned address {:#x}", addr);
        assert!(
            addr >= self.start_addr && addr < self.end_addr,
            "freeing an address outside the managed region {:#x}",
            addr
        );

        let mut inner = self.inner.lock().unwrap();
        let rel = addr - self.start_addr;
        let order = Self::free1(&mut inner, self.start_addr, rel, 0)
            .unwrap_or_else(|| panic!("freeing an unallocated region {:#x}", addr));
        inner.free_size += PAGE_SIZE << order;
        debug_pmm!("free {:#x} (order {})", addr, order);
    }

    /// Take a free block of `order`, splitting one of the next order when
    /// this order's free list is empty. Returns the region-relative address.
    fn alloc1(inner: &mut PmmInner, start_addr: usize, order: usize) -> Option<usize> {
        if order > MAX_ORDER {
            return None;
        }
        let size = PAGE_SIZE << order;

        let rel = unsafe {
            let node = list_pop(&mut inner.freelists[order]);
            if !node.is_null() {
                node as usize - start_addr
            } else {
                // No free blocks of this order. Take a block one order up
                // and split it; the high half becomes a free buddy.
                let rel = Self::alloc1(inner, start_addr, order + 1)?;
                let buddy = (start_addr + rel + size) as *mut FreeBlock;
                list_push(&mut inner.freelists[order], buddy);
                rel
            }
        };

        let bit = rel / size;
        unsafe {
            debug_assert!(!bit_get(inner.bitsets[order], bit));
            bit_set(inner.bitsets[order], bit);
        }
        Some(rel)
    }

    /// Find the order `rel` was allocated at, release the block and merge
    /// with its buddy as far up as both halves are free. Returns the found
    /// order, or `None` when no order's bit is set for `rel`.
    fn free1(inner: &mut PmmInner, start_addr: usize, rel: usize, order: usize) -> Option<usize> {
        if order > MAX_ORDER {
            return None;
        }
        let size = PAGE_SIZE << order;
        let bit = rel / size;

        unsafe {
            if !bit_get(inner.bitsets[order], bit) {
                return Self::free1(inner, start_addr, rel, order + 1);
            }
            bit_clear(inner.bitsets[order], bit);

            let buddy_rel = rel ^ size;
            let buddy_bit = buddy_rel / size;
            if order < MAX_ORDER && !bit_get(inner.bitsets[order], buddy_bit) {
                // Buddy is free too: detach it and merge one order up,
                // keeping the lower of the two addresses.
                let buddy = (start_addr + buddy_rel) as *mut FreeBlock;
                list_remove(&mut inner.freelists[order], buddy);
                Self::free1(inner, start_addr, rel.min(buddy_rel), order + 1);
            } else {
                list_push(&mut inner.freelists[order], (start_addr + rel) as *mut FreeBlock);
            }
        }
        Some(order)
    }
}

/// Round down to the nearest power of two. `n` must be nonzero.
fn floor_pow2(n: usize) -> usize {
    1 << n.ilog2()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const MIB: usize = 1024 * 1024;

    #[test]
    fn test_create_rejects_tiny_region() {
        // Not enough room for bitsets plus one usable page
        assert!(Pmm::new_from_os(2 * PAGE_SIZE).is_err());
    }

    #[test]
    fn test_alloc_free_roundtrip() {
        let mm = Pmm::new_from_os(10 * MIB).unwrap();
        let initial = mm.avail_total();
        assert!(initial > 0);
        assert!(mm.cap() >= initial);

        assert!(mm.alloc_pages(0).is_none());

        let p = mm.alloc_pages(4).unwrap();
        assert_eq!((p.as_ptr() as usize - mm.start_addr()) % (4 * PAGE_SIZE), 0);
        assert_eq!(mm.avail_total(), initial - 4);
        mm.free_pages(p);
        assert_eq!(mm.avail_total(), initial);

        // Buddy reuse: the same block comes back
        let p2 = mm.alloc_pages(4).unwrap();
        assert_eq!(p2, p);
        mm.free_pages(p2);
        assert_eq!(mm.avail_total(), initial);
    }

    #[test]
    fn test_tip_tap_free_order() {
        let mm = Pmm::new_from_os(10 * MIB).unwrap();
        let initial = mm.avail_total();

        let ptrs: Vec<_> = (0..16).map(|_| mm.alloc_pages(4).unwrap()).collect();
        // One extra single page so the last 4-page free still has an
        // allocated neighbor above it
        let extra = mm.alloc_pages(1).unwrap();

        // Free in tip-tap order (0, 15, 2, 13, 4, 11, ...) to exercise both
        // merge directions
        for i in 0..ptrs.len() {
            if i % 2 == 1 {
                mm.free_pages(ptrs[ptrs.len() - i]);
            } else {
                mm.free_pages(ptrs[i]);
            }
        }
        mm.free_pages(extra);

        assert_eq!(mm.avail_total(), initial);
    }

    #[test]
    fn test_alloc_pages_min_downgrades() {
        let mm = Pmm::new_from_os(10 * MIB).unwrap();

        // Non-pow2 request is rounded up
        let (p, n) = mm.alloc_pages_min(3, 1).unwrap();
        assert_eq!(n, 4);
        mm.free_pages(p);

        // Drain the manager, then ask for more than remains
        let total = mm.avail_total();
        let (big, got) = mm.alloc_pages_min(total.next_power_of_two(), 1).unwrap();
        assert!(got <= total);
        mm.free_pages(big);
    }

    #[test]
    fn test_avail_maxregion() {
        let mm = Pmm::new_from_os(10 * MIB).unwrap();
        let max0 = mm.avail_maxregion();
        assert!(max0 > 0 && max0 <= mm.avail_total());

        let p = mm.alloc_pages(1).unwrap();
        assert!(mm.avail_maxregion() <= max0);
        mm.free_pages(p);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mm = Pmm::new_from_os(4 * MIB).unwrap();
        let mut held = Vec::new();
        while let Some(p) = mm.alloc_pages(1) {
            held.push(p);
        }
        assert_eq!(mm.avail_total(), 0);
        assert!(mm.alloc_pages(1).is_none());
        for p in held {
            mm.free_pages(p);
        }
    }

    #[test]
    fn test_shared_between_threads() {
        let mm = Arc::new(Pmm::new_from_os(10 * MIB).unwrap());
        let initial = mm.avail_total();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mm = Arc::clone(&mm);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        if let Some(p) = mm.alloc_pages(2) {
                            mm.free_pages(p);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(mm.avail_total(), initial);
    }

    #[test]
    #[should_panic(expected = "power-of-two")]
    fn test_non_pow2_alloc_panics() {
        let mm = Pmm::new_from_os(4 * MIB).unwrap();
        mm.alloc_pages(3);
    }

    #[test]
    #[should_panic(expected = "unallocated")]
    fn test_free_unregistered_panics() {
        let mm = Pmm::new_from_os(4 * MIB).unwrap();
        let p = NonNull::new(mm.start_addr() as *mut u8).unwrap();
        mm.free_pages(p);
    }
}
