//! Minimal tour of the memory subsystem: create a page manager over host
//! memory, run guest loads and stores through a page directory, and serve a
//! few byte-granular allocations from the kernel-style heap.
//!
//! Run with: cargo run --example hello_vmem

use std::sync::Arc;

use guestmem::{vm, KernelHeap, PageDir, Pmm, Result, VmCache};

fn main() -> Result<()> {
    let pmm = Arc::new(Pmm::new_from_os(32 * 1024 * 1024)?);
    println!(
        "page manager: {} pages managed, {} free",
        pmm.cap(),
        pmm.avail_total()
    );

    let dir = PageDir::new(Arc::clone(&pmm))?;
    let mut cache = VmCache::new();

    vm::store::<u32>(&mut cache, &dir, 0xdead_bee4, 12345).expect("store");
    let value = vm::load::<u32>(&mut cache, &dir, 0xdead_bee4).expect("load");
    println!("guest [0xdeadbee4] = {}", value);

    let heap = KernelHeap::new(Arc::clone(&pmm), 4 * 1024 * 1024)?;
    let small = heap.alloc(48).expect("small alloc");
    let aligned = heap.alloc_aligned(100, 512).expect("aligned alloc");
    println!(
        "heap: {} B reserved for 48, {} B at {:p} for 100@512",
        small.size(),
        aligned.size(),
        aligned.as_ptr()
    );
    heap.free(aligned);
    heap.free(small);

    println!("heap: {} B available of {} B", heap.avail(), heap.cap());
    Ok(())
}
