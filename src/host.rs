//! Host memory acquisition.
//!
//! The physical memory manager carves its managed region out of a single
//! contiguous allocation obtained from the operating system. This module
//! provides that allocation across platforms.

use crate::error::{Error, Result};

/// A contiguous region of host memory obtained from the operating system.
///
/// The memory is page-aligned and zero-initialized, and is released back to
/// the OS when the value is dropped.
pub struct HostMemory {
    /// Pointer to the allocated memory
    ptr: *mut u8,
    /// Size of the allocation in bytes
    size: usize,
}

// Safety: HostMemory owns its allocation and can be sent between threads
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
    /// Allocate a new host memory region.
    #[cfg(unix)]
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidMemorySize(size));
        }

        // Round up to the host page size
        let page_size = Self::page_size();
        let aligned_size = (size + page_size - 1) & !(page_size - 1);

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::HostAllocationFailed(format!(
                "mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size: aligned_size,
        })
    }

    /// Allocate a new host memory region.
    #[cfg(windows)]
    pub fn new(size: usize) -> Result<Self> {
        use windows::Win32::System::Memory::{
            VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE,
        };

        if size == 0 {
            return Err(Error::InvalidMemorySize(size));
        }

        let ptr = unsafe { VirtualAlloc(None, size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };

        if ptr.is_null() {
            return Err(Error::HostAllocationFailed(format!(
                "VirtualAlloc failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
        })
    }

    /// Get the host page size in bytes.
    #[cfg(unix)]
    pub fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    /// Get the host page size in bytes.
    #[cfg(windows)]
    pub fn page_size() -> usize {
        4096
    }

    /// Get a raw pointer to the memory region.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Get a mutable raw pointer to the memory region.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Get the size of the memory region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get a slice view of the memory region.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    /// Get a mutable slice view of the memory region.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }
}

impl Drop for HostMemory {
    #[cfg(unix)]
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }

    #[cfg(windows)]
    fn drop(&mut self) {
        use windows::Win32::System::Memory::{VirtualFree, MEM_RELEASE};

        if !self.ptr.is_null() {
            unsafe {
                let _ = VirtualFree(self.ptr as *mut core::ffi::c_void, 0, MEM_RELEASE);
            }
        }
    }
}
