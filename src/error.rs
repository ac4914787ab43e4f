//! Error types for guestmem.

use thiserror::Error;

/// Result type alias using guestmem's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when creating or growing memory subsystems.
///
/// Out-of-memory on the allocation fast paths is value-returning
/// (`Option`/null-region convention); this type covers the slow paths:
/// subsystem creation and host memory acquisition.
#[derive(Error, Debug)]
pub enum Error {
    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid memory size: {0} bytes (must be > 0)")]
    InvalidMemorySize(usize),

    #[error("host region too small: {0} bytes")]
    RegionTooSmall(usize),

    #[error("host memory allocation failed: {0}")]
    HostAllocationFailed(String),

    #[error("not supported: {0}")]
    NotSupported(String),
}
