//! Debug logging utilities for guestmem.
//!
//! Set the `GUESTMEM_DEBUG` environment variable to enable verbose logging:
//! - `GUESTMEM_DEBUG=1` - Enable all debug output
//! - `GUESTMEM_DEBUG=pmm` - Enable only page-allocator logs
//! - `GUESTMEM_DEBUG=vm` - Enable only translation logs
//! - `GUESTMEM_DEBUG=kheap` - Enable only heap-allocator logs
//! - `GUESTMEM_DEBUG=pmm,kheap` - Enable multiple categories

use std::sync::OnceLock;

/// Debug categories that can be enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCategory {
    Pmm,
    Vm,
    Kheap,
    All,
}

/// Cached debug configuration
static DEBUG_CONFIG: OnceLock<DebugConfig> = OnceLock::new();

#[derive(Debug, Default)]
struct DebugConfig {
    enabled: bool,
    pmm: bool,
    vm: bool,
    kheap: bool,
}

impl DebugConfig {
    fn from_env() -> Self {
        match std::env::var("GUESTMEM_DEBUG") {
            Ok(val) if val == "1" || val.to_lowercase() == "all" => Self {
                enabled: true,
                pmm: true,
                vm: true,
                kheap: true,
            },
            Ok(val) => {
                let val_lower = val.to_lowercase();
                Self {
                    enabled: true,
                    pmm: val_lower.contains("pmm"),
                    vm: val_lower.contains("vm"),
                    kheap: val_lower.contains("kheap"),
                }
            }
            Err(_) => Self::default(),
        }
    }
}

fn get_config() -> &'static DebugConfig {
    DEBUG_CONFIG.get_or_init(DebugConfig::from_env)
}

/// Check if debug logging is enabled for a category
pub fn is_debug_enabled(category: DebugCategory) -> bool {
    let config = get_config();
    if !config.enabled {
        return false;
    }
    match category {
        DebugCategory::All => config.pmm || config.vm || config.kheap,
        DebugCategory::Pmm => config.pmm,
        DebugCategory::Vm => config.vm,
        DebugCategory::Kheap => config.kheap,
    }
}

/// Debug print macro for page-allocator logs
#[macro_export]
macro_rules! debug_pmm {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Pmm) {
            eprintln!("[pmm] {}", format_args!($($arg)*));
        }
    };
}

/// Debug print macro for translation logs
#[macro_export]
macro_rules! debug_vm {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Vm) {
            eprintln!("[vm] {}", format_args!($($arg)*));
        }
    };
}

/// Debug print macro for heap-allocator logs
#[macro_export]
macro_rules! debug_kheap {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Kheap) {
            eprintln!("[kheap] {}", format_args!($($arg)*));
        }
    };
}
