//! C ABI called by instrumented code.
//!
//! The symbol names and signatures are fixed by the classifier. None of these functions
//! dereference the addresses they receive.

use crate::runtime;
use crate::{AccessSiteId, BufferId};
use std::ffi::c_void;

/// Registers a buffer.
///
/// `is_realloc` is non-zero when the buffer was returned by `realloc`.
#[unsafe(no_mangle)]
pub extern "C" fn store_buffer(buffer_id: u32, address: *mut c_void, size: u64, is_realloc: u64) {
    runtime::with_global(|rt| {
        rt.store_buffer(
            BufferId::new(buffer_id),
            address as usize,
            size,
            is_realloc != 0,
        )
    });
}

/// Registers `pointer_address` as an alias of the buffer at `base_address`.
#[unsafe(no_mangle)]
pub extern "C" fn store_buffer_pointer(
    buffer_id: u32,
    base_address: *mut c_void,
    pointer_address: *mut c_void,
    accessed_offset: u64,
) {
    runtime::with_global(|rt| {
        rt.store_buffer_pointer(
            BufferId::new(buffer_id),
            base_address as usize,
            pointer_address as usize,
            accessed_offset,
        )
    });
}

/// Records an access `accessed_offset` bytes into the buffer at `address`.
#[unsafe(no_mangle)]
pub extern "C" fn update_buffer(access_site_id: u64, address: *mut c_void, accessed_offset: u64) {
    runtime::with_global(|rt| {
        rt.update_buffer(
            AccessSiteId::new(access_site_id),
            address as usize,
            accessed_offset,
        )
    });
}

/// Initializes the runtime eagerly. Optional; the first instrumentation call does it too.
#[unsafe(no_mangle)]
pub extern "C" fn __bufmon_init() {
    runtime::with_global(|_| ());
}

/// Publishes the recorded distances now instead of at exit.
#[unsafe(no_mangle)]
pub extern "C" fn __bufmon_fini() {
    runtime::shutdown_global();
}
