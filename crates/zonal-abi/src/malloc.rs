//! Malloc-Family C ABI

use libc::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Fallback signature for `zonal_realloc` on unknown pointers.
pub type ReallocFallback = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;

/// Fallback signature for `zonal_msize` on unknown pointers.
pub type MsizeFallback = unsafe extern "C" fn(*mut c_void) -> usize;

/// Address introspection result, C layout.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
#[allow(non_camel_case_types)]
pub struct zonal_address_infos {
    pub base: *mut c_void,
    pub usable_size: usize,
    pub meta: u64,
    pub schema_id: u32,
    pub arena_id: u16,
    pub layout_id: u8,
    pub managed: u8,
    pub has_meta: u8,
}

fn shielded<T>(default: T, body: impl FnOnce() -> T) -> T {
    catch_unwind(AssertUnwindSafe(body)).unwrap_or(default)
}

/// Initialize the allocator (directory, central context, controller).
#[no_mangle]
pub extern "C" fn zonal_init_process() -> bool {
    shielded(false, || zonal::init().is_ok())
}

/// Report whether this build can interpose the platform allocator.
///
/// With the `interpose` feature the library exports the unprefixed
/// malloc family; linking or preloading it patches the platform
/// allocator without further calls.
#[no_mangle]
pub extern "C" fn zonal_patch_default_allocator() -> bool {
    cfg!(feature = "interpose")
}

/// Give the calling thread its own allocation context.
#[no_mangle]
pub extern "C" fn zonal_attach_current_thread() {
    shielded((), zonal::attach_current_thread);
}

/// Release the calling thread's context.
#[no_mangle]
pub extern "C" fn zonal_detach_current_thread() {
    shielded((), zonal::detach_current_thread);
}

#[no_mangle]
pub extern "C" fn zonal_malloc(size: usize) -> *mut c_void {
    shielded(std::ptr::null_mut(), || zonal::malloc(size) as *mut c_void)
}

#[no_mangle]
pub extern "C" fn zonal_malloc_ex(size: usize, meta: u64) -> *mut c_void {
    shielded(std::ptr::null_mut(), || {
        zonal::malloc_ex(size, meta) as *mut c_void
    })
}

#[no_mangle]
pub extern "C" fn zonal_calloc(count: usize, size: usize) -> *mut c_void {
    shielded(std::ptr::null_mut(), || {
        zonal::calloc(count, size) as *mut c_void
    })
}

/// Free an allocation. Null is a no-op; an unknown pointer is reported
/// and otherwise ignored.
#[no_mangle]
pub unsafe extern "C" fn zonal_free(ptr: *mut c_void) {
    shielded((), || unsafe { zonal::free(ptr as *mut u8) });
}

/// Usable size of an allocation; unknown pointers go to `fallback`.
#[no_mangle]
pub unsafe extern "C" fn zonal_msize(ptr: *mut c_void, fallback: Option<MsizeFallback>) -> usize {
    shielded(0, || {
        if ptr.is_null() {
            return 0;
        }
        if zonal::get_address_infos(ptr as *const u8).is_some() {
            unsafe { zonal::msize(ptr as *mut u8, None) }
        } else {
            match fallback {
                Some(fallback) => unsafe { fallback(ptr) },
                None => 0,
            }
        }
    })
}

/// Resize an allocation; unknown pointers go to `fallback`.
#[no_mangle]
pub unsafe extern "C" fn zonal_realloc(
    ptr: *mut c_void,
    size: usize,
    fallback: Option<ReallocFallback>,
) -> *mut c_void {
    shielded(std::ptr::null_mut(), || {
        if ptr.is_null() || zonal::get_address_infos(ptr as *const u8).is_some() {
            return unsafe { zonal::realloc(ptr as *mut u8, size, None) } as *mut c_void;
        }
        match fallback {
            Some(fallback) => unsafe { fallback(ptr, size) },
            None => std::ptr::null_mut(),
        }
    })
}

/// Reconcile the calling thread's caches.
#[no_mangle]
pub extern "C" fn zonal_flush_cache() {
    shielded((), zonal::flush_cache);
}

/// Introspect the allocation containing `ptr`. Returns false when the
/// pointer is not inside a live allocation.
#[no_mangle]
pub unsafe extern "C" fn zonal_get_address_infos(
    ptr: *const c_void,
    out: *mut zonal_address_infos,
) -> bool {
    shielded(false, || {
        if out.is_null() {
            return false;
        }
        match zonal::get_address_infos(ptr as *const u8) {
            Some(infos) => {
                let record = zonal_address_infos {
                    base: infos.base as *mut c_void,
                    usable_size: infos.usable_size,
                    meta: infos.meta.unwrap_or(0),
                    schema_id: infos.schema_id,
                    arena_id: infos.arena_id,
                    layout_id: infos.layout_id,
                    managed: infos.managed as u8,
                    has_meta: infos.meta.is_some() as u8,
                };
                unsafe { *out = record };
                true
            }
            None => false,
        }
    })
}

// ============================================================================
// PLATFORM INTERPOSITION
// ============================================================================

#[cfg(feature = "interpose")]
mod interpose {
    use super::*;

    #[no_mangle]
    pub extern "C" fn malloc(size: usize) -> *mut c_void {
        zonal_malloc(size)
    }

    #[no_mangle]
    pub extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
        zonal_calloc(count, size)
    }

    #[no_mangle]
    pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
        unsafe { zonal_realloc(ptr, size, None) }
    }

    #[no_mangle]
    pub unsafe extern "C" fn free(ptr: *mut c_void) {
        unsafe { zonal_free(ptr) }
    }

    #[no_mangle]
    pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
        unsafe { zonal_msize(ptr, None) }
    }
}
