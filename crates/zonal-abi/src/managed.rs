//! Managed-Surface C ABI

use libc::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};

fn shielded<T>(default: T, body: impl FnOnce() -> T) -> T {
    catch_unwind(AssertUnwindSafe(body)).unwrap_or(default)
}

/// Register a traverser-less schema; returns its id, or 0 on failure.
///
/// Objects of such a schema are kept alive by roots and reference
/// counts but contribute no outgoing edges to the analysis. Schemas
/// with traversers are registered through the Rust API.
#[no_mangle]
pub extern "C" fn zonal_register_schema(base_size: u32) -> u32 {
    shielded(0, || {
        zonal::register_schema("c-schema", base_size, None).unwrap_or(0)
    })
}

/// Allocate a managed object of the schema's base size.
#[no_mangle]
pub extern "C" fn zonal_new_managed(schema_id: u32) -> *mut c_void {
    shielded(std::ptr::null_mut(), || {
        zonal::new_managed(schema_id) as *mut c_void
    })
}

/// Allocate an unmanaged object of the schema's base size.
#[no_mangle]
pub extern "C" fn zonal_new_unmanaged(schema_id: u32) -> *mut c_void {
    shielded(std::ptr::null_mut(), || {
        zonal::new_unmanaged(schema_id) as *mut c_void
    })
}

/// Take a hard reference on the object containing `ptr`.
#[no_mangle]
pub unsafe extern "C" fn zonal_retain(ptr: *const c_void) {
    shielded((), || unsafe { zonal::retain(ptr as *const u8) });
}

/// Drop a hard reference; returns true when the object was freed.
#[no_mangle]
pub unsafe extern "C" fn zonal_release(ptr: *const c_void) -> bool {
    shielded(false, || unsafe { zonal::release(ptr as *const u8) })
}

/// Take a weak reference on the object containing `ptr`.
#[no_mangle]
pub unsafe extern "C" fn zonal_retain_weak(ptr: *const c_void) {
    shielded((), || unsafe { zonal::retain_weak(ptr as *const u8) });
}

/// Drop a weak reference; returns true when the pinned slot was freed.
#[no_mangle]
pub unsafe extern "C" fn zonal_release_weak(ptr: *const c_void) -> bool {
    shielded(false, || unsafe { zonal::release_weak(ptr as *const u8) })
}

/// Allocate a hard reference cell holding `ptr` (a collection root).
#[no_mangle]
pub unsafe extern "C" fn zonal_new_hard_ref(ptr: *mut c_void) -> *mut *mut c_void {
    shielded(std::ptr::null_mut(), || {
        unsafe { zonal::api::new_hard_ref(ptr as *mut u8) as *mut *mut c_void }
    })
}

/// Allocate a weak reference cell holding `ptr`; reads as null once
/// the target is collected.
#[no_mangle]
pub unsafe extern "C" fn zonal_new_weak_ref(ptr: *mut c_void) -> *mut *mut c_void {
    shielded(std::ptr::null_mut(), || {
        unsafe { zonal::api::new_weak_ref(ptr as *mut u8) as *mut *mut c_void }
    })
}

/// Delete a cell created by `zonal_new_hard_ref`.
#[no_mangle]
pub unsafe extern "C" fn zonal_delete_hard_ref(cell: *mut *mut c_void) {
    shielded((), || unsafe {
        zonal::api::delete_hard_ref(cell as *mut *mut u8)
    });
}

/// Delete a cell created by `zonal_new_weak_ref`.
#[no_mangle]
pub unsafe extern "C" fn zonal_delete_weak_ref(cell: *mut *mut c_void) {
    shielded((), || unsafe {
        zonal::api::delete_weak_ref(cell as *mut *mut u8)
    });
}

/// Run one mark-and-sweep cycle; returns the number of objects swept.
#[no_mangle]
pub extern "C" fn zonal_collect() -> usize {
    shielded(0, zonal::mark_and_sweep_unused_objects)
}

/// Write barrier: record `ptr` as newly referenced while a collection
/// may be running.
#[no_mangle]
pub extern "C" fn zonal_mark_ptr(ptr: *const c_void) {
    shielded((), || zonal::api::mark_ptr(ptr as *const u8));
}
