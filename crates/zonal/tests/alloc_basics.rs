//! Allocation Surface Tests
//!
//! The malloc family, size-class routing, realloc laws and address
//! introspection, exercised through the public API.

mod common;

use common::{check_pattern, fill_pattern, setup};
use zonal::space::region_layout;

#[test]
fn test_malloc_free_round_trip() {
    setup();

    let ptr = zonal::malloc(100);
    assert!(!ptr.is_null());
    fill_pattern(ptr, 100, 7);
    assert!(check_pattern(ptr, 100, 7));
    unsafe { zonal::free(ptr) };
}

#[test]
fn test_malloc_zero_is_unique_and_non_null() {
    setup();

    let a = zonal::malloc(0);
    let b = zonal::malloc(0);
    assert!(!a.is_null());
    assert!(!b.is_null());
    assert_ne!(a, b);
    unsafe {
        zonal::free(a);
        zonal::free(b);
    }
}

#[test]
fn test_free_null_is_noop() {
    setup();
    unsafe { zonal::free(std::ptr::null_mut()) };
}

#[test]
fn test_free_unknown_pointer_is_noop() {
    setup();
    // A stack address is in no arena; free reports and ignores it.
    let local = 0u64;
    unsafe { zonal::free(&local as *const u64 as *mut u8) };
}

#[test]
fn test_calloc_zeroes_recycled_memory() {
    setup();

    // Dirty a slot, free it, then calloc into (likely) the same class.
    let dirty = zonal::malloc(64);
    fill_pattern(dirty, 64, 0xAA);
    unsafe { zonal::free(dirty) };

    let ptr = zonal::calloc(8, 8);
    assert!(!ptr.is_null());
    assert!((0..64).all(|i| unsafe { *ptr.add(i) } == 0));
    unsafe { zonal::free(ptr) };
}

#[test]
fn test_calloc_overflow_fails() {
    setup();
    assert!(zonal::calloc(usize::MAX, 2).is_null());
}

#[test]
fn test_msize_covers_request() {
    setup();

    for size in [1usize, 8, 100, 4096, 100_000] {
        let ptr = zonal::malloc(size);
        assert!(!ptr.is_null());
        let usable = unsafe { zonal::msize(ptr, None) };
        assert!(usable >= size, "msize {} < requested {}", usable, size);
        unsafe { zonal::free(ptr) };
    }
}

#[test]
fn test_msize_unknown_uses_fallback() {
    setup();

    unsafe fn fallback(_ptr: *mut u8) -> usize {
        4242
    }
    let local = 0u64;
    let size = unsafe { zonal::msize(&local as *const u64 as *mut u8, Some(fallback)) };
    assert_eq!(size, 4242);
}

// ==================== Size-class routing ====================

#[test]
fn test_boundary_sizes_route_to_fitting_classes() {
    setup();

    // Below, at and above selected class boundaries: the allocation
    // must always land in a class whose usable size covers the request.
    for &size in &[
        1usize, 7, 8, 9, 16, 56, 57, 255, 256, 257, 4095, 4096, 4097, 65535, 65536, 65537,
        262144,
    ] {
        let ptr = zonal::malloc(size);
        assert!(!ptr.is_null(), "malloc({}) failed", size);
        let infos = zonal::get_address_infos(ptr).unwrap();
        assert!(infos.usable_size >= size);
        assert!(
            region_layout::is_object(infos.layout_id),
            "size {} left the slab path",
            size
        );
        unsafe { zonal::free(ptr) };
    }
}

#[test]
fn test_sizes_above_slab_ceiling_use_large_objects() {
    setup();

    // 512 KiB minus the header still fits the last slab class; anything
    // above falls through to the large-object allocator.
    let slab = zonal::malloc(512 * 1024 - 8);
    let infos = zonal::get_address_infos(slab).unwrap();
    assert!(region_layout::is_object(infos.layout_id));
    unsafe { zonal::free(slab) };

    let large = zonal::malloc(512 * 1024);
    let infos = zonal::get_address_infos(large).unwrap();
    assert_eq!(infos.layout_id, region_layout::BUFFER);
    unsafe { zonal::free(large) };
}

// ==================== Realloc laws ====================

#[test]
fn test_realloc_shrink_in_place() {
    setup();

    let ptr = zonal::malloc(1000);
    fill_pattern(ptr, 1000, 3);
    let same = unsafe { zonal::realloc(ptr, 100, None) };
    assert_eq!(same, ptr);
    assert!(check_pattern(same, 100, 3));
    unsafe { zonal::free(same) };
}

#[test]
fn test_realloc_grow_copies_payload() {
    setup();

    let ptr = zonal::malloc(100);
    fill_pattern(ptr, 100, 11);
    let usable = unsafe { zonal::msize(ptr, None) };

    let grown = unsafe { zonal::realloc(ptr, usable * 4, None) };
    assert!(!grown.is_null());
    assert_ne!(grown, ptr);
    assert!(check_pattern(grown, 100, 11));
    unsafe { zonal::free(grown) };
}

#[test]
fn test_realloc_null_allocates() {
    setup();

    let ptr = unsafe { zonal::realloc(std::ptr::null_mut(), 64, None) };
    assert!(!ptr.is_null());
    unsafe { zonal::free(ptr) };
}

#[test]
fn test_realloc_zero_frees() {
    setup();

    let ptr = zonal::malloc(64);
    let gone = unsafe { zonal::realloc(ptr, 0, None) };
    assert!(gone.is_null());
}

// ==================== Address introspection ====================

#[test]
fn test_introspection_from_interior_pointers() {
    setup();

    let ptr = zonal::malloc_ex(100, 0xFEED_F00D_u64);
    let infos = zonal::get_address_infos(ptr).unwrap();
    assert_eq!(infos.base, ptr as usize);
    assert!(infos.usable_size >= 100);
    assert_eq!(infos.meta, Some(0xFEED_F00D));

    // Every interior pointer reports the same allocation.
    for delta in [0usize, 1, 50, 99] {
        let inner = unsafe { ptr.add(delta) };
        assert_eq!(zonal::get_address_infos(inner), Some(infos));
    }
    unsafe { zonal::free(ptr) };
}

#[test]
fn test_introspection_slot_geometry() {
    setup();

    // Neighbouring allocations of one class sit multiplier bytes apart
    // and introspect independently.
    let a = zonal::malloc(40);
    let b = zonal::malloc(40);
    let infos_a = zonal::get_address_infos(a).unwrap();
    let infos_b = zonal::get_address_infos(b).unwrap();
    assert_ne!(infos_a.base, infos_b.base);
    assert_eq!(infos_a.usable_size, infos_b.usable_size);
    assert_eq!(infos_a.layout_id, infos_b.layout_id);
    unsafe {
        zonal::free(a);
        zonal::free(b);
    }
}

#[test]
fn test_introspection_rejects_dead_and_foreign() {
    setup();

    let ptr = zonal::malloc(64);
    unsafe { zonal::free(ptr) };
    assert!(zonal::get_address_infos(ptr).is_none());

    let local = 0u64;
    assert!(zonal::get_address_infos(&local as *const u64 as *const u8).is_none());
}

#[test]
fn test_metadata_absent_without_malloc_ex() {
    setup();

    let ptr = zonal::malloc(64);
    let infos = zonal::get_address_infos(ptr).unwrap();
    assert_eq!(infos.meta, None);
    assert_eq!(infos.schema_id, 0);
    assert!(!infos.managed);
    unsafe { zonal::free(ptr) };
}
