//! Large-Object Tests
//!
//! Allocations above the slab ceiling get one buffer segment each;
//! freeing returns the physical pages to the OS.

mod common;

use common::{check_pattern, fill_pattern, setup};
use zonal::os::{get_memory_zone_state, ZoneState};
use zonal::space::region_layout;

#[test]
fn test_four_mib_round_trip() {
    setup();

    const SIZE: usize = 4 << 20;
    let ptr = zonal::malloc(SIZE);
    assert!(!ptr.is_null());

    // Sentinel at the last byte proves the whole span is committed.
    unsafe {
        *ptr.add(SIZE - 1) = 0x5C;
        assert_eq!(*ptr.add(SIZE - 1), 0x5C);
    }

    let infos = zonal::get_address_infos(ptr).unwrap();
    assert_eq!(infos.base, ptr as usize);
    assert_eq!(infos.usable_size, SIZE);
    assert_eq!(infos.layout_id, region_layout::BUFFER);

    let base = infos.base;
    unsafe { zonal::free(ptr) };

    // Decommitted: the payload page is no longer resident.
    let zone = get_memory_zone_state(base);
    assert_ne!(zone.state, ZoneState::Committed);
}

#[test]
fn test_interior_pointer_frees_whole_segment() {
    setup();

    const SIZE: usize = 6 << 20;
    let ptr = zonal::malloc(SIZE);
    fill_pattern(ptr, 4096, 0x21);
    assert!(check_pattern(ptr, 4096, 0x21));

    // Introspection agrees from deep inside the segment.
    let deep = unsafe { ptr.add(5 << 20) };
    let infos = zonal::get_address_infos(deep).unwrap();
    assert_eq!(infos.base, ptr as usize);
    assert_eq!(infos.usable_size, SIZE);

    // Freeing through the interior pointer releases everything.
    unsafe { zonal::free(deep) };
    assert!(zonal::get_address_infos(ptr).is_none());
}

#[test]
fn test_large_metadata_surfaces() {
    setup();

    let ptr = zonal::malloc_ex(1 << 20, 0xC0FF_EE00);
    let infos = zonal::get_address_infos(ptr).unwrap();
    assert_eq!(infos.meta, Some(0xC0FF_EE00));
    assert_eq!(infos.usable_size, 1 << 20);
    unsafe { zonal::free(ptr) };
}

#[test]
fn test_msize_of_large_object() {
    setup();

    let ptr = zonal::malloc(3 << 20);
    assert_eq!(unsafe { zonal::msize(ptr, None) }, 3 << 20);
    unsafe { zonal::free(ptr) };
}
