//! Allocation API - Process-Wide Surface
//!
//! The functions here are what the C ABI crate wraps: the malloc
//! family, address introspection, and the managed-object surface
//! (schema allocation, reference counting, explicit roots).
//!
//! Requests route through the calling thread's context when one is
//! attached, and through the shared default context otherwise. Invalid
//! pointers never fault: they produce a diagnostic and either a no-op
//! (`free`), a fallback call (`realloc`, `msize`), or `None`
//! (`get_address_infos`).

use crate::analysis;
use crate::context::{
    check_padding, current_context, free_slab_slot, usable_size_of, MemoryContext,
};
use crate::controller;
use crate::objects::header::{ObjectHeader, ReleaseAction, FLAG_META};
use crate::objects::large::LargeSegment;
use crate::objects::layout::slot_index_of;
use crate::objects::region::ObjectRegion;
use crate::schemas::{schema, SchemaId};
use crate::space::{region_layout, space, Address};

/// Fallback for `realloc` on a pointer the allocator does not own.
pub type ReallocFallback = unsafe fn(*mut u8, usize) -> *mut u8;

/// Fallback for `msize` on a pointer the allocator does not own.
pub type MsizeFallback = unsafe fn(*mut u8) -> usize;

/// Everything introspection reveals about a live allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressInfos {
    /// Payload base address
    pub base: usize,
    /// Usable payload bytes
    pub usable_size: usize,
    /// Arena holding the allocation
    pub arena_id: u16,
    /// Whether the allocation lives in the managed heap
    pub managed: bool,
    /// Object class, or the buffer layout byte for large objects
    pub layout_id: u8,
    /// Schema of the object (0 = untyped)
    pub schema_id: u32,
    /// Metadata word attached at allocation, if any
    pub meta: Option<u64>,
}

/// A located allocation
enum ObjectLocation {
    Slab {
        region: ObjectRegion,
        index: u32,
        header: ObjectHeader,
    },
    Large {
        segment: LargeSegment,
        header: ObjectHeader,
    },
}

impl ObjectLocation {
    fn header(&self) -> ObjectHeader {
        match self {
            ObjectLocation::Slab { header, .. } => *header,
            ObjectLocation::Large { header, .. } => *header,
        }
    }
}

/// Locate the allocation containing `ptr`, if any.
fn locate_object(ptr: usize) -> Option<ObjectLocation> {
    let location = space().resolve(ptr)?;
    let layout = location.layout();
    if region_layout::is_object(layout) {
        let region = unsafe { ObjectRegion::from_base(location.region_base()) };
        let offset = (ptr - location.region_base()) as u32;
        let index = slot_index_of(region.infos(), offset)?;
        Some(ObjectLocation::Slab {
            region,
            index,
            header: region.slot_header(index),
        })
    } else if layout == region_layout::BUFFER {
        let segment = LargeSegment::find(ptr)?;
        Some(ObjectLocation::Large {
            segment,
            header: segment.object_header(),
        })
    } else {
        None
    }
}

/// Whether `ptr` points into a live allocation.
pub fn is_object_alive(ptr: usize) -> bool {
    locate_object(ptr).map_or(false, |location| location.header().is_used())
}

fn routing_context() -> &'static MemoryContext {
    current_context().unwrap_or_else(controller::default_context)
}

fn allocate(managed: bool, schema_id: u32, size: usize, meta: Option<u64>) -> *mut u8 {
    controller::ensure_initialized();
    match routing_context().allocate_object(managed, schema_id, size, meta) {
        Ok(payload) => payload as *mut u8,
        Err(err) => {
            log::error!("allocation of {} bytes failed: {}", size, err);
            std::ptr::null_mut()
        }
    }
}

// ============================================================================
// MALLOC FAMILY
// ============================================================================

/// Allocate `size` bytes. `malloc(0)` yields a unique minimal
/// allocation, consistently non-null.
pub fn malloc(size: usize) -> *mut u8 {
    allocate(false, 0, size, None)
}

/// Allocate `size` bytes with an opaque 64-bit metadata word, surfaced
/// again by [`get_address_infos`].
pub fn malloc_ex(size: usize, meta: u64) -> *mut u8 {
    allocate(false, 0, size, Some(meta))
}

/// Allocate a zeroed array. Recycled slots are zeroed explicitly; a
/// fresh commit already reads as zero.
pub fn calloc(count: usize, size: usize) -> *mut u8 {
    let total = match count.checked_mul(size) {
        Some(total) => total,
        None => {
            log::error!("calloc overflow: {} * {}", count, size);
            return std::ptr::null_mut();
        }
    };
    let ptr = malloc(total);
    if !ptr.is_null() {
        unsafe { std::ptr::write_bytes(ptr, 0, total) };
    }
    ptr
}

/// Free an allocation. `free(NULL)` is a no-op; an unknown pointer is
/// reported and otherwise ignored.
///
/// # Safety
/// `ptr` must not be used after this call, and no other thread may be
/// freeing the same allocation.
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    match locate_object(ptr as usize) {
        Some(ObjectLocation::Slab {
            region,
            index,
            header,
        }) => {
            if !header.is_used() {
                log::error!("double free of {:#x}", ptr as usize);
                return;
            }
            check_padding(header);
            header.clear();
            free_slab_slot(region, index);
        }
        Some(ObjectLocation::Large { segment, header }) => {
            check_padding(header);
            segment.free();
        }
        None => {
            log::warn!("free of unknown pointer {:#x}", ptr as usize);
        }
    }
}

/// Usable size of the allocation containing `ptr`; falls back for
/// unknown pointers (0 without a fallback).
///
/// # Safety
/// The fallback, if any, is called with the raw pointer.
pub unsafe fn msize(ptr: *mut u8, fallback: Option<MsizeFallback>) -> usize {
    if ptr.is_null() {
        return 0;
    }
    match locate_object(ptr as usize) {
        Some(location) if location.header().is_used() => usable_size_of(location.header()),
        _ => match fallback {
            Some(fallback) => fallback(ptr),
            None => 0,
        },
    }
}

/// Resize an allocation.
///
/// Shrinking returns the same pointer; growing allocates, copies the
/// old payload and frees the original. Unknown pointers go to the
/// fallback; without one the call fails (the original C implementation
/// cannot safely copy from a buffer it does not know).
///
/// # Safety
/// `ptr` must be valid (or null), per the malloc contract.
pub unsafe fn realloc(ptr: *mut u8, size: usize, fallback: Option<ReallocFallback>) -> *mut u8 {
    if ptr.is_null() {
        return malloc(size);
    }
    match locate_object(ptr as usize) {
        Some(location) if location.header().is_used() => {
            if size == 0 {
                free(ptr);
                return std::ptr::null_mut();
            }
            let usable = usable_size_of(location.header());
            if size <= usable {
                return ptr;
            }
            let fresh = malloc(size);
            if !fresh.is_null() {
                std::ptr::copy_nonoverlapping(ptr, fresh, usable);
                free(ptr);
            }
            fresh
        }
        _ => match fallback {
            Some(fallback) => fallback(ptr, size),
            None => {
                log::warn!("realloc of unknown pointer {:#x}", ptr as usize);
                std::ptr::null_mut()
            }
        },
    }
}

/// Reconcile the calling thread's caches: drain cross-thread frees,
/// return empty regions, trim the usable lists.
pub fn flush_cache() {
    controller::ensure_initialized();
    routing_context().scavenge(false);
}

/// Introspect the allocation containing `ptr`.
///
/// Any pointer within the same live allocation yields the same answer.
pub fn get_address_infos(ptr: *const u8) -> Option<AddressInfos> {
    let location = locate_object(ptr as usize)?;
    let header = location.header();
    if !header.is_used() {
        return None;
    }
    let meta = if header.flags() & FLAG_META != 0 {
        Some(unsafe { header.extra_word(0) })
    } else {
        None
    };
    let (managed, layout_id) = match &location {
        ObjectLocation::Slab { region, .. } => (region.is_managed(), region.layout_id()),
        ObjectLocation::Large { segment, .. } => {
            (segment.is_managed(), region_layout::BUFFER)
        }
    };
    Some(AddressInfos {
        base: header.payload(),
        usable_size: usable_size_of(header),
        arena_id: Address(ptr as usize).arena_id(),
        managed,
        layout_id,
        schema_id: header.schema_id(),
        meta,
    })
}

// ============================================================================
// MANAGED SURFACE
// ============================================================================

/// Allocate a managed object of `schema_id`'s base size. Participates
/// in reference counting and mark-and-sweep analysis.
pub fn new_managed(schema_id: SchemaId) -> *mut u8 {
    match schema(schema_id) {
        Some(descriptor) => allocate(true, schema_id, descriptor.base_size as usize, None),
        None => {
            log::error!("new_managed with unregistered schema {}", schema_id);
            std::ptr::null_mut()
        }
    }
}

/// Allocate an unmanaged object carrying a schema id (typed, but
/// excluded from analysis).
pub fn new_unmanaged(schema_id: SchemaId) -> *mut u8 {
    match schema(schema_id) {
        Some(descriptor) => allocate(false, schema_id, descriptor.base_size as usize, None),
        None => {
            log::error!("new_unmanaged with unregistered schema {}", schema_id);
            std::ptr::null_mut()
        }
    }
}

/// Take a hard reference on the object containing `ptr`.
///
/// # Safety
/// `ptr` must point into a live allocation.
pub unsafe fn retain(ptr: *const u8) {
    if let Some(location) = locate_object(ptr as usize) {
        location.header().retain();
    }
}

/// Drop a hard reference; the last one frees the object. Returns true
/// when the object was freed.
///
/// # Safety
/// The caller must own one hard reference.
pub unsafe fn release(ptr: *const u8) -> bool {
    match locate_object(ptr as usize) {
        Some(location) => {
            if location.header().release() == ReleaseAction::DisposeSlot {
                dispose(location);
                true
            } else {
                false
            }
        }
        None => false,
    }
}

/// Take a weak reference on the object containing `ptr`.
///
/// # Safety
/// `ptr` must point into a live allocation.
pub unsafe fn retain_weak(ptr: *const u8) {
    if let Some(location) = locate_object(ptr as usize) {
        location.header().retain_weak();
    }
}

/// Drop a weak reference; the last one on a dead object frees the slot
/// it was pinning. Returns true when the slot was freed.
///
/// # Safety
/// The caller must own one weak reference.
pub unsafe fn release_weak(ptr: *const u8) -> bool {
    match locate_object(ptr as usize) {
        Some(location) => {
            if location.header().release_weak() == ReleaseAction::DisposeSlot {
                dispose(location);
                true
            } else {
                false
            }
        }
        None => false,
    }
}

fn dispose(location: ObjectLocation) {
    match location {
        ObjectLocation::Slab {
            region,
            index,
            header,
        } => {
            header.clear();
            free_slab_slot(region, index);
        }
        ObjectLocation::Large { segment, .. } => segment.free(),
    }
}

// ============================================================================
// REFERENCE CELLS
// ============================================================================

/// Allocate a hard reference cell: an 8-byte slot holding `ptr`,
/// registered as a root for analysis and owning one hard reference.
///
/// # Safety
/// `ptr` must point into a live allocation.
pub unsafe fn new_hard_ref(ptr: *mut u8) -> *mut *mut u8 {
    let cell = malloc(8) as *mut usize;
    if cell.is_null() {
        return std::ptr::null_mut();
    }
    retain(ptr);
    *cell = ptr as usize;
    controller::register_hard_ref_cell(cell as usize);
    cell as *mut *mut u8
}

/// Release a hard reference cell created by [`new_hard_ref`].
///
/// # Safety
/// `cell` must come from `new_hard_ref` and not be used afterwards.
pub unsafe fn delete_hard_ref(cell: *mut *mut u8) {
    if cell.is_null() {
        return;
    }
    controller::unregister_hard_ref_cell(cell as usize);
    let target = *(cell as *const usize);
    if target != 0 {
        release(target as *const u8);
    }
    free(cell as *mut u8);
}

/// Allocate a weak reference cell: holds `ptr` without keeping it
/// alive; the cell reads as null once the target is swept.
///
/// # Safety
/// `ptr` must point into a live allocation.
pub unsafe fn new_weak_ref(ptr: *mut u8) -> *mut *mut u8 {
    let cell = malloc(8) as *mut usize;
    if cell.is_null() {
        return std::ptr::null_mut();
    }
    retain_weak(ptr);
    *cell = ptr as usize;
    controller::register_weak_ref_cell(cell as usize);
    cell as *mut *mut u8
}

/// Release a weak reference cell created by [`new_weak_ref`].
///
/// # Safety
/// `cell` must come from `new_weak_ref` and not be used afterwards.
pub unsafe fn delete_weak_ref(cell: *mut *mut u8) {
    if cell.is_null() {
        return;
    }
    controller::unregister_weak_ref_cell(cell as usize);
    let target = *(cell as *const usize);
    if target != 0 {
        release_weak(target as *const u8);
    }
    free(cell as *mut u8);
}

// ============================================================================
// EXPLICIT ROOTS AND THE WRITE BARRIER
// ============================================================================

/// Guard registering a managed object as a root of the calling thread.
///
/// The object stays reachable for analysis until the guard drops.
pub struct LocalRoot {
    context: &'static MemoryContext,
    ptr: usize,
}

impl LocalRoot {
    pub fn new(ptr: *const u8) -> Self {
        controller::ensure_initialized();
        let context = routing_context();
        context.push_local_root(ptr as usize);
        Self {
            context,
            ptr: ptr as usize,
        }
    }

    #[inline]
    pub fn get(&self) -> *const u8 {
        self.ptr as *const u8
    }
}

impl Drop for LocalRoot {
    fn drop(&mut self) {
        self.context.remove_local_root(self.ptr);
    }
}

/// Write barrier: call after storing `ptr` into a managed object while
/// a collection may be running.
#[inline]
pub fn mark_ptr(ptr: *const u8) {
    analysis::mark_ptr(ptr as usize);
}

// Re-exported context entry points.
pub use crate::context::{attach_current_thread, detach_current_thread};
