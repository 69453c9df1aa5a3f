//! Large-Object Allocator - One Buffer Segment per Allocation
//!
//! Sizes above the slab ceiling bypass the object-region machinery:
//! each allocation gets its own run of unit-sized buffer regions with a
//! segment header at the base, followed by a normal object header so
//! the introspection and reference-count surfaces work unchanged.
//!
//! ```text
//! segment base
//! ┌────────────┬───────────────┬───────────────────────────┬─────────┐
//! │ head (64)  │ object header │ payload ...               │ guard   │
//! └────────────┴───────────────┴───────────────────────────┴─────────┘
//!   regions: [BUFFER][BUFFER][BUFFER]...
//! ```
//!
//! Every covered region carries the same buffer layout byte; the
//! arena's run side table records each region's offset to the segment
//! head, so freeing any pointer inside the segment resolves the base in
//! one lookup and releases all covered regions in one call.

use crate::error::Result;
use crate::objects::header::ObjectHeader;
use crate::space::{region_layout, space, MemoryConsumer, PAGE_SIZE};
use crate::util::align_up;

/// Fixed head of every buffer segment
pub const SEGMENT_HEAD_SIZE: usize = 64;

#[repr(C)]
struct LargeSegmentHeader {
    region_count: u32,
    managed: u8,
    _reserved: [u8; 3],
    committed_bytes: usize,
    usable_size: usize,
}

/// Handle to a large-object segment (its base address)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LargeSegment(usize);

unsafe impl Send for LargeSegment {}

impl LargeSegment {
    /// Allocate a segment for `payload_size` bytes plus instrumentation.
    pub fn allocate(
        payload_size: usize,
        extra_words: u32,
        padding: u32,
        managed: bool,
        consumer: &dyn MemoryConsumer,
    ) -> Result<Self> {
        let total = SEGMENT_HEAD_SIZE
            + 8
            + extra_words as usize * 8
            + payload_size
            + padding as usize;
        let (base, region_count) = space().allocate_buffer(total, managed, consumer)?;
        let committed_bytes = align_up(total, PAGE_SIZE);

        let header = base as *mut LargeSegmentHeader;
        unsafe {
            (*header).region_count = region_count;
            (*header).managed = managed as u8;
            (*header)._reserved = [0; 3];
            (*header).committed_bytes = committed_bytes;
            (*header).usable_size = payload_size;
        }
        log::debug!(
            "large segment at {:#x}: {} bytes over {} regions",
            base,
            total,
            region_count
        );
        Ok(Self(base))
    }

    /// Find the segment containing `ptr` through the arena's run side
    /// table.
    pub fn find(ptr: usize) -> Option<Self> {
        let location = space().resolve(ptr)?;
        if location.layout() != region_layout::BUFFER {
            return None;
        }
        let head = location.arena.buffer_run_head(location.region_index);
        Some(Self(location.arena.region_base(head)))
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.0
    }

    #[inline]
    fn header(&self) -> &LargeSegmentHeader {
        unsafe { &*(self.0 as *const LargeSegmentHeader) }
    }

    /// The object header stored right after the segment head.
    #[inline]
    pub fn object_header(&self) -> ObjectHeader {
        unsafe { ObjectHeader::at(self.0 + SEGMENT_HEAD_SIZE) }
    }

    #[inline]
    pub fn usable_size(&self) -> usize {
        self.header().usable_size
    }

    #[inline]
    pub fn is_managed(&self) -> bool {
        self.header().managed != 0
    }

    /// Release every region covered by this segment.
    pub fn free(self) {
        let header = self.header();
        let region_count = header.region_count;
        let committed_bytes = header.committed_bytes;
        space().release_buffer(self.0, region_count, committed_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::{get_memory_zone_state, ZoneState};
    use crate::space::NoRescue;

    #[test]
    fn test_allocate_write_free() {
        let segment = LargeSegment::allocate(4 << 20, 0, 0, false, &NoRescue).unwrap();
        segment.object_header().initialize(0, 0);

        let payload = segment.object_header().payload();
        unsafe {
            // Sentinel at the very last byte.
            *((payload + (4 << 20) - 1) as *mut u8) = 0xEE;
            assert_eq!(*((payload + (4 << 20) - 1) as *const u8), 0xEE);
        }
        assert_eq!(segment.usable_size(), 4 << 20);

        let base = segment.base();
        segment.free();
        // Pages returned to the OS.
        let zone = get_memory_zone_state(base);
        assert_ne!(zone.state, ZoneState::Committed);
    }

    #[test]
    fn test_find_from_interior_pointer() {
        let segment = LargeSegment::allocate(6 << 20, 0, 0, false, &NoRescue).unwrap();
        segment.object_header().initialize(0, 0);

        let payload = segment.object_header().payload();
        // Interior pointers in later regions still find the head.
        for offset in [0usize, 1 << 20, 5 << 20] {
            let found = LargeSegment::find(payload + offset).unwrap();
            assert_eq!(found, segment);
        }
        segment.free();
    }

    #[test]
    fn test_find_rejects_non_buffer() {
        assert!(LargeSegment::find(0x10).is_none());
    }
}
