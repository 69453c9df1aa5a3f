//! Arena Class Pool - Region Manager for One Segmentation
//!
//! One pool exists per (segmentation, managed) pair. It tracks the
//! arenas of that segmentation, hands out regions by first-fit over
//! their free runs, and keeps per-sizing retention caches of free
//! regions whose pages stay committed for quick reuse.

use crate::error::Result;
use crate::space::heap::{MemoryConsumer, RegionSpace};
use crate::space::{region_layout, ArenaDescriptor, PAGE_SIZE, PAGE_SIZE_L2};
use parking_lot::Mutex;

/// Number of sizing policies per segmentation
pub const SIZING_COUNT: usize = 2;

/// Committed-pages policy of a region sizing
#[derive(Debug, Clone, Copy)]
pub struct RegionSizing {
    /// Cached-free regions retained before pages are really released
    pub retention: u32,
    /// Pages committed when a region of this sizing is allocated
    pub committed_pages: u32,
}

/// Sizing table for one segmentation.
///
/// Sizing 0 commits the whole region; sizing 1 commits only the head
/// page, for consumers that populate the rest on demand. Retention is
/// derived from region size, not copied from any measured workload:
/// regions up to 512 KiB are cheap enough to keep warm.
pub fn region_sizing(segmentation: u8, sizing_id: u8) -> RegionSizing {
    let full_pages = if segmentation <= PAGE_SIZE_L2 as u8 {
        1
    } else {
        1u32 << (segmentation - PAGE_SIZE_L2 as u8)
    };
    match sizing_id {
        0 => RegionSizing {
            retention: if segmentation <= 19 { 64 } else { 0 },
            committed_pages: full_pages,
        },
        _ => RegionSizing {
            retention: 0,
            committed_pages: 1,
        },
    }
}

/// Bytes committed for a region of the given sizing
#[inline]
pub fn sizing_committed_bytes(segmentation: u8, sizing_id: u8) -> usize {
    region_sizing(segmentation, sizing_id).committed_pages as usize * PAGE_SIZE
}

/// Region manager for one (segmentation, managed) pair
pub struct ArenaClassPool {
    segmentation: u8,
    managed: bool,
    arenas: Mutex<Vec<&'static ArenaDescriptor>>,
    caches: [Mutex<Vec<usize>>; SIZING_COUNT],
}

impl ArenaClassPool {
    pub fn new(segmentation: u8, managed: bool) -> Self {
        Self {
            segmentation,
            managed,
            arenas: Mutex::new(Vec::new()),
            caches: [Mutex::new(Vec::new()), Mutex::new(Vec::new())],
        }
    }

    #[inline]
    pub fn segmentation(&self) -> u8 {
        self.segmentation
    }

    /// Allocate one region and commit its sizing's pages.
    ///
    /// The region's layout byte is set to `layout` before return.
    pub fn allocate_region(
        &self,
        layout: u8,
        sizing_id: u8,
        space: &RegionSpace,
        consumer: &dyn MemoryConsumer,
    ) -> Result<usize> {
        // Fast path: a cached region still has its pages committed.
        if let Some(base) = self.caches[sizing_id as usize].lock().pop() {
            let location = space
                .resolve(base)
                .expect("cached region lost its arena");
            location.arena.unmark_cached(location.region_index, layout);
            return Ok(base);
        }

        let (base, arena, index) = self.acquire_run(1, layout, space)?;
        let bytes = sizing_committed_bytes(self.segmentation, sizing_id);
        if let Err(err) = space.commit_range(base, bytes, consumer) {
            arena.free_run(index, 1);
            return Err(err);
        }
        Ok(base)
    }

    /// Allocate `region_count` consecutive regions for a buffer segment
    /// and commit exactly `commit_bytes` (page-rounded) from its base.
    ///
    /// Every covered region gets the buffer layout byte; the run's head
    /// offsets land in the arena side table during the allocation.
    pub fn allocate_buffer_run(
        &self,
        region_count: u32,
        commit_bytes: usize,
        space: &RegionSpace,
        consumer: &dyn MemoryConsumer,
    ) -> Result<usize> {
        let (base, arena, index) =
            self.acquire_run(region_count, region_layout::BUFFER, space)?;
        if let Err(err) = space.commit_range(base, commit_bytes, consumer) {
            arena.free_run(index, region_count);
            return Err(err);
        }
        Ok(base)
    }

    /// Return a region; cache it when the sizing's retention allows.
    pub fn release_region(&self, base: usize, sizing_id: u8, space: &RegionSpace) {
        let location = space.resolve(base).expect("released region has no arena");
        debug_assert_eq!(location.arena.segmentation(), self.segmentation);

        let sizing = region_sizing(self.segmentation, sizing_id);
        let retention = space.retention_override().unwrap_or(sizing.retention);
        {
            let mut cache = self.caches[sizing_id as usize].lock();
            if (cache.len() as u32) < retention {
                location.arena.mark_cached(location.region_index);
                cache.push(base);
                return;
            }
        }

        let bytes = sizing_committed_bytes(self.segmentation, sizing_id);
        space.decommit_range(base, bytes);
        location.arena.free_run(location.region_index, 1);
    }

    /// Return a buffer segment's regions and decommit its pages.
    pub fn release_buffer_run(
        &self,
        base: usize,
        region_count: u32,
        committed_bytes: usize,
        space: &RegionSpace,
    ) {
        let location = space.resolve(base).expect("released buffer has no arena");
        space.decommit_range(base, committed_bytes);
        location.arena.free_run(location.region_index, region_count);
    }

    /// Drop every cached region, decommitting its pages.
    ///
    /// Returns the number of regions released.
    pub fn flush_caches(&self, space: &RegionSpace) -> usize {
        let mut released = 0;
        for (sizing_id, cache) in self.caches.iter().enumerate() {
            let drained: Vec<usize> = std::mem::take(&mut *cache.lock());
            for base in drained {
                let location = space.resolve(base).expect("cached region has no arena");
                let bytes = sizing_committed_bytes(self.segmentation, sizing_id as u8);
                space.decommit_range(base, bytes);
                location.arena.release_cached(location.region_index);
                released += 1;
            }
        }
        released
    }

    /// Number of regions currently held by the retention caches.
    pub fn cached_count(&self) -> usize {
        self.caches.iter().map(|cache| cache.lock().len()).sum()
    }

    /// Find (or create) an arena with a free run of `length` regions.
    fn acquire_run(
        &self,
        length: u32,
        layout: u8,
        space: &RegionSpace,
    ) -> Result<(usize, &'static ArenaDescriptor, u32)> {
        loop {
            {
                let arenas = self.arenas.lock();
                for &arena in arenas.iter() {
                    if let Some(index) = arena.allocate_run(length, layout) {
                        return Ok((arena.region_base(index), arena, index));
                    }
                }
            }
            let arena = space.reserve_arena(self.segmentation, self.managed)?;
            log::info!(
                "reserved arena {} (segmentation {}, {})",
                arena.index(),
                self.segmentation,
                if self.managed { "managed" } else { "unmanaged" }
            );
            self.arenas.lock().push(arena);
        }
    }

    /// Validate all arenas of this pool.
    pub fn validate_state(&self) -> Result<()> {
        for arena in self.arenas.lock().iter() {
            arena.validate_state()?;
        }
        Ok(())
    }

    /// Visit every region of every arena in this pool.
    pub fn foreach_region(
        &self,
        visitor: &mut dyn FnMut(&'static ArenaDescriptor, u32, u8) -> bool,
    ) {
        let arenas: Vec<&'static ArenaDescriptor> = self.arenas.lock().clone();
        for arena in arenas {
            for index in 0..arena.region_count() {
                if !visitor(arena, index, arena.layout(index)) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizing_table() {
        let small = region_sizing(16, 0);
        assert_eq!(small.committed_pages, 1);
        assert!(small.retention > 0);

        let large = region_sizing(22, 0);
        assert_eq!(large.committed_pages, 64);
        assert_eq!(large.retention, 0);

        let head_only = region_sizing(22, 1);
        assert_eq!(head_only.committed_pages, 1);
    }

    #[test]
    fn test_sizing_committed_bytes() {
        assert_eq!(sizing_committed_bytes(16, 0), PAGE_SIZE);
        assert_eq!(sizing_committed_bytes(20, 0), 1 << 20);
    }
}
