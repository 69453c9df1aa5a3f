//! Region Space - Process-Wide Region Heap
//!
//! Owns the address directory, the per-segmentation arena pools
//! (unmanaged and managed), and the physical memory budget. There is
//! exactly one region space per process, reached through [`space()`].
//!
//! The physical budget is an atomic counter checked before every
//! commit; a failed requirement invokes the consumer's rescue callback
//! (the starvation protocol) before giving up.

use crate::error::{MemError, Result};
use crate::os;
use crate::space::pool::ArenaClassPool;
use crate::space::{
    region_layout, Address, ArenaDescriptor, Directory, RegionLocation, ARENAS_PER_SPACE,
    ARENA_SIZE, BUFFER_SEGMENTATION, PAGE_SIZE, SEGMENTATION_COUNT, SEGMENTATION_MIN,
    SPACE_SIZE_L2, UNIT_SIZE,
};
use crate::util::align_up;
use lazy_static::lazy_static;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// A party that can be asked to free memory when the budget runs out.
pub trait MemoryConsumer: Sync {
    /// Called when `expected` more bytes are needed; implementations
    /// park until a cleanup cycle has freed enough (or give up).
    fn rescue_starving_situation(&self, expected: usize);
}

/// Consumer that cannot free anything (bootstrap paths, tests).
pub struct NoRescue;

impl MemoryConsumer for NoRescue {
    fn rescue_starving_situation(&self, _expected: usize) {}
}

/// Budget-check attempts; each failed attempt runs the rescue callback.
const REQUIRE_ATTEMPTS: u32 = 2;

/// The process-wide region heap
pub struct RegionSpace {
    directory: Directory,
    unmanaged: Box<[ArenaClassPool]>,
    managed: Box<[ArenaClassPool]>,

    /// Bytes currently committed through the OS shim
    used_physical: AtomicUsize,
    /// Process physical budget
    max_physical: AtomicUsize,
    /// Bytes of reserved (not necessarily committed) address space
    reserved_bytes: AtomicUsize,
    arena_count: AtomicUsize,

    /// Next arena reservation hint
    reserve_hint: AtomicUsize,

    /// Retention override from configuration; u32::MAX means none
    retention_override: AtomicU32,
}

lazy_static! {
    static ref SPACE: RegionSpace = RegionSpace::new();
}

/// The process-wide region space.
pub fn space() -> &'static RegionSpace {
    &SPACE
}

impl RegionSpace {
    fn new() -> Self {
        os::check_page_size();
        let make_pools = |managed: bool| -> Box<[ArenaClassPool]> {
            (0..SEGMENTATION_COUNT)
                .map(|i| ArenaClassPool::new(SEGMENTATION_MIN + i as u8, managed))
                .collect()
        };
        Self {
            directory: Directory::new(),
            unmanaged: make_pools(false),
            managed: make_pools(true),
            used_physical: AtomicUsize::new(0),
            max_physical: AtomicUsize::new(1 << 40),
            reserved_bytes: AtomicUsize::new(0),
            arena_count: AtomicUsize::new(0),
            reserve_hint: AtomicUsize::new(ARENA_SIZE),
            retention_override: AtomicU32::new(u32::MAX),
        }
    }

    #[inline]
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Pool serving one (segmentation, managed) pair.
    pub fn pool(&self, segmentation: u8, managed: bool) -> &ArenaClassPool {
        debug_assert!(segmentation >= SEGMENTATION_MIN);
        let index = (segmentation - SEGMENTATION_MIN) as usize;
        if managed {
            &self.managed[index]
        } else {
            &self.unmanaged[index]
        }
    }

    // ==================== Physical budget ====================

    /// Try to take `size` bytes from the physical budget.
    ///
    /// Invokes the consumer's rescue callback between attempts; returns
    /// false when the budget still does not fit afterwards.
    pub fn require_physical_bytes(&self, size: usize, consumer: &dyn MemoryConsumer) -> bool {
        for attempt in 0..REQUIRE_ATTEMPTS {
            let mut current = self.used_physical.load(Ordering::Relaxed);
            loop {
                let max = self.max_physical.load(Ordering::Relaxed);
                if current + size > max {
                    break;
                }
                match self.used_physical.compare_exchange_weak(
                    current,
                    current + size,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return true,
                    Err(actual) => current = actual,
                }
            }
            if attempt + 1 < REQUIRE_ATTEMPTS {
                log::debug!(
                    "physical budget exhausted (need {}, used {}), invoking rescue",
                    size,
                    current
                );
                consumer.rescue_starving_situation(size);
            }
        }
        false
    }

    /// Return `size` bytes to the physical budget.
    pub fn release_physical_bytes(&self, size: usize) {
        let previous = self.used_physical.fetch_sub(size, Ordering::AcqRel);
        debug_assert!(previous >= size, "physical counter underflow");
    }

    pub fn used_physical_bytes(&self) -> usize {
        self.used_physical.load(Ordering::Relaxed)
    }

    pub fn max_physical_bytes(&self) -> usize {
        self.max_physical.load(Ordering::Relaxed)
    }

    pub fn set_max_physical_bytes(&self, limit: usize) {
        self.max_physical.store(limit, Ordering::Relaxed);
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes.load(Ordering::Relaxed)
    }

    pub fn arena_count(&self) -> usize {
        self.arena_count.load(Ordering::Relaxed)
    }

    /// Retention override from configuration, if any.
    pub fn retention_override(&self) -> Option<u32> {
        match self.retention_override.load(Ordering::Relaxed) {
            u32::MAX => None,
            value => Some(value),
        }
    }

    pub fn set_retention_override(&self, retention: Option<u32>) {
        self.retention_override
            .store(retention.unwrap_or(u32::MAX), Ordering::Relaxed);
    }

    // ==================== Commit / decommit ====================

    /// Commit `bytes` (page-rounded) at `base`, charging the budget.
    pub fn commit_range(
        &self,
        base: usize,
        bytes: usize,
        consumer: &dyn MemoryConsumer,
    ) -> Result<()> {
        let bytes = align_up(bytes, PAGE_SIZE);
        if !self.require_physical_bytes(bytes, consumer) {
            return Err(MemError::OutOfPhysicalMemory {
                requested: bytes,
                available: self
                    .max_physical_bytes()
                    .saturating_sub(self.used_physical_bytes()),
            });
        }
        if let Err(err) = os::commit_memory(base, bytes) {
            self.release_physical_bytes(bytes);
            return Err(err);
        }
        Ok(())
    }

    /// Decommit `bytes` (page-rounded) at `base`, refunding the budget.
    pub fn decommit_range(&self, base: usize, bytes: usize) {
        let bytes = align_up(bytes, PAGE_SIZE);
        if let Err(err) = os::decommit_memory(base, bytes) {
            log::error!("decommit at {:#x}+{:#x} failed: {}", base, bytes, err);
            return;
        }
        self.release_physical_bytes(bytes);
    }

    // ==================== Arena management ====================

    /// Reserve a fresh arena and publish it in the directory.
    pub fn reserve_arena(
        &self,
        segmentation: u8,
        managed: bool,
    ) -> Result<&'static ArenaDescriptor> {
        let hint = self.reserve_hint.load(Ordering::Relaxed);
        let base = os::reserve_memory(hint, 1 << SPACE_SIZE_L2, ARENA_SIZE, ARENA_SIZE)?;
        self.reserve_hint
            .store(base + ARENA_SIZE, Ordering::Relaxed);

        let address = Address(base);
        let arena_id = address.arena_id();
        if arena_id == 0 {
            // Arena 0 stays forbidden so a null-adjacent pointer never
            // resolves.
            os::release_memory(base, ARENA_SIZE)?;
            return Err(MemError::OutOfVirtualMemory {
                requested: ARENA_SIZE,
            });
        }
        if self.directory.get(arena_id).is_some() {
            os::release_memory(base, ARENA_SIZE)?;
            return Err(MemError::Internal(format!(
                "fresh reservation overlaps installed arena {arena_id}"
            )));
        }

        let arena: &'static ArenaDescriptor = Box::leak(Box::new(ArenaDescriptor::new(
            base,
            arena_id,
            segmentation,
            managed,
        )));
        self.directory.install(arena);
        self.reserved_bytes.fetch_add(ARENA_SIZE, Ordering::Relaxed);
        let count = self.arena_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count * 2 >= ARENAS_PER_SPACE {
            log::warn!("directory is half full: {} of {} arenas", count, ARENAS_PER_SPACE);
        }
        Ok(arena)
    }

    // ==================== Region management ====================

    /// Allocate one region of `1 << segmentation` bytes.
    pub fn allocate_region(
        &self,
        segmentation: u8,
        layout: u8,
        sizing_id: u8,
        managed: bool,
        consumer: &dyn MemoryConsumer,
    ) -> Result<usize> {
        self.pool(segmentation, managed)
            .allocate_region(layout, sizing_id, self, consumer)
    }

    /// Release one region back to its pool.
    pub fn release_region(&self, base: usize, sizing_id: u8) {
        let location = match self.resolve(base) {
            Some(location) => location,
            None => {
                log::error!("release_region on unmapped address {:#x}", base);
                return;
            }
        };
        self.pool(location.arena.segmentation(), location.arena.is_managed())
            .release_region(base, sizing_id, self);
    }

    /// Allocate a buffer segment of at least `total_bytes`.
    ///
    /// Returns the base address and the number of unit regions covered.
    pub fn allocate_buffer(
        &self,
        total_bytes: usize,
        managed: bool,
        consumer: &dyn MemoryConsumer,
    ) -> Result<(usize, u32)> {
        let region_count = (align_up(total_bytes, UNIT_SIZE) / UNIT_SIZE) as u32;
        let commit_bytes = align_up(total_bytes, PAGE_SIZE);
        let base = self
            .pool(BUFFER_SEGMENTATION, managed)
            .allocate_buffer_run(region_count, commit_bytes, self, consumer)?;
        Ok((base, region_count))
    }

    /// Release a buffer segment.
    pub fn release_buffer(&self, base: usize, region_count: u32, committed_bytes: usize) {
        let location = match self.resolve(base) {
            Some(location) => location,
            None => {
                log::error!("release_buffer on unmapped address {:#x}", base);
                return;
            }
        };
        debug_assert_eq!(location.layout(), region_layout::BUFFER);
        self.pool(BUFFER_SEGMENTATION, location.arena.is_managed())
            .release_buffer_run(base, region_count, committed_bytes, self);
    }

    /// Drop all retention caches, returning their pages to the OS.
    ///
    /// Returns the number of bytes of physical memory freed.
    pub fn flush_caches(&self) -> usize {
        let before = self.used_physical_bytes();
        for pool in self.unmanaged.iter().chain(self.managed.iter()) {
            pool.flush_caches(self);
        }
        before.saturating_sub(self.used_physical_bytes())
    }

    // ==================== Lookup ====================

    /// Resolve a pointer to its region, if it lies in a mapped arena.
    #[inline]
    pub fn resolve(&self, ptr: usize) -> Option<RegionLocation> {
        RegionLocation::resolve(&self.directory, ptr)
    }

    /// Size in bytes of the region containing `ptr`.
    pub fn region_size_of(&self, ptr: usize) -> Option<usize> {
        self.resolve(ptr)
            .map(|location| location.arena.region_size())
    }

    /// Visit every object region in the space.
    pub fn foreach_object_region(
        &self,
        visitor: &mut dyn FnMut(&'static ArenaDescriptor, u32, u8) -> bool,
    ) {
        for pool in self.unmanaged.iter().chain(self.managed.iter()) {
            let mut stop = false;
            pool.foreach_region(&mut |arena, index, layout| {
                if region_layout::is_object(layout) && !visitor(arena, index, layout) {
                    stop = true;
                    return false;
                }
                true
            });
            if stop {
                return;
            }
        }
    }

    /// Validate the bookkeeping of every arena.
    pub fn validate_state(&self) -> Result<()> {
        for pool in self.unmanaged.iter().chain(self.managed.iter()) {
            pool.validate_state()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_round_trip() {
        let space = space();

        let base = space
            .allocate_region(SEGMENTATION_MIN, 3, 0, false, &NoRescue)
            .unwrap();
        assert!(space.used_physical_bytes() >= PAGE_SIZE);

        let location = space.resolve(base).unwrap();
        assert_eq!(location.layout(), 3);
        assert_eq!(location.region_base(), base);

        // Write into the committed region.
        unsafe { std::ptr::write_bytes(base as *mut u8, 0x5A, 64) };

        space.release_region(base, 0);
        assert!(space.validate_state().is_ok());
    }

    #[test]
    fn test_cached_region_reused() {
        let space = space();

        let base = space
            .allocate_region(SEGMENTATION_MIN, 7, 0, false, &NoRescue)
            .unwrap();
        space.release_region(base, 0);
        // Retention keeps the region warm; the next allocation of the
        // same sizing comes out of the cache already committed.
        let again = space
            .allocate_region(SEGMENTATION_MIN, 7, 0, false, &NoRescue)
            .unwrap();
        let location = space.resolve(again).unwrap();
        assert_eq!(location.layout(), 7);
        unsafe { std::ptr::write_bytes(again as *mut u8, 0x11, 16) };
        space.release_region(again, 0);
    }

    #[test]
    fn test_buffer_round_trip() {
        let space = space();

        let total = 3 * UNIT_SIZE + 12345;
        let (base, regions) = space.allocate_buffer(total, false, &NoRescue).unwrap();
        assert_eq!(regions, 4);

        let location = space.resolve(base).unwrap();
        assert_eq!(location.layout(), region_layout::BUFFER);
        // Interior regions carry the same tag and resolve to the head.
        let body = space.resolve(base + UNIT_SIZE).unwrap();
        assert_eq!(body.layout(), region_layout::BUFFER);
        assert_eq!(
            body.arena.buffer_run_head(body.region_index),
            location.region_index
        );

        // The committed span is writable end to end.
        unsafe {
            *(base as *mut u8) = 1;
            *((base + total - 1) as *mut u8) = 2;
        }

        space.release_buffer(base, regions, align_up(total, PAGE_SIZE));
        assert!(space.validate_state().is_ok());
        // Decommitted pages are no longer resident.
        let zone = crate::os::get_memory_zone_state(base);
        assert_ne!(zone.state, crate::os::ZoneState::Committed);
    }

    #[test]
    fn test_physical_budget_bookkeeping() {
        let space = space();
        let used = space.used_physical_bytes();
        assert!(space.require_physical_bytes(PAGE_SIZE, &NoRescue));
        assert_eq!(space.used_physical_bytes(), used + PAGE_SIZE);
        space.release_physical_bytes(PAGE_SIZE);
        assert_eq!(space.used_physical_bytes(), used);
    }
}
