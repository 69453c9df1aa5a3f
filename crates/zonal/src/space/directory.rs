//! Address Directory - O(1) Pointer to Region Lookup
//!
//! A single flat array of 8-byte entries, one per possible arena
//! (`2^16` entries, ~½ MiB), never resized. A zero entry means
//! "forbidden / unmapped". An arena is installed with one release
//! store after its descriptor is fully initialized; lookups load with
//! acquire ordering, so a non-zero entry always yields a usable
//! descriptor.
//!
//! Entry encoding:
//!
//! ```text
//! ┌─────────────────────────────────────┬─────────┬──────────────┐
//! │ descriptor address (bits 9..64)     │ managed │ segmentation │
//! │                                     │ bit 8   │ bits 0..8    │
//! └─────────────────────────────────────┴─────────┴──────────────┘
//! ```

use crate::space::{Address, ArenaDescriptor, ARENAS_PER_SPACE};
use std::sync::atomic::{AtomicU64, Ordering};

const SEGMENTATION_MASK: u64 = 0xFF;
const MANAGED_BIT: u64 = 1 << 8;
const REFERENCE_SHIFT: u32 = 9;

/// The process-wide arena directory
pub struct Directory {
    entries: Box<[AtomicU64]>,
}

impl Directory {
    /// Create an empty directory; every entry starts forbidden.
    pub fn new() -> Self {
        let entries: Box<[AtomicU64]> = (0..ARENAS_PER_SPACE).map(|_| AtomicU64::new(0)).collect();
        Self { entries }
    }

    /// Publish a fully initialized arena descriptor.
    ///
    /// The descriptor must live for the rest of the process; arenas are
    /// never destroyed.
    pub fn install(&self, arena: &'static ArenaDescriptor) {
        let ptr = arena as *const ArenaDescriptor as u64;
        debug_assert!(ptr < 1 << (64 - REFERENCE_SHIFT), "descriptor beyond encodable range");
        let bits = (ptr << REFERENCE_SHIFT)
            | (if arena.is_managed() { MANAGED_BIT } else { 0 })
            | (arena.segmentation() as u64 & SEGMENTATION_MASK);
        let entry = &self.entries[arena.index() as usize];
        debug_assert_eq!(entry.load(Ordering::Relaxed), 0, "arena installed twice");
        entry.store(bits, Ordering::Release);
    }

    /// Look up the arena covering `arena_id`, if any.
    #[inline]
    pub fn get(&self, arena_id: u16) -> Option<&'static ArenaDescriptor> {
        let bits = self.entries[arena_id as usize].load(Ordering::Acquire);
        if bits == 0 {
            return None;
        }
        let ptr = (bits >> REFERENCE_SHIFT) as *const ArenaDescriptor;
        Some(unsafe { &*ptr })
    }

    /// Managed flag without dereferencing the descriptor.
    #[inline]
    pub fn is_managed(&self, arena_id: u16) -> bool {
        self.entries[arena_id as usize].load(Ordering::Acquire) & MANAGED_BIT != 0
    }

    /// Iterate over all installed arenas.
    pub fn foreach_arena(&self, mut visitor: impl FnMut(&'static ArenaDescriptor) -> bool) {
        for id in 0..ARENAS_PER_SPACE {
            if let Some(arena) = self.get(id as u16) {
                if !visitor(arena) {
                    return;
                }
            }
        }
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

/// A resolved pointer: its arena and the region index inside it
#[derive(Clone, Copy)]
pub struct RegionLocation {
    pub arena: &'static ArenaDescriptor,
    pub region_index: u32,
}

impl RegionLocation {
    /// Resolve a pointer through the directory.
    #[inline]
    pub fn resolve(directory: &Directory, ptr: usize) -> Option<Self> {
        let address = Address(ptr);
        if ptr >= 1 << crate::space::SPACE_SIZE_L2 {
            return None;
        }
        let arena = directory.get(address.arena_id())?;
        let region_index = address.position() >> arena.segmentation();
        Some(Self {
            arena,
            region_index,
        })
    }

    /// Layout byte of the located region.
    #[inline]
    pub fn layout(&self) -> u8 {
        self.arena.layout(self.region_index)
    }

    /// Base address of the located region.
    #[inline]
    pub fn region_base(&self) -> usize {
        self.arena.region_base(self.region_index)
    }

    /// Byte offset of the pointer within its region.
    #[inline]
    pub fn offset_in_region(&self, ptr: usize) -> u32 {
        debug_assert!(ptr >= self.region_base() && ptr - self.region_base() < self.arena.region_size());
        (ptr - self.region_base()) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::ARENA_SIZE;

    fn leak_arena(index: u16, segmentation: u8, managed: bool) -> &'static ArenaDescriptor {
        Box::leak(Box::new(ArenaDescriptor::new(
            (index as usize) * ARENA_SIZE,
            index,
            segmentation,
            managed,
        )))
    }

    #[test]
    fn test_empty_entries_are_forbidden() {
        let directory = Directory::new();
        assert!(directory.get(0).is_none());
        assert!(directory.get(1234).is_none());
        assert!(!directory.is_managed(7));
    }

    #[test]
    fn test_install_and_lookup() {
        let directory = Directory::new();
        let arena = leak_arena(5, 20, true);

        directory.install(arena);

        let found = directory.get(5).unwrap();
        assert_eq!(found.index(), 5);
        assert_eq!(found.segmentation(), 20);
        assert!(directory.is_managed(5));
        assert!(directory.get(6).is_none());
    }

    #[test]
    fn test_region_location() {
        let directory = Directory::new();
        let arena = leak_arena(3, 22, false);
        directory.install(arena);

        let ptr = arena.base() + 5 * (1 << 22) + 0x123;
        let loc = RegionLocation::resolve(&directory, ptr).unwrap();
        assert_eq!(loc.region_index, 5);
        assert_eq!(loc.region_base(), arena.base() + 5 * (1 << 22));
        assert_eq!(loc.offset_in_region(ptr), 0x123);
    }

    #[test]
    fn test_resolve_outside_space() {
        let directory = Directory::new();
        assert!(RegionLocation::resolve(&directory, usize::MAX).is_none());
    }
}
