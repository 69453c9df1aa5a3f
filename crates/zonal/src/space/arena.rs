//! Arena Descriptor - Region Table of One 4 GiB Reservation
//!
//! An arena is carved into `1 << (32 - segmentation)` equal regions.
//! The descriptor keeps one layout byte per region (readable lock-free
//! through the directory) and the free-run bookkeeping used by the
//! region manager: a side table where the first and last entries of
//! every free run carry the run's length, plus the rotating first-fit
//! scan cursor.
//!
//! Layout bytes are written with release ordering so a reader that
//! observed an object layout can safely interpret the region contents.

use crate::error::{MemError, Result};
use crate::space::{region_layout, ARENA_SIZE_L2};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// Descriptor of one reserved arena
///
/// Created once when the arena is reserved, published through the
/// directory, and never destroyed.
pub struct ArenaDescriptor {
    /// Base address of the reserved range (arena-aligned)
    base: usize,

    /// Arena index in the directory
    index: u16,

    /// log2 of the region size
    segmentation: u8,

    /// Managed arenas hold traceable object regions
    managed: bool,

    /// Free + cached region count; read lock-free by the analyzer
    availables_count: AtomicU32,

    /// One layout byte per region
    layouts: Box<[AtomicU8]>,

    /// Free-run bookkeeping, guarded by the arena allocation lock
    alloc: Mutex<ArenaAllocState>,
}

struct ArenaAllocState {
    /// Rotating first-fit cursor
    scan_position: u32,

    /// Run lengths, valid at the first and last region of each free run
    run_lengths: Box<[u32]>,
}

impl ArenaDescriptor {
    /// Create the descriptor for a freshly reserved arena.
    ///
    /// All regions start as one free run spanning the arena.
    pub fn new(base: usize, index: u16, segmentation: u8, managed: bool) -> Self {
        let count = 1usize << (ARENA_SIZE_L2 as u8 - segmentation);
        let layouts: Box<[AtomicU8]> = (0..count)
            .map(|_| AtomicU8::new(region_layout::FREE))
            .collect();
        let mut run_lengths = vec![0u32; count].into_boxed_slice();
        run_lengths[0] = count as u32;
        run_lengths[count - 1] = count as u32;

        Self {
            base,
            index,
            segmentation,
            managed,
            availables_count: AtomicU32::new(count as u32),
            layouts,
            alloc: Mutex::new(ArenaAllocState {
                scan_position: 0,
                run_lengths,
            }),
        }
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn index(&self) -> u16 {
        self.index
    }

    #[inline]
    pub fn segmentation(&self) -> u8 {
        self.segmentation
    }

    #[inline]
    pub fn is_managed(&self) -> bool {
        self.managed
    }

    /// Number of regions in this arena
    #[inline]
    pub fn region_count(&self) -> u32 {
        1u32 << (ARENA_SIZE_L2 as u8 - self.segmentation)
    }

    /// Region size in bytes
    #[inline]
    pub fn region_size(&self) -> usize {
        1usize << self.segmentation
    }

    /// Base address of region `index`
    #[inline]
    pub fn region_base(&self, index: u32) -> usize {
        self.base + ((index as usize) << self.segmentation)
    }

    /// Layout byte of region `index`
    #[inline]
    pub fn layout(&self, index: u32) -> u8 {
        self.layouts[index as usize].load(Ordering::Acquire)
    }

    /// Write the layout byte of region `index`
    #[inline]
    pub fn set_layout(&self, index: u32, layout: u8) {
        self.layouts[index as usize].store(layout, Ordering::Release);
    }

    /// Free + cached regions, as maintained by the run bookkeeping
    #[inline]
    pub fn availables_count(&self) -> u32 {
        self.availables_count.load(Ordering::Relaxed)
    }

    /// Allocate a run of `length` consecutive free regions.
    ///
    /// First-fit from the rotating scan cursor; the new regions' layout
    /// bytes are set to `layout`. Returns the first region index.
    pub fn allocate_run(&self, length: u32, layout: u8) -> Option<u32> {
        debug_assert!(length > 0);
        let count = self.region_count();
        let mut state = self.alloc.lock();

        let origin = if state.scan_position >= count {
            0
        } else {
            state.scan_position
        };

        // Two passes make the cursor rotation a plain forward walk.
        let found = self
            .scan_for_run(&state, origin, count, length)
            .or_else(|| self.scan_for_run(&state, 0, origin, length));
        let start = found?;

        let run_len = state.run_lengths[start as usize];
        debug_assert!(run_len >= length);

        // Split the head off the run.
        let remainder = run_len - length;
        if remainder > 0 {
            let new_start = start + length;
            state.run_lengths[new_start as usize] = remainder;
            state.run_lengths[(start + run_len - 1) as usize] = remainder;
        }
        if layout == region_layout::BUFFER {
            // Buffer runs keep their head offset in the side table so
            // any covered region resolves back to the segment base.
            for i in 0..length {
                state.run_lengths[(start + i) as usize] = i;
            }
        }
        for i in start..start + length {
            self.layouts[i as usize].store(layout, Ordering::Release);
        }
        self.availables_count.fetch_sub(length, Ordering::Relaxed);
        state.scan_position = start + length;
        Some(start)
    }

    /// First region of the buffer segment covering region `index`.
    pub fn buffer_run_head(&self, index: u32) -> u32 {
        debug_assert_eq!(
            self.layouts[index as usize].load(Ordering::Relaxed),
            region_layout::BUFFER
        );
        let state = self.alloc.lock();
        index - state.run_lengths[index as usize]
    }

    /// Walk `[from, to)` for the start of a free run of at least `length`.
    fn scan_for_run(&self, state: &ArenaAllocState, from: u32, to: u32, length: u32) -> Option<u32> {
        let mut index = from;
        while index < to {
            if self.layouts[index as usize].load(Ordering::Relaxed) != region_layout::FREE {
                index += 1;
                continue;
            }
            // Only run starts carry a valid length; an interior entry
            // belongs to a run that started before `from` and is found
            // by the wrapped pass.
            if index > 0 && self.layouts[(index - 1) as usize].load(Ordering::Relaxed) == region_layout::FREE {
                index += 1;
                continue;
            }
            let run_len = state.run_lengths[index as usize];
            if run_len >= length {
                return Some(index);
            }
            index += run_len;
        }
        None
    }

    /// Return a run of regions to the free state, coalescing with
    /// adjacent free runs.
    pub fn free_run(&self, start: u32, length: u32) {
        debug_assert!(length > 0);
        let count = self.region_count();
        debug_assert!(start + length <= count);
        let mut state = self.alloc.lock();

        let mut run_start = start;
        let mut run_len = length;

        // Coalesce left: the tail marker of the left run sits at start-1.
        if start > 0 && self.layouts[(start - 1) as usize].load(Ordering::Relaxed) == region_layout::FREE {
            let left_len = state.run_lengths[(start - 1) as usize];
            run_start = start - left_len;
            run_len += left_len;
        }
        // Coalesce right: the head marker of the right run sits at start+length.
        let right = start + length;
        if right < count && self.layouts[right as usize].load(Ordering::Relaxed) == region_layout::FREE {
            run_len += state.run_lengths[right as usize];
        }

        for i in start..start + length {
            self.layouts[i as usize].store(region_layout::FREE, Ordering::Release);
        }
        state.run_lengths[run_start as usize] = run_len;
        state.run_lengths[(run_start + run_len - 1) as usize] = run_len;
        self.availables_count.fetch_add(length, Ordering::Relaxed);
    }

    /// Move one free region into the cached state (counts as available).
    pub fn mark_cached(&self, index: u32) {
        self.layouts[index as usize].store(region_layout::CACHED, Ordering::Release);
        self.availables_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a cached region out of the available pool.
    pub fn unmark_cached(&self, index: u32, layout: u8) {
        debug_assert_eq!(
            self.layouts[index as usize].load(Ordering::Relaxed),
            region_layout::CACHED
        );
        self.layouts[index as usize].store(layout, Ordering::Release);
        self.availables_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Return a cached region to the free state.
    pub fn release_cached(&self, index: u32) {
        debug_assert_eq!(
            self.layouts[index as usize].load(Ordering::Relaxed),
            region_layout::CACHED
        );
        // The cached region already counted as available; free_run
        // re-adds it, so balance the counter first.
        self.availables_count.fetch_sub(1, Ordering::Relaxed);
        self.free_run(index, 1);
    }

    /// Verify the free-run bookkeeping against the layout table.
    ///
    /// `availables_count` must equal the number of free and cached
    /// entries, and every free run must carry its length at both ends.
    pub fn validate_state(&self) -> Result<()> {
        let state = self.alloc.lock();
        let count = self.region_count();
        let mut available = 0u32;
        let mut index = 0u32;

        while index < count {
            let layout = self.layouts[index as usize].load(Ordering::Relaxed);
            if layout == region_layout::CACHED {
                available += 1;
                index += 1;
                continue;
            }
            if layout != region_layout::FREE {
                index += 1;
                continue;
            }
            // Measure the run directly and compare both markers.
            let mut end = index;
            while end < count && self.layouts[end as usize].load(Ordering::Relaxed) == region_layout::FREE {
                end += 1;
            }
            let run_len = end - index;
            if state.run_lengths[index as usize] != run_len
                || state.run_lengths[(end - 1) as usize] != run_len
            {
                return Err(MemError::Corruption(format!(
                    "arena {}: run at {} has markers {}/{} for actual length {}",
                    self.index,
                    index,
                    state.run_lengths[index as usize],
                    state.run_lengths[(end - 1) as usize],
                    run_len
                )));
            }
            available += run_len;
            index = end;
        }

        let tracked = self.availables_count.load(Ordering::Relaxed);
        if tracked != available {
            return Err(MemError::Corruption(format!(
                "arena {}: availables_count {} != counted {}",
                self.index, tracked, available
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_arena() -> ArenaDescriptor {
        // Segmentation 26 in a fake arena: 64 regions, no OS interaction.
        ArenaDescriptor::new(0x1_0000_0000, 1, 26, false)
    }

    #[test]
    fn test_initial_state() {
        let arena = test_arena();
        assert_eq!(arena.region_count(), 64);
        assert_eq!(arena.availables_count(), 64);
        assert!(arena.validate_state().is_ok());
    }

    #[test]
    fn test_allocate_and_free_single() {
        let arena = test_arena();

        let idx = arena.allocate_run(1, 5).unwrap();
        assert_eq!(arena.layout(idx), 5);
        assert_eq!(arena.availables_count(), 63);
        assert!(arena.validate_state().is_ok());

        arena.free_run(idx, 1);
        assert_eq!(arena.layout(idx), region_layout::FREE);
        assert_eq!(arena.availables_count(), 64);
        assert!(arena.validate_state().is_ok());
    }

    #[test]
    fn test_allocate_run_of_regions() {
        let arena = test_arena();

        let idx = arena.allocate_run(8, region_layout::BUFFER).unwrap();
        for i in idx..idx + 8 {
            assert_eq!(arena.layout(i), region_layout::BUFFER);
            // Every covered region resolves back to the run's head.
            assert_eq!(arena.buffer_run_head(i), idx);
        }
        assert_eq!(arena.availables_count(), 56);
        assert!(arena.validate_state().is_ok());
    }

    #[test]
    fn test_coalescing_preserves_markers() {
        let arena = test_arena();

        let a = arena.allocate_run(4, 1).unwrap();
        let b = arena.allocate_run(4, 2).unwrap();
        let c = arena.allocate_run(4, 3).unwrap();
        assert_eq!(b, a + 4);
        assert_eq!(c, b + 4);

        // Free outer runs first, then the middle one merges all three.
        arena.free_run(a, 4);
        assert!(arena.validate_state().is_ok());
        arena.free_run(c, 4);
        assert!(arena.validate_state().is_ok());
        arena.free_run(b, 4);
        assert!(arena.validate_state().is_ok());
        assert_eq!(arena.availables_count(), 64);
    }

    #[test]
    fn test_exhaustion() {
        let arena = test_arena();

        for _ in 0..64 {
            assert!(arena.allocate_run(1, 7).is_some());
        }
        assert!(arena.allocate_run(1, 7).is_none());
        assert_eq!(arena.availables_count(), 0);
        assert!(arena.validate_state().is_ok());
    }

    #[test]
    fn test_rotating_cursor_wraps() {
        let arena = test_arena();

        let first = arena.allocate_run(60, 9).unwrap();
        assert_eq!(first, 0);
        // Cursor now near the end; a 4-region run still fits.
        let tail = arena.allocate_run(4, 9).unwrap();
        assert_eq!(tail, 60);
        arena.free_run(first, 60);
        // Cursor is past the end; the wrapped pass finds the head run.
        let wrapped = arena.allocate_run(2, 9).unwrap();
        assert_eq!(wrapped, 0);
        assert!(arena.validate_state().is_ok());
    }

    #[test]
    fn test_cached_regions_stay_available() {
        let arena = test_arena();

        let idx = arena.allocate_run(1, 5).unwrap();
        assert_eq!(arena.availables_count(), 63);

        arena.mark_cached(idx);
        assert_eq!(arena.availables_count(), 64);
        assert!(arena.validate_state().is_ok());

        arena.unmark_cached(idx, 6);
        assert_eq!(arena.layout(idx), 6);
        assert_eq!(arena.availables_count(), 63);
        assert!(arena.validate_state().is_ok());
    }
}
