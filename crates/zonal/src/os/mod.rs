//! OS Memory Shim
//!
//! ============================================================================
//! RESERVE / COMMIT / DECOMMIT / RELEASE
//! ============================================================================
//!
//! The allocator works with reserved-but-uncommitted address space and
//! commits physical pages on demand:
//!
//! ```text
//! Reserve ──► Commit ──► Use ──► Decommit ──► Release
//!    │          │         │          │           │
//!    │          │         │          │           └── munmap / VirtualFree(RELEASE)
//!    │          │         │          └── madvise(DONTNEED)+mprotect(NONE)
//!    │          │         │              / VirtualFree(DECOMMIT)
//!    │          │         └── read/write
//!    │          └── mprotect(RW) / VirtualAlloc(COMMIT)
//!    └── mmap(PROT_NONE, NORESERVE) / VirtualAlloc(RESERVE)
//! ```
//!
//! Arena reservations must be naturally aligned (4 GiB to 4 GiB): the
//! shim retries at the aligned address above a misaligned grant, and
//! falls back to an over-reserve-and-trim when the walk does not
//! converge.
//!
//! All sizes passed to this module are multiples of the 64 KiB commit
//! page. The OS page size must divide it; this is asserted once at
//! startup.

use crate::error::Result;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as platform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as platform;

/// State of a virtual memory zone as reported by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneState {
    /// Not mapped at all
    Free,
    /// Reserved address space without resident pages
    Reserved,
    /// Mapped with resident (committed) pages
    Committed,
}

/// A queried zone: a run of pages sharing one state
#[derive(Debug, Clone, Copy)]
pub struct MemoryZone {
    pub address: usize,
    pub size: usize,
    pub state: ZoneState,
}

/// Assert once that the OS page size divides the 64 KiB commit page.
pub fn check_page_size() {
    let os_page = page_size::get();
    assert!(
        crate::space::PAGE_SIZE % os_page == 0,
        "OS page size {} does not divide the {} byte commit page",
        os_page,
        crate::space::PAGE_SIZE
    );
}

/// Reserve `size` bytes of address space aligned to `align`.
///
/// Searches upward from `base` (a hint, may be 0) and below `limit`
/// (0 means the whole 48-bit space). The reservation is not backed by
/// physical memory until committed.
pub fn reserve_memory(base: usize, limit: usize, size: usize, align: usize) -> Result<usize> {
    platform::reserve_memory(base, limit, size, align)
}

/// Commit physical memory for a reserved range.
pub fn commit_memory(base: usize, size: usize) -> Result<()> {
    platform::commit_memory(base, size)
}

/// Return physical memory to the OS, keeping the reservation.
pub fn decommit_memory(base: usize, size: usize) -> Result<()> {
    platform::decommit_memory(base, size)
}

/// Release a reservation entirely.
pub fn release_memory(base: usize, size: usize) -> Result<()> {
    platform::release_memory(base, size)
}

/// Query the state of the zone containing `address`.
pub fn get_memory_zone_state(address: usize) -> MemoryZone {
    platform::get_memory_zone_state(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::PAGE_SIZE;

    #[test]
    fn test_reserve_aligned() {
        let size = 4 * PAGE_SIZE;
        let base = reserve_memory(0, 0, size, PAGE_SIZE).unwrap();
        assert!(base != 0);
        assert_eq!(base % PAGE_SIZE, 0);
        release_memory(base, size).unwrap();
    }

    #[test]
    fn test_reserve_large_alignment() {
        // Arena-style reservation: aligned far beyond the OS granularity.
        let align = 1 << 26; // 64 MiB keeps the test light
        let base = reserve_memory(0, 0, align, align).unwrap();
        assert_eq!(base % align, 0);
        release_memory(base, align).unwrap();
    }

    #[test]
    fn test_commit_write_decommit() {
        let size = 2 * PAGE_SIZE;
        let base = reserve_memory(0, 0, size, PAGE_SIZE).unwrap();

        commit_memory(base, PAGE_SIZE).unwrap();
        unsafe {
            std::ptr::write_bytes(base as *mut u8, 0xAB, 128);
            assert_eq!(*(base as *const u8), 0xAB);
        }

        let zone = get_memory_zone_state(base);
        assert_eq!(zone.state, ZoneState::Committed);

        decommit_memory(base, PAGE_SIZE).unwrap();
        let zone = get_memory_zone_state(base);
        assert_ne!(zone.state, ZoneState::Committed);

        release_memory(base, size).unwrap();
    }

    #[test]
    fn test_zone_state_free() {
        // A page-aligned probe far outside any mapping.
        let size = PAGE_SIZE;
        let base = reserve_memory(0, 0, size, PAGE_SIZE).unwrap();
        release_memory(base, size).unwrap();
        let zone = get_memory_zone_state(base);
        assert_eq!(zone.state, ZoneState::Free);
    }
}
