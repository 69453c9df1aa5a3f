//! Unix Virtual Memory Backend
//!
//! Reservation uses `mmap(PROT_NONE, MAP_NORESERVE)` so untouched
//! address space costs nothing; commit flips protection to read/write;
//! decommit drops the pages with `MADV_DONTNEED` and protects them
//! again. Zone queries use `mincore` residency bits.

use crate::error::{MemError, Result};
use crate::os::{MemoryZone, ZoneState};
use crate::space::PAGE_SIZE;
use crate::util::align_up;

/// Aligned-retry attempts before falling back to over-reserve.
const ALIGNED_RETRY_LIMIT: u32 = 8;

pub fn reserve_memory(base: usize, limit: usize, size: usize, align: usize) -> Result<usize> {
    let limit = if limit == 0 { 1usize << 48 } else { limit };
    let mut hint = base;

    // Ask for the aligned address directly; the kernel treats a non-zero
    // first argument as a hint and may answer anywhere.
    for _ in 0..ALIGNED_RETRY_LIMIT {
        let ptr = raw_reserve(hint, size)?;
        if ptr % align == 0 && ptr + size <= limit {
            return Ok(ptr);
        }
        raw_release(ptr, size)?;
        hint = align_up(ptr, align);
        if hint >= limit {
            break;
        }
    }

    // The walk did not converge; over-reserve and trim both ends.
    log::debug!(
        "aligned reservation walk exhausted (size={:#x} align={:#x}), over-reserving",
        size,
        align
    );
    let span = size + align;
    let raw = raw_reserve(0, span)?;
    let aligned = align_up(raw, align);
    let head = aligned - raw;
    let tail = span - head - size;
    if head > 0 {
        raw_release(raw, head)?;
    }
    if tail > 0 {
        raw_release(aligned + size, tail)?;
    }
    if aligned + size > limit {
        raw_release(aligned, size)?;
        return Err(MemError::OutOfVirtualMemory { requested: size });
    }
    Ok(aligned)
}

pub fn commit_memory(base: usize, size: usize) -> Result<()> {
    let rc = unsafe {
        libc::mprotect(
            base as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    if rc != 0 {
        return Err(MemError::Os(format!(
            "mprotect(RW) failed at {:#x}+{:#x}: {}",
            base,
            size,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

pub fn decommit_memory(base: usize, size: usize) -> Result<()> {
    unsafe {
        // DONTNEED drops the resident pages; the follow-up protection
        // change catches use-after-decommit in debug runs.
        let rc = libc::madvise(base as *mut libc::c_void, size, libc::MADV_DONTNEED);
        if rc != 0 {
            return Err(MemError::Os(format!(
                "madvise(DONTNEED) failed at {:#x}+{:#x}: {}",
                base,
                size,
                std::io::Error::last_os_error()
            )));
        }
        let rc = libc::mprotect(base as *mut libc::c_void, size, libc::PROT_NONE);
        if rc != 0 {
            return Err(MemError::Os(format!(
                "mprotect(NONE) failed at {:#x}+{:#x}: {}",
                base,
                size,
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

pub fn release_memory(base: usize, size: usize) -> Result<()> {
    raw_release(base, size)
}

pub fn get_memory_zone_state(address: usize) -> MemoryZone {
    let page = address & !(PAGE_SIZE - 1);
    let os_page = page_size::get();
    let probe_pages = PAGE_SIZE / os_page;
    let mut residency = vec![0u8; probe_pages];

    let rc = unsafe {
        libc::mincore(
            page as *mut libc::c_void,
            PAGE_SIZE,
            residency.as_mut_ptr() as *mut _,
        )
    };
    if rc != 0 {
        // ENOMEM means the range is not mapped at all.
        return MemoryZone {
            address: page,
            size: PAGE_SIZE,
            state: ZoneState::Free,
        };
    }

    let resident = residency.iter().any(|&bits| bits & 1 != 0);
    MemoryZone {
        address: page,
        size: PAGE_SIZE,
        state: if resident {
            ZoneState::Committed
        } else {
            ZoneState::Reserved
        },
    }
}

fn raw_reserve(hint: usize, size: usize) -> Result<usize> {
    let ptr = unsafe {
        libc::mmap(
            hint as *mut libc::c_void,
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(MemError::OutOfVirtualMemory { requested: size });
    }
    Ok(ptr as usize)
}

fn raw_release(base: usize, size: usize) -> Result<()> {
    let rc = unsafe { libc::munmap(base as *mut libc::c_void, size) };
    if rc != 0 {
        return Err(MemError::Os(format!(
            "munmap failed at {:#x}+{:#x}: {}",
            base,
            size,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}
