//! Windows Virtual Memory Backend
//!
//! Reservation and commit map directly onto `VirtualAlloc` with
//! MEM_RESERVE / MEM_COMMIT; decommit is `VirtualFree(MEM_DECOMMIT)`,
//! release is `VirtualFree(MEM_RELEASE)`. Zone queries go through
//! `VirtualQuery`.

use crate::error::{MemError, Result};
use crate::os::{MemoryZone, ZoneState};
use crate::util::align_up;
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_DECOMMIT,
    MEM_FREE, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE,
};

/// Aligned-retry attempts before giving up on a hinted walk.
const ALIGNED_RETRY_LIMIT: u32 = 64;

pub fn reserve_memory(base: usize, limit: usize, size: usize, align: usize) -> Result<usize> {
    let limit = if limit == 0 { 1usize << 48 } else { limit };
    let mut hint = base;

    for _ in 0..ALIGNED_RETRY_LIMIT {
        let ptr =
            unsafe { VirtualAlloc(hint as *const _, size, MEM_RESERVE, PAGE_NOACCESS) } as usize;
        if ptr != 0 {
            if ptr % align == 0 && ptr + size <= limit {
                return Ok(ptr);
            }
            unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) };
            hint = align_up(ptr, align);
        } else {
            hint = hint.saturating_add(align);
        }
        if hint >= limit {
            break;
        }
    }

    Err(MemError::OutOfVirtualMemory { requested: size })
}

pub fn commit_memory(base: usize, size: usize) -> Result<()> {
    let ptr = unsafe { VirtualAlloc(base as *const _, size, MEM_COMMIT, PAGE_READWRITE) };
    if ptr.is_null() {
        return Err(MemError::Os(format!(
            "VirtualAlloc(COMMIT) failed at {:#x}+{:#x}",
            base, size
        )));
    }
    Ok(())
}

pub fn decommit_memory(base: usize, size: usize) -> Result<()> {
    let ok = unsafe { VirtualFree(base as *mut _, size, MEM_DECOMMIT) };
    if ok == 0 {
        return Err(MemError::Os(format!(
            "VirtualFree(DECOMMIT) failed at {:#x}+{:#x}",
            base, size
        )));
    }
    Ok(())
}

pub fn release_memory(base: usize, _size: usize) -> Result<()> {
    let ok = unsafe { VirtualFree(base as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        return Err(MemError::Os(format!("VirtualFree(RELEASE) failed at {:#x}", base)));
    }
    Ok(())
}

pub fn get_memory_zone_state(address: usize) -> MemoryZone {
    let mut infos: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
    let written = unsafe {
        VirtualQuery(
            address as *const _,
            &mut infos,
            std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if written == 0 {
        return MemoryZone {
            address,
            size: 0,
            state: ZoneState::Free,
        };
    }
    let state = match infos.State {
        MEM_COMMIT => ZoneState::Committed,
        MEM_FREE => ZoneState::Free,
        _ => ZoneState::Reserved,
    };
    MemoryZone {
        address: infos.BaseAddress as usize,
        size: infos.RegionSize,
        state,
    }
}
