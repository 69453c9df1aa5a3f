//! Object Header - One Word Preceding Every Allocation
//!
//! Header word layout (64 bits):
//!
//! ```text
//! ┌────────┬───────────────┬───────────┬──────┬────────────────┐
//! │ flags  │ hard_refs     │ weak_refs │ used │ schema_id      │
//! │ 56..64 │ 32..56        │ 25..32    │  24  │ 0..24          │
//! └────────┴───────────────┴───────────┴──────┴────────────────┘
//! ```
//!
//! `used` is the liveness bit; `schema_id == 0` means untyped. The
//! flag bits record which instrumentation words sit between the header
//! and the payload (metadata, timestamp, stack stamp) and whether a
//! guard padding follows the payload.
//!
//! All reference-count updates are acq_rel; the first release that
//! brings both counts to zero wins the disposal.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Field offsets and masks
pub const SCHEMA_MASK: u64 = 0xFF_FFFF;
pub const USED_BIT: u64 = 1 << 24;
pub const WEAK_SHIFT: u32 = 25;
pub const WEAK_UNIT: u64 = 1 << WEAK_SHIFT;
pub const WEAK_MASK: u64 = 0x7F << WEAK_SHIFT;
pub const HARD_SHIFT: u32 = 32;
pub const HARD_UNIT: u64 = 1 << HARD_SHIFT;
pub const HARD_MASK: u64 = 0xFF_FFFF << HARD_SHIFT;
pub const FLAGS_SHIFT: u32 = 56;

/// Flag bits (stored in the top byte)
pub const FLAG_META: u8 = 0x01;
pub const FLAG_TIME_STAMP: u8 = 0x02;
pub const FLAG_STACK_STAMP: u8 = 0x04;
pub const FLAG_PADDING: u8 = 0x08;

/// Outcome of a reference-count release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseAction {
    /// The object stays alive (or a weak reference still pins the slot)
    Keep,
    /// The caller must free the slot
    DisposeSlot,
}

/// Accessor for the header word at the start of an object slot
#[derive(Clone, Copy)]
pub struct ObjectHeader(NonNull<AtomicU64>);

unsafe impl Send for ObjectHeader {}

impl ObjectHeader {
    /// Interpret `slot_addr` as an object header.
    ///
    /// # Safety
    /// `slot_addr` must be the 8-aligned start of a slot in a committed
    /// object region.
    #[inline]
    pub unsafe fn at(slot_addr: usize) -> Self {
        debug_assert!(slot_addr % 8 == 0);
        Self(NonNull::new_unchecked(slot_addr as *mut AtomicU64))
    }

    #[inline]
    pub fn address(&self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    fn word(&self) -> &AtomicU64 {
        unsafe { self.0.as_ref() }
    }

    /// Initialize a freshly acquired slot: used, one hard reference.
    #[inline]
    pub fn initialize(&self, schema_id: u32, flags: u8) {
        debug_assert!(schema_id as u64 <= SCHEMA_MASK);
        let word = (schema_id as u64 & SCHEMA_MASK)
            | USED_BIT
            | HARD_UNIT
            | ((flags as u64) << FLAGS_SHIFT);
        self.word().store(word, Ordering::Release);
    }

    /// Clear the header; the slot is about to return to the free pool.
    #[inline]
    pub fn clear(&self) {
        self.word().store(0, Ordering::Release);
    }

    #[inline]
    pub fn is_used(&self) -> bool {
        self.word().load(Ordering::Acquire) & USED_BIT != 0
    }

    #[inline]
    pub fn schema_id(&self) -> u32 {
        (self.word().load(Ordering::Acquire) & SCHEMA_MASK) as u32
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        (self.word().load(Ordering::Acquire) >> FLAGS_SHIFT) as u8
    }

    #[inline]
    pub fn hard_refs(&self) -> u32 {
        ((self.word().load(Ordering::Acquire) & HARD_MASK) >> HARD_SHIFT) as u32
    }

    #[inline]
    pub fn weak_refs(&self) -> u32 {
        ((self.word().load(Ordering::Acquire) & WEAK_MASK) >> WEAK_SHIFT) as u32
    }

    /// Take a hard reference.
    #[inline]
    pub fn retain(&self) {
        let prev = self.word().fetch_add(HARD_UNIT, Ordering::AcqRel);
        debug_assert!(prev & HARD_MASK != HARD_MASK, "hard_refs overflow");
    }

    /// Drop a hard reference; the last one (with no weak holders)
    /// disposes the slot.
    pub fn release(&self) -> ReleaseAction {
        let mut current = self.word().load(Ordering::Acquire);
        loop {
            if current & HARD_MASK == 0 {
                log::warn!(
                    "release of object {:#x} with zero hard refs",
                    self.address()
                );
                return ReleaseAction::Keep;
            }
            let hard = (current & HARD_MASK) - HARD_UNIT;
            let mut next = (current & !HARD_MASK) | hard;
            let dying = hard == 0;
            if dying {
                next &= !USED_BIT;
            }
            match self.word().compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return if dying && next & WEAK_MASK == 0 {
                        ReleaseAction::DisposeSlot
                    } else {
                        ReleaseAction::Keep
                    };
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Take a weak reference.
    #[inline]
    pub fn retain_weak(&self) {
        let prev = self.word().fetch_add(WEAK_UNIT, Ordering::AcqRel);
        debug_assert!(prev & WEAK_MASK != WEAK_MASK, "weak_refs overflow");
    }

    /// Drop a weak reference; the last one on a dead object disposes
    /// the slot it was pinning.
    pub fn release_weak(&self) -> ReleaseAction {
        let mut current = self.word().load(Ordering::Acquire);
        loop {
            if current & WEAK_MASK == 0 {
                log::warn!(
                    "weak release of object {:#x} with zero weak refs",
                    self.address()
                );
                return ReleaseAction::Keep;
            }
            let next = current - WEAK_UNIT;
            match self.word().compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let dead = next & USED_BIT == 0 && next & HARD_MASK == 0;
                    return if dead && next & WEAK_MASK == 0 {
                        ReleaseAction::DisposeSlot
                    } else {
                        ReleaseAction::Keep
                    };
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Instrumentation words between the header and the payload.
    #[inline]
    pub fn extra_words(&self) -> u32 {
        Self::extra_words_for(self.flags())
    }

    /// Instrumentation words implied by a flag byte.
    #[inline]
    pub fn extra_words_for(flags: u8) -> u32 {
        (flags & FLAG_META != 0) as u32
            + (flags & FLAG_TIME_STAMP != 0) as u32
            + (flags & FLAG_STACK_STAMP != 0) as u32
    }

    /// Payload address of this object.
    #[inline]
    pub fn payload(&self) -> usize {
        self.address() + 8 + self.extra_words() as usize * 8
    }

    /// Read one instrumentation word (0-based among the present ones).
    ///
    /// # Safety
    /// The word must be present according to the flags.
    #[inline]
    pub unsafe fn extra_word(&self, index: u32) -> u64 {
        *((self.address() + 8 + index as usize * 8) as *const u64)
    }

    /// Write one instrumentation word.
    ///
    /// # Safety
    /// The word must be present according to the flags.
    #[inline]
    pub unsafe fn set_extra_word(&self, index: u32, value: u64) {
        *((self.address() + 8 + index as usize * 8) as *mut u64) = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_on(word: &AtomicU64) -> ObjectHeader {
        unsafe { ObjectHeader::at(word as *const AtomicU64 as usize) }
    }

    #[test]
    fn test_initialize_fields() {
        let word = AtomicU64::new(0);
        let header = header_on(&word);

        header.initialize(0x1234, FLAG_META);
        assert!(header.is_used());
        assert_eq!(header.schema_id(), 0x1234);
        assert_eq!(header.hard_refs(), 1);
        assert_eq!(header.weak_refs(), 0);
        assert_eq!(header.flags(), FLAG_META);
    }

    #[test]
    fn test_retain_release() {
        let word = AtomicU64::new(0);
        let header = header_on(&word);
        header.initialize(0, 0);

        header.retain();
        assert_eq!(header.hard_refs(), 2);
        assert_eq!(header.release(), ReleaseAction::Keep);
        assert_eq!(header.release(), ReleaseAction::DisposeSlot);
        assert!(!header.is_used());
    }

    #[test]
    fn test_weak_pins_slot() {
        let word = AtomicU64::new(0);
        let header = header_on(&word);
        header.initialize(0, 0);

        header.retain_weak();
        // The last hard release does not dispose while a weak holder
        // pins the slot.
        assert_eq!(header.release(), ReleaseAction::Keep);
        assert!(!header.is_used());
        assert_eq!(header.release_weak(), ReleaseAction::DisposeSlot);
    }

    #[test]
    fn test_weak_release_on_live_object() {
        let word = AtomicU64::new(0);
        let header = header_on(&word);
        header.initialize(0, 0);

        header.retain_weak();
        assert_eq!(header.release_weak(), ReleaseAction::Keep);
        assert!(header.is_used());
    }

    #[test]
    fn test_release_underflow_is_reported() {
        let word = AtomicU64::new(0);
        let header = header_on(&word);
        header.initialize(0, 0);

        assert_eq!(header.release(), ReleaseAction::DisposeSlot);
        assert_eq!(header.release(), ReleaseAction::Keep);
    }

    #[test]
    fn test_extra_words() {
        assert_eq!(ObjectHeader::extra_words_for(0), 0);
        assert_eq!(ObjectHeader::extra_words_for(FLAG_META), 1);
        assert_eq!(
            ObjectHeader::extra_words_for(FLAG_META | FLAG_TIME_STAMP | FLAG_STACK_STAMP),
            3
        );
        assert_eq!(ObjectHeader::extra_words_for(FLAG_PADDING), 0);
    }

    #[test]
    fn test_concurrent_retain_release() {
        use std::sync::Arc;
        use std::thread;

        let word = Arc::new(AtomicU64::new(0));
        header_on(&word).initialize(0, 0);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let word = Arc::clone(&word);
            handles.push(thread::spawn(move || {
                let header = header_on(&word);
                for _ in 0..1000 {
                    header.retain();
                    assert_eq!(header.release(), ReleaseAction::Keep);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let header = header_on(&word);
        assert_eq!(header.hard_refs(), 1);
        assert_eq!(header.release(), ReleaseAction::DisposeSlot);
    }
}
