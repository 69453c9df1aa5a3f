//! Mark-and-Sweep Session - Managed Object Analysis
//!
//! A session is a single-writer pass over the managed heap that shares
//! nothing with mutator state except atomic ORs. It keeps:
//!
//! - `arena_indexes`: prefix sums of region counts over managed arenas,
//!   mapping (arena, region) to a dense session index (0 is reserved).
//! - `aliveness`: one atomic 64-bit bitmap per managed region; bit *i*
//!   means "slot *i* is reachable". Bits are monotonic within a session,
//!   so an abandoned session never corrupts state.
//! - `items`: deferred-work records `{arena_id, uncheckeds, next}`.
//! - `notifieds`: a lock-free stack of session indexes with pending
//!   uncheckeds. A region is enqueued at most once per notification
//!   cycle (the second postpone sees a non-zero `uncheckeds`), which is
//!   what makes the single-word head safe against ABA.
//!
//! Marking happens at three depths: roots and the write barrier mark
//! with a depth budget of 1, the run loop traverses with a budget of
//! [`TRAVERSE_DEPTH`]; when the budget is exhausted the discovered
//! references are postponed instead of recursed into.

use crate::objects::header::ObjectHeader;
use crate::objects::layout::{layout_infos, slot_index_of};
use crate::objects::region::{notify_owner, ObjectRegion};
use crate::schemas::{schema, TraversalContext};
use crate::space::{region_layout, space, ARENAS_PER_SPACE};
use crate::util::lsb_64;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

/// Recursion budget of the run loop's traversals
const TRAVERSE_DEPTH: u32 = 5;

/// Deferred-work record of one managed region
struct WorkItem {
    arena_id: AtomicU32,
    next: AtomicU32,
    uncheckeds: AtomicU64,
}

impl WorkItem {
    fn new() -> Self {
        Self {
            arena_id: AtomicU32::new(0),
            next: AtomicU32::new(0),
            uncheckeds: AtomicU64::new(0),
        }
    }
}

/// One analysis pass over the managed heap
pub struct AnalysisSession {
    arena_indexes: Vec<u32>,
    aliveness: Vec<AtomicU64>,
    items: Vec<WorkItem>,
    notifieds: AtomicU32,
    length: u32,
}

/// Roots supplier registered with the controller
pub trait ReferenceTracker: Send + Sync {
    fn mark_roots(&self, session: &AnalysisSession);
}

static ENABLED: AtomicPtr<AnalysisSession> = AtomicPtr::new(std::ptr::null_mut());

/// The session mutators should feed through the write barrier, if any.
#[inline]
pub fn enabled_session() -> Option<&'static AnalysisSession> {
    let ptr = ENABLED.load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        // The controller keeps the session storage alive for the whole
        // process; only the enabled window moves.
        Some(unsafe { &*ptr })
    }
}

pub(crate) fn set_enabled(session: &AnalysisSession) {
    ENABLED.store(
        session as *const AnalysisSession as *mut AnalysisSession,
        Ordering::Release,
    );
}

pub(crate) fn clear_enabled() {
    ENABLED.store(std::ptr::null_mut(), Ordering::Release);
}

/// Write barrier: a mutator installing `ptr` as a new reference marks
/// it with a depth-1 budget.
#[inline]
pub fn mark_ptr(ptr: usize) {
    if let Some(session) = enabled_session() {
        session.mark_root(ptr);
    }
}

impl AnalysisSession {
    pub fn new() -> Self {
        Self {
            arena_indexes: Vec::new(),
            aliveness: Vec::new(),
            items: Vec::new(),
            notifieds: AtomicU32::new(0),
            length: 0,
        }
    }

    /// Rebuild the session maps for the current set of managed arenas.
    pub fn reset(&mut self) {
        let directory = space().directory();
        // Index 0 is the reserved null index.
        let mut count = 1u32;
        self.arena_indexes.clear();
        self.arena_indexes.reserve(ARENAS_PER_SPACE);
        for arena_id in 0..ARENAS_PER_SPACE {
            self.arena_indexes.push(count);
            if let Some(arena) = directory.get(arena_id as u16) {
                if arena.is_managed() {
                    count += arena.region_count();
                }
            }
        }

        if count as usize > self.aliveness.len() {
            self.aliveness.resize_with(count as usize, || AtomicU64::new(0));
            self.items.resize_with(count as usize, WorkItem::new);
        }
        for index in 0..count as usize {
            self.aliveness[index].store(0, Ordering::Relaxed);
            self.items[index].arena_id.store(0, Ordering::Relaxed);
            self.items[index].next.store(0, Ordering::Relaxed);
            self.items[index].uncheckeds.store(0, Ordering::Relaxed);
        }
        self.notifieds.store(0, Ordering::Relaxed);
        self.length = count;
    }

    #[inline]
    fn session_index(&self, arena_id: u16, region_index: u32) -> Option<u32> {
        let index = self.arena_indexes.get(arena_id as usize)? + region_index;
        // Arenas installed after reset() fall outside the maps; their
        // objects were allocated during the session and are treated as
        // alive.
        if index < self.length {
            Some(index)
        } else {
            None
        }
    }

    /// Set an aliveness bit. True when this call was the first observer.
    pub fn mark_alive(&self, arena_id: u16, region_index: u32, object_bit: u64) -> bool {
        match self.session_index(arena_id, region_index) {
            Some(index) => {
                let prev = self.aliveness[index as usize].fetch_or(object_bit, Ordering::AcqRel);
                prev & object_bit == 0
            }
            None => false,
        }
    }

    /// Defer the traversal of an object to the run loop.
    pub fn postpone(&self, arena_id: u16, region_index: u32, object_bit: u64) {
        let index = match self.session_index(arena_id, region_index) {
            Some(index) => index,
            None => return,
        };
        let item = &self.items[index as usize];
        let prev = item.uncheckeds.fetch_or(object_bit, Ordering::AcqRel);
        if prev == 0 {
            // First pending object of this region in this cycle: the
            // region goes onto the notifieds stack exactly once.
            item.arena_id.store(arena_id as u32, Ordering::Relaxed);
            loop {
                let head = self.notifieds.load(Ordering::Relaxed);
                item.next.store(head, Ordering::Relaxed);
                if self
                    .notifieds
                    .compare_exchange_weak(head, index, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
        }
    }

    /// Mark one reference with a depth-1 budget (roots, write barrier).
    pub fn mark_root(&self, ptr: usize) {
        DeepMarker {
            session: self,
            depth: 1,
        }
        .mark(ptr);
    }

    /// Drain the notifieds stack, traversing every postponed object.
    pub fn run_once(&self) {
        loop {
            let mut work_index = self.notifieds.swap(0, Ordering::Acquire);
            if work_index == 0 {
                return;
            }
            while work_index != 0 {
                let item = &self.items[work_index as usize];
                let next_index = item.next.swap(0, Ordering::Relaxed);
                let arena_id = item.arena_id.load(Ordering::Relaxed) as u16;

                let arena = match space().directory().get(arena_id) {
                    Some(arena) => arena,
                    None => break,
                };
                let region_index = work_index - self.arena_indexes[arena_id as usize];
                let layout = arena.layout(region_index);
                let mut bits = item.uncheckeds.swap(0, Ordering::Acquire);
                if region_layout::is_object(layout) {
                    let infos = layout_infos(layout);
                    let region_base = arena.region_base(region_index);
                    while bits != 0 {
                        let slot = lsb_64(bits);
                        bits ^= 1u64 << slot;
                        let slot_addr = region_base
                            + infos.head_offset as usize
                            + slot as usize * infos.multiplier as usize;
                        let header = unsafe { ObjectHeader::at(slot_addr) };
                        DeepMarker {
                            session: self,
                            depth: TRAVERSE_DEPTH,
                        }
                        .traverse(header);
                    }
                }
                work_index = next_index;
            }
        }
    }

    /// Whether any postponed work is pending.
    pub fn has_pending_work(&self) -> bool {
        self.notifieds.load(Ordering::Acquire) != 0
    }

    /// Aliveness bitmap of a managed region (tests, diagnostics).
    pub fn aliveness_of(&self, arena_id: u16, region_index: u32) -> u64 {
        match self.session_index(arena_id, region_index) {
            Some(index) => self.aliveness[index as usize].load(Ordering::Relaxed),
            None => 0,
        }
    }

    /// Free every managed object the session did not reach.
    ///
    /// Unreachable slots are routed through the cross-thread free
    /// protocol, so owners pick them up on their next drain. Returns
    /// the number of slots swept.
    pub fn sweep(&self) -> usize {
        let mut swept = 0usize;
        space().foreach_object_region(&mut |arena, region_index, _layout| {
            if !arena.is_managed() {
                return true;
            }
            let index = match self.session_index(arena.index(), region_index) {
                Some(index) => index,
                None => return true,
            };
            let region = unsafe { ObjectRegion::from_base(arena.region_base(region_index)) };
            let alive = self.aliveness[index as usize].load(Ordering::Acquire);
            let dead = region.used_map() & !alive & !region.notified_map();
            if dead == 0 {
                return true;
            }

            let mut bits = dead;
            while bits != 0 {
                let slot = lsb_64(bits);
                bits ^= 1u64 << slot;
                region.slot_header(slot).clear();
            }
            swept += dead.count_ones() as usize;
            if region.notify_slots(dead) {
                notify_owner(region);
            }
            true
        });
        swept
    }
}

impl Default for AnalysisSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Depth-bounded marker, the traversal engine of the session
struct DeepMarker<'a> {
    session: &'a AnalysisSession,
    depth: u32,
}

impl<'a> DeepMarker<'a> {
    /// Mark the object containing `ptr`, then traverse or postpone it.
    fn mark(&mut self, ptr: usize) {
        let location = match space().resolve(ptr) {
            Some(location) => location,
            None => return,
        };
        if !location.arena.is_managed() {
            return;
        }
        let layout = location.layout();
        if !region_layout::is_object(layout) {
            return;
        }
        let infos = layout_infos(layout);
        let offset = (ptr - location.region_base()) as u32;
        let slot = match slot_index_of(infos, offset) {
            Some(slot) => slot,
            None => return,
        };
        let object_bit = 1u64 << slot;
        let arena_id = location.arena.index();

        if self
            .session
            .mark_alive(arena_id, location.region_index, object_bit)
        {
            if self.depth == 0 {
                self.session
                    .postpone(arena_id, location.region_index, object_bit);
            } else {
                let slot_addr = location.region_base()
                    + infos.head_offset as usize
                    + slot as usize * infos.multiplier as usize;
                self.traverse(unsafe { ObjectHeader::at(slot_addr) });
            }
        }
    }

    /// Invoke the object's schema traverser against this marker.
    fn traverse(&mut self, header: ObjectHeader) {
        debug_assert!(self.depth > 0);
        let schema_id = header.schema_id();
        if schema_id == 0 {
            return;
        }
        let traverser = match schema(schema_id).and_then(|schema| schema.traverser) {
            Some(traverser) => traverser,
            None => return,
        };
        let payload = header.payload() as *const u8;
        self.depth -= 1;
        {
            let mut visit = |ptr: usize| self.mark(ptr);
            let mut context = TraversalContext { visit: &mut visit };
            traverser(&mut context, payload);
        }
        self.depth += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_builds_prefix_map() {
        let mut session = AnalysisSession::new();
        session.reset();
        // The null index is always reserved.
        assert!(session.length >= 1);
        assert_eq!(session.arena_indexes.len(), ARENAS_PER_SPACE);
    }

    #[test]
    fn test_mark_alive_first_observer_wins() {
        let mut session = AnalysisSession::new();
        session.reset();
        // Use the reserved range of a nonexistent managed arena: the
        // maps answer None and marking degrades to "not first".
        assert!(!session.mark_alive(0xFFFF, 1 << 20, 1));
    }

    #[test]
    fn test_unmapped_pointers_are_ignored() {
        let mut session = AnalysisSession::new();
        session.reset();
        session.mark_root(0xDEAD_BEEF);
        session.mark_root(0);
        assert!(!session.has_pending_work());
    }
}
