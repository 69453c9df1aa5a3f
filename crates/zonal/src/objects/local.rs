//! Local Context - Per-Thread Object Pools
//!
//! One local context exists per (thread, heap kind). Per object class
//! it keeps the active region, a usable list, the lock-free notified
//! stack other threads push cross-freed regions onto, and a list of
//! fully empty regions awaiting return.
//!
//! Allocation path, in order:
//! 1. bit-scan the active region,
//! 2. drain the notified stack,
//! 3. pop the usable list,
//! 4. pull a batch from the central context,
//! 5. allocate a fresh region from the arena manager.
//!
//! Everything here is single-threaded except the notified stack and
//! the region bitmaps, which are the designated cross-thread surface.

use crate::error::Result;
use crate::objects::central::ObjectCentralContext;
use crate::objects::header::ObjectHeader;
use crate::objects::layout::LAYOUT_COUNT;
use crate::objects::region::{
    allocate_object_region, notify_owner, ObjectRegion, OwnerKind, RegionList, RegionOwner,
};
use crate::space::MemoryConsumer;

/// Usable regions a pool keeps across a routine scavenge
const USABLE_RETAIN: u32 = 2;

/// Per-class pool of a local context
pub struct LocalPool {
    /// Notification target cross-thread freers resolve through the
    /// region back-pointer.
    pub owner: RegionOwner,
    pub active: Option<ObjectRegion>,
    pub usables: RegionList,
    pub disposables: RegionList,
}

impl LocalPool {
    fn new() -> Self {
        Self {
            owner: RegionOwner::new(OwnerKind::Local),
            active: None,
            usables: RegionList::new(),
            disposables: RegionList::new(),
        }
    }

    /// Total regions owned by this pool right now.
    fn owned_regions(&self) -> u32 {
        self.active.is_some() as u32 + self.usables.len() + self.disposables.len()
    }
}

/// The per-thread heap of one kind (unmanaged or managed)
pub struct ObjectLocalContext {
    managed: bool,
    central: &'static ObjectCentralContext,
    pools: Box<[LocalPool]>,
}

impl ObjectLocalContext {
    pub fn new(managed: bool, central: &'static ObjectCentralContext) -> Self {
        debug_assert_eq!(managed, central.is_managed());
        Self {
            managed,
            central,
            pools: (0..LAYOUT_COUNT).map(|_| LocalPool::new()).collect(),
        }
    }

    #[inline]
    pub fn is_managed(&self) -> bool {
        self.managed
    }

    #[inline]
    pub fn pool(&self, layout_id: u8) -> &LocalPool {
        &self.pools[layout_id as usize]
    }

    /// Acquire a slot of class `layout_id`.
    pub fn acquire_object(
        &mut self,
        layout_id: u8,
        consumer: &dyn MemoryConsumer,
    ) -> Result<(ObjectRegion, u32, ObjectHeader)> {
        let central = self.central;
        let managed = self.managed;
        let pool = &mut self.pools[layout_id as usize];

        loop {
            // 1. Active region fast path.
            if let Some(active) = pool.active {
                if let Some((index, header)) = active.acquire_slot() {
                    return Ok((active, index, header));
                }
                // Full: the region leaves every list until a free makes
                // it usable again.
                pool.active = None;
            }

            // 2. Reclaim cross-thread freed slots.
            if Self::drain_notifieds(pool) {
                continue;
            }

            // 3. Another owned region with room.
            if let Some(region) = pool.usables.pop() {
                pool.active = Some(region);
                continue;
            }

            // 4. Batch from the central context.
            if central.acquire_batch(layout_id, pool) {
                continue;
            }

            // 5. Fresh region from the arena manager.
            let region = allocate_object_region(layout_id, managed, &pool.owner, consumer)?;
            pool.active = Some(region);
        }
    }

    /// Owner fast path for freeing a slot.
    pub fn release_object(&mut self, region: ObjectRegion, index: u32) {
        let pool = &mut self.pools[region.layout_id() as usize];
        debug_assert_eq!(region.owner_ptr(), pool.owner.as_ptr());

        let transition = region.release_slot_local(index);
        if Some(region) == pool.active || region.in_used_list() {
            return;
        }
        if transition.now_empty {
            pool.disposables.push(region);
        } else if transition.was_full {
            pool.usables.push(region);
        }
    }

    /// Drain every pending notification for one pool.
    ///
    /// Returns true when any slot came back.
    fn drain_notifieds(pool: &mut LocalPool) -> bool {
        let owner_ptr = pool.owner.as_ptr();
        let mut gained = false;
        for region in pool.owner.notifieds.flush() {
            if region.owner_ptr() != owner_ptr {
                // Ownership moved after the notification was queued;
                // forward the pending bits to the current owner.
                if region.notified_count() > 0 {
                    notify_owner(region);
                }
                continue;
            }
            if region.drain_notified() == 0 {
                continue;
            }
            gained = true;
            if Some(region) == pool.active || region.in_used_list() {
                continue;
            }
            if region.is_empty() {
                pool.disposables.push(region);
            } else {
                pool.usables.push(region);
            }
        }
        gained
    }

    /// Reconcile notifications and return regions to the central
    /// context.
    ///
    /// With `release_all` the context gives up every region it owns
    /// (thread detach); otherwise empty regions leave and the usable
    /// list is capped.
    pub fn scavenge(&mut self, release_all: bool) {
        let central = self.central;
        for layout_id in 0..LAYOUT_COUNT as u8 {
            let pool = &mut self.pools[layout_id as usize];
            Self::drain_notifieds(pool);

            if release_all {
                if let Some(active) = pool.active.take() {
                    if active.is_empty() {
                        pool.disposables.push(active);
                    } else {
                        pool.usables.push(active);
                    }
                }
            }

            // Empty regions out of the usable list, then everything
            // drained goes back to the arena manager through central.
            // A region with an in-flight notification stays put until
            // the next drain.
            let mut empties = RegionList::new();
            pool.usables
                .collect_into(&mut empties, |region| region.is_disposable());
            pool.disposables
                .collect_into(&mut empties, |region| region.is_disposable());
            central.receive_disposables(layout_id, &mut empties);

            // Cap the usable list; the excess serves other threads.
            let cap = if release_all { 0 } else { USABLE_RETAIN };
            while pool.usables.len() > cap {
                match pool.usables.pop() {
                    Some(region) => central.push_usable(layout_id, region),
                    None => break,
                }
            }
        }
    }

    /// Regions owned across all pools (for stats and tests).
    pub fn owned_regions(&self) -> u32 {
        self.pools.iter().map(|pool| pool.owned_regions()).sum()
    }
}
