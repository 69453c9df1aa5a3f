//! Central Context - Cross-Thread Region Pool per Object Class
//!
//! One central context exists per heap kind (unmanaged, managed). Per
//! object class it keeps mutex-guarded usable and disposable region
//! lists plus a lock-free notified stack for cross-thread frees whose
//! owning context died or returned the region.
//!
//! Local contexts pull batches of usable regions from here before
//! asking the arena manager for fresh ones, and return their empty and
//! excess regions during scavenging.

use crate::objects::layout::LAYOUT_COUNT;
use crate::objects::local::LocalPool;
use crate::objects::region::{notify_owner, ObjectRegion, OwnerKind, RegionList, RegionOwner};
use parking_lot::Mutex;

/// Regions transferred per acquire_batch call
const BATCH_SIZE: u32 = 2;

/// Usable regions the central pool keeps before disposing the excess
const USABLE_CAP: u32 = 16;

struct CentralLists {
    usables: RegionList,
    disposables: RegionList,
}

/// Per-class central pool
pub struct CentralPool {
    /// Notification target for cross-thread frees; must outlive every
    /// region pointing at it (the central context is never destroyed).
    owner: RegionOwner,
    lists: Mutex<CentralLists>,
}

impl CentralPool {
    fn new() -> Self {
        Self {
            owner: RegionOwner::new(OwnerKind::Central),
            lists: Mutex::new(CentralLists {
                usables: RegionList::new(),
                disposables: RegionList::new(),
            }),
        }
    }
}

/// The central heap of one kind (unmanaged or managed)
pub struct ObjectCentralContext {
    managed: bool,
    pools: Box<[CentralPool]>,
}

impl ObjectCentralContext {
    pub fn new(managed: bool) -> Self {
        Self {
            managed,
            pools: (0..LAYOUT_COUNT).map(|_| CentralPool::new()).collect(),
        }
    }

    #[inline]
    pub fn is_managed(&self) -> bool {
        self.managed
    }

    /// The notification owner of class `layout_id`.
    #[inline]
    pub fn owner(&self, layout_id: u8) -> &RegionOwner {
        &self.pools[layout_id as usize].owner
    }

    /// Transfer up to a batch of usable regions into a local pool.
    ///
    /// Returns true when at least one region moved.
    pub fn acquire_batch(&self, layout_id: u8, local: &mut LocalPool) -> bool {
        let pool = &self.pools[layout_id as usize];
        let mut lists = pool.lists.lock();

        if lists.usables.is_empty() {
            Self::scavenge_locked(pool, &mut lists);
        }

        let mut moved = 0;
        while moved < BATCH_SIZE {
            match lists.usables.pop() {
                Some(region) => {
                    region.set_owner(&local.owner);
                    local.usables.push(region);
                    moved += 1;
                }
                None => break,
            }
        }
        moved > 0
    }

    /// Accept empty regions scavenged out of a local context and return
    /// them to the arena manager.
    pub fn receive_disposables(&self, layout_id: u8, disposables: &mut RegionList) {
        let pool = &self.pools[layout_id as usize];
        while let Some(region) = disposables.pop() {
            debug_assert_eq!(region.layout_id(), layout_id);
            debug_assert!(region.is_disposable());
            region.set_owner(&pool.owner);
            region.dispose();
        }
    }

    /// Accept a usable region returned by a scavenging local context.
    pub fn push_usable(&self, layout_id: u8, region: ObjectRegion) {
        let pool = &self.pools[layout_id as usize];
        region.set_owner(&pool.owner);
        let mut lists = pool.lists.lock();
        if lists.usables.len() >= USABLE_CAP && region.is_disposable() {
            drop(lists);
            region.dispose();
        } else {
            lists.usables.push(region);
        }
    }

    /// Drain the notified stack of class `layout_id`.
    ///
    /// Picks up regions whose owner died or returned them; regions that
    /// moved to another owner meanwhile are forwarded there.
    pub fn scavenge_notifieds(&self, layout_id: u8) -> bool {
        let pool = &self.pools[layout_id as usize];
        let mut lists = pool.lists.lock();
        Self::scavenge_locked(pool, &mut lists)
    }

    fn scavenge_locked(pool: &CentralPool, lists: &mut CentralLists) -> bool {
        let mut gained = false;
        for region in pool.owner.notifieds.flush() {
            if region.owner_ptr() != pool.owner.as_ptr() {
                // The region moved to another owner after the
                // notification; hand the pending bits over.
                if region.notified_count() > 0 {
                    notify_owner(region);
                }
                continue;
            }
            if region.drain_notified() == 0 {
                continue;
            }
            gained = true;
            if region.in_used_list() {
                continue;
            }
            if region.is_empty() {
                lists.disposables.push(region);
            } else {
                lists.usables.push(region);
            }
        }
        gained
    }

    /// Background cleanup: reconcile notifications and return empty
    /// regions to the arena manager.
    pub fn clean(&self) {
        for layout_id in 0..LAYOUT_COUNT as u8 {
            let pool = &self.pools[layout_id as usize];
            let mut lists = pool.lists.lock();
            Self::scavenge_locked(pool, &mut lists);
            let CentralLists {
                usables,
                disposables,
            } = &mut *lists;
            usables.collect_into(disposables, |region| region.is_disposable());

            let mut dead = RegionList::new();
            let mut kept = RegionList::new();
            while let Some(region) = lists.disposables.pop() {
                if region.is_disposable() {
                    dead.push(region);
                } else {
                    kept.push(region);
                }
            }
            lists.disposables = kept;
            drop(lists);
            while let Some(region) = dead.pop() {
                region.dispose();
            }
        }
    }

    /// Regions currently parked in the central lists (for stats).
    pub fn pooled_regions(&self) -> usize {
        self.pools
            .iter()
            .map(|pool| {
                let lists = pool.lists.lock();
                (lists.usables.len() + lists.disposables.len()) as usize
            })
            .sum()
    }
}
