//! Memory Context - Per-Thread Allocation State
//!
//! A `MemoryContext` owns two local object contexts (unmanaged and
//! managed), the allocation options in force, and the thread's explicit
//! managed root handles. Every public operation takes the context's
//! owning mutex; for the thread that owns the context the lock is
//! uncontended and the fast path stays wait-free in practice, while
//! the shared default context and the background worker use the same
//! lock for their cross-thread access.
//!
//! Contexts are created once, registered with the controller, recycled
//! through its free list, and never deallocated; regions keep weak
//! back-pointers into them.

use crate::analysis;
use crate::controller;
use crate::error::Result;
use crate::objects::central::ObjectCentralContext;
use crate::objects::header::{
    ObjectHeader, FLAG_META, FLAG_PADDING, FLAG_STACK_STAMP, FLAG_TIME_STAMP,
};
use crate::objects::large::LargeSegment;
use crate::objects::layout::class_for_size;
use crate::objects::local::ObjectLocalContext;
use crate::objects::region::{notify_owner, ObjectRegion};
use crate::space::MemoryConsumer;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Guard byte pattern for security padding
pub const PADDING_PATTERN: u8 = 0xFD;

/// Per-allocation instrumentation options
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocOptions {
    pub time_stamp: bool,
    pub stack_stamp: bool,
    pub padding: u32,
}

struct ContextInner {
    options: AllocOptions,
    unmanaged: ObjectLocalContext,
    managed: ObjectLocalContext,
    local_roots: Vec<usize>,
}

/// The per-thread allocation context
pub struct MemoryContext {
    id: u16,
    inner: Mutex<ContextInner>,
}

/// Rescue path handed to the region machinery: park on the controller's
/// starvation protocol.
struct StarvationRescue;

impl MemoryConsumer for StarvationRescue {
    fn rescue_starving_situation(&self, expected: usize) {
        controller::rescue_starved(expected);
    }
}

impl MemoryContext {
    pub fn new(
        id: u16,
        unmanaged_central: &'static ObjectCentralContext,
        managed_central: &'static ObjectCentralContext,
    ) -> Self {
        Self {
            id,
            inner: Mutex::new(ContextInner {
                options: AllocOptions::default(),
                unmanaged: ObjectLocalContext::new(false, unmanaged_central),
                managed: ObjectLocalContext::new(true, managed_central),
                local_roots: Vec::new(),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn set_options(&self, options: AllocOptions) {
        self.inner.lock().options = options;
    }

    pub fn options(&self) -> AllocOptions {
        self.inner.lock().options
    }

    /// Allocate an object of `size` payload bytes.
    ///
    /// Returns the payload address. The header is initialized with one
    /// hard reference; instrumentation words are written according to
    /// the options in force and the presence of `meta`.
    pub fn allocate_object(
        &self,
        managed: bool,
        schema_id: u32,
        size: usize,
        meta: Option<u64>,
    ) -> Result<usize> {
        let mut inner = self.inner.lock();
        let options = inner.options;

        let mut flags = 0u8;
        if meta.is_some() {
            flags |= FLAG_META;
        }
        if options.time_stamp {
            flags |= FLAG_TIME_STAMP;
        }
        if options.stack_stamp {
            flags |= FLAG_STACK_STAMP;
        }
        if options.padding > 0 {
            flags |= FLAG_PADDING;
        }
        let extra_words = ObjectHeader::extra_words_for(flags);
        let overhead = 8 + extra_words as usize * 8 + options.padding as usize;

        let header = match class_for_size(size + overhead) {
            Some(layout_id) => {
                let local = if managed {
                    &mut inner.managed
                } else {
                    &mut inner.unmanaged
                };
                let (_region, _index, header) =
                    local.acquire_object(layout_id, &StarvationRescue)?;
                header
            }
            None => {
                let segment = LargeSegment::allocate(
                    size,
                    extra_words,
                    options.padding,
                    managed,
                    &StarvationRescue,
                )?;
                segment.object_header()
            }
        };
        drop(inner);

        header.initialize(schema_id, flags);
        let mut word = 0u32;
        unsafe {
            if let Some(meta) = meta {
                header.set_extra_word(word, meta);
                word += 1;
            }
            if flags & FLAG_TIME_STAMP != 0 {
                header.set_extra_word(word, now_nanos());
                word += 1;
            }
            if flags & FLAG_STACK_STAMP != 0 {
                header.set_extra_word(word, stack_stamp());
            }
        }
        let payload = header.payload();
        if options.padding > 0 {
            let usable = usable_size_of(header);
            unsafe {
                std::ptr::write_bytes(
                    (payload + usable) as *mut u8,
                    PADDING_PATTERN,
                    options.padding as usize,
                );
            }
        }
        if managed {
            // A session in progress must observe objects born during it.
            analysis::mark_ptr(payload);
        }
        Ok(payload)
    }

    /// Owner fast path for a slab free. Returns false when this context
    /// does not own the region or is busy; the caller then takes the
    /// cross-thread path, which is always correct.
    pub fn try_release_local(&self, region: ObjectRegion, index: u32) -> bool {
        let mut inner = match self.inner.try_lock() {
            Some(inner) => inner,
            None => return false,
        };
        let local = if region.is_managed() {
            &mut inner.managed
        } else {
            &mut inner.unmanaged
        };
        if region.owner_ptr() != local.pool(region.layout_id()).owner.as_ptr() {
            return false;
        }
        local.release_object(region, index);
        true
    }

    /// Reconcile notifications and trim the caches of both heaps.
    pub fn scavenge(&self, release_all: bool) {
        let mut inner = self.inner.lock();
        inner.unmanaged.scavenge(release_all);
        inner.managed.scavenge(release_all);
    }

    /// Scavenge only if the context is not busy (background worker).
    pub fn try_scavenge(&self, release_all: bool) -> bool {
        match self.inner.try_lock() {
            Some(mut inner) => {
                inner.unmanaged.scavenge(release_all);
                inner.managed.scavenge(release_all);
                true
            }
            None => false,
        }
    }

    /// Register an explicit managed root held by this thread.
    pub fn push_local_root(&self, ptr: usize) {
        self.inner.lock().local_roots.push(ptr);
    }

    /// Drop one occurrence of an explicit root.
    pub fn remove_local_root(&self, ptr: usize) {
        let mut inner = self.inner.lock();
        if let Some(position) = inner.local_roots.iter().rposition(|&root| root == ptr) {
            inner.local_roots.swap_remove(position);
        }
    }

    /// Snapshot the explicit roots; false when the context is busy.
    pub fn try_collect_roots(&self, out: &mut Vec<usize>) -> bool {
        match self.inner.try_lock() {
            Some(inner) => {
                out.extend_from_slice(&inner.local_roots);
                true
            }
            None => false,
        }
    }

    /// Regions owned by this context across both heaps.
    pub fn owned_regions(&self) -> u32 {
        let inner = self.inner.lock();
        inner.unmanaged.owned_regions() + inner.managed.owned_regions()
    }
}

/// Usable payload bytes of an object, net of instrumentation.
pub fn usable_size_of(header: ObjectHeader) -> usize {
    let flags = header.flags();
    let padding = if flags & FLAG_PADDING != 0 {
        controller::security_padding_size() as usize
    } else {
        0
    };
    let overhead = 8 + header.extra_words() as usize * 8 + padding;

    if let Some(segment) = LargeSegment::find(header.address()) {
        return segment.usable_size();
    }
    let location = crate::space::space()
        .resolve(header.address())
        .expect("object header outside any region");
    let multiplier = crate::objects::layout::layout_infos(location.layout()).multiplier as usize;
    multiplier - overhead
}

/// Verify the guard padding of an object about to be freed.
pub fn check_padding(header: ObjectHeader) -> bool {
    if header.flags() & FLAG_PADDING == 0 {
        return true;
    }
    let padding = controller::security_padding_size() as usize;
    if padding == 0 {
        return true;
    }
    let guard = header.payload() + usable_size_of(header);
    let intact =
        (0..padding).all(|i| unsafe { *((guard + i) as *const u8) } == PADDING_PATTERN);
    if !intact {
        log::error!(
            "security padding overwritten on object {:#x}",
            header.payload()
        );
    }
    intact
}

/// Free a slab slot from whatever thread is calling.
///
/// The caller has already cleared the object header.
pub fn free_slab_slot(region: ObjectRegion, index: u32) {
    if let Some(context) = current_context() {
        if context.try_release_local(region, index) {
            return;
        }
    }
    if controller::default_context().try_release_local(region, index) {
        return;
    }
    if region.release_slot_cross(index) {
        notify_owner(region);
    }
}

fn now_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0)
}

// ============================================================================
// STACK STAMP PROVIDER
// ============================================================================

static STACK_STAMP_PROVIDER: AtomicUsize = AtomicUsize::new(0);

/// Install the provider whose word is recorded when stack stamps are
/// enabled (an external profiler hook).
pub fn set_stack_stamp_provider(provider: fn() -> u64) {
    STACK_STAMP_PROVIDER.store(provider as usize, Ordering::Release);
}

fn stack_stamp() -> u64 {
    let raw = STACK_STAMP_PROVIDER.load(Ordering::Acquire);
    if raw == 0 {
        return 0;
    }
    let provider: fn() -> u64 = unsafe { std::mem::transmute(raw) };
    provider()
}

// ============================================================================
// THREAD ATTACHMENT
// ============================================================================

struct AttachedContext(&'static MemoryContext);

impl Drop for AttachedContext {
    fn drop(&mut self) {
        // Thread died without detaching; the background worker recovers
        // the context's regions.
        controller::schedule_recovery(self.0);
    }
}

thread_local! {
    static CURRENT: RefCell<Option<AttachedContext>> = const { RefCell::new(None) };
}

/// Give the calling thread its own context.
pub fn attach_current_thread() {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        if current.is_none() {
            *current = Some(AttachedContext(controller::acquire_context()));
        }
    });
}

/// Release the calling thread's context back to the controller.
pub fn detach_current_thread() {
    CURRENT.with(|current| {
        if let Some(attached) = current.borrow_mut().take() {
            let context = attached.0;
            std::mem::forget(attached);
            controller::release_context(context);
        }
    });
}

/// The calling thread's context, if attached.
pub fn current_context() -> Option<&'static MemoryContext> {
    CURRENT
        .try_with(|current| current.borrow().as_ref().map(|attached| attached.0))
        .unwrap_or(None)
}
