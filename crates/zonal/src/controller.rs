//! Controller - Process Lifecycle and Background Work
//!
//! Exactly one controller exists per process. It owns the central
//! contexts, the registry of memory contexts, the analysis session and
//! the background worker. The worker:
//!
//! 1. waits on its notification signal with a timeout,
//! 2. recovers contexts of dead threads into the central context,
//! 3. rescues starved consumers by running cleanup cycles until enough
//!    physical memory came back,
//! 4. periodically runs a mark-and-sweep cycle for the managed heap.
//!
//! Starvation protocol: a thread whose commit would exceed the physical
//! budget parks on a `StarvedToken` (mutex + condvar) carrying the
//! requested byte length, pokes the worker, and retries once the token
//! is signalled.

use crate::analysis::{self, AnalysisSession, ReferenceTracker};
use crate::config::MemConfig;
use crate::context::{AllocOptions, MemoryContext};
use crate::error::Result;
use crate::objects::central::ObjectCentralContext;
use crate::space::space;
use lazy_static::lazy_static;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

/// Cleanup rounds the worker attempts per starved consumer batch
const RESCUE_ROUNDS: u32 = 8;

/// Pause between rescue rounds, giving other threads time to free
const RESCUE_ROUND_PAUSE: Duration = Duration::from_millis(50);

/// Upper bound a starved consumer waits for its token
const STARVED_WAIT_LIMIT: Duration = Duration::from_secs(5);

struct StarvedToken {
    expected: usize,
    state: Mutex<TokenState>,
    signal: Condvar,
}

struct TokenState {
    done: bool,
    freed: usize,
}

impl StarvedToken {
    fn new(expected: usize) -> Self {
        Self {
            expected,
            state: Mutex::new(TokenState {
                done: false,
                freed: 0,
            }),
            signal: Condvar::new(),
        }
    }

    fn complete(&self, freed: usize) {
        let mut state = self.state.lock();
        state.done = true;
        state.freed = freed;
        self.signal.notify_all();
    }

    fn wait(&self) -> usize {
        let mut state = self.state.lock();
        let deadline = std::time::Instant::now() + STARVED_WAIT_LIMIT;
        while !state.done {
            let timeout = deadline.saturating_duration_since(std::time::Instant::now());
            if timeout.is_zero() {
                log::warn!("starved consumer timed out waiting for rescue");
                break;
            }
            self.signal.wait_for(&mut state, timeout);
        }
        state.freed
    }
}

struct ControllerState {
    contexts: Vec<&'static MemoryContext>,
    free: Vec<&'static MemoryContext>,
    recovered: Vec<&'static MemoryContext>,
    starved: Vec<Arc<StarvedToken>>,
    next_id: u16,
}

struct MemoryController {
    unmanaged_central: ObjectCentralContext,
    managed_central: ObjectCentralContext,

    state: Mutex<ControllerState>,
    notify: Condvar,

    session: Mutex<AnalysisSession>,
    trackers: Mutex<Vec<Arc<dyn ReferenceTracker>>>,
    hard_ref_cells: Mutex<Vec<usize>>,
    weak_ref_cells: Mutex<Vec<usize>>,

    options: Mutex<AllocOptions>,
    padding_size: AtomicU32,
    worker_interval_ms: AtomicU64,
    analysis_period: AtomicU32,
    cycle: AtomicU32,
}

lazy_static! {
    static ref CONTROLLER: MemoryController = MemoryController {
        unmanaged_central: ObjectCentralContext::new(false),
        managed_central: ObjectCentralContext::new(true),
        state: Mutex::new(ControllerState {
            contexts: Vec::new(),
            free: Vec::new(),
            recovered: Vec::new(),
            starved: Vec::new(),
            next_id: 1,
        }),
        notify: Condvar::new(),
        session: Mutex::new(AnalysisSession::new()),
        trackers: Mutex::new(Vec::new()),
        hard_ref_cells: Mutex::new(Vec::new()),
        weak_ref_cells: Mutex::new(Vec::new()),
        options: Mutex::new(AllocOptions::default()),
        padding_size: AtomicU32::new(0),
        worker_interval_ms: AtomicU64::new(250),
        analysis_period: AtomicU32::new(16),
        cycle: AtomicU32::new(0),
    };
    static ref DEFAULT_CONTEXT: MemoryContext = MemoryContext::new(
        0,
        &CONTROLLER.unmanaged_central,
        &CONTROLLER.managed_central,
    );
}

static INIT: Once = Once::new();
static WORKER: Once = Once::new();

/// Initialize the allocator from the environment (idempotent).
pub fn init_process() -> Result<()> {
    let config = MemConfig::from_env()?;
    init_with_config(config)
}

/// Initialize the allocator with an explicit configuration.
pub fn init_with_config(config: MemConfig) -> Result<()> {
    config.validate()?;
    space().set_max_physical_bytes(config.max_usable_physical_bytes);
    space().set_retention_override(config.region_retention);
    CONTROLLER
        .worker_interval_ms
        .store(config.worker_interval_ms, Ordering::Relaxed);
    CONTROLLER
        .analysis_period
        .store(config.analysis_period, Ordering::Relaxed);
    set_time_stamp_option(config.enable_time_stamp);
    set_stack_stamp_option(config.enable_stack_stamp);
    set_security_padding_option(config.security_padding_size);
    start_worker();
    Ok(())
}

/// First-use initialization for API entry points.
pub fn ensure_initialized() {
    INIT.call_once(|| {
        if let Err(err) = init_process() {
            log::error!("allocator initialization failed: {err}");
        }
    });
}

fn start_worker() {
    WORKER.call_once(|| {
        std::thread::Builder::new()
            .name("zonal-worker".into())
            .spawn(worker_loop)
            .expect("failed to spawn background worker");
    });
}

// ============================================================================
// CONTEXT REGISTRY
// ============================================================================

/// The process-wide shared context used by unattached threads.
pub fn default_context() -> &'static MemoryContext {
    &DEFAULT_CONTEXT
}

/// Hand out an unused context, creating one if the free list is empty.
pub(crate) fn acquire_context() -> &'static MemoryContext {
    ensure_initialized();
    let controller = &*CONTROLLER;
    let mut state = controller.state.lock();
    let context = match state.free.pop() {
        Some(context) => context,
        None => {
            let id = state.next_id;
            state.next_id = state.next_id.wrapping_add(1).max(1);
            let context: &'static MemoryContext = Box::leak(Box::new(MemoryContext::new(
                id,
                &controller.unmanaged_central,
                &controller.managed_central,
            )));
            state.contexts.push(context);
            context
        }
    };
    drop(state);
    context.set_options(*controller.options.lock());
    context
}

/// Take back a context from a cleanly detaching thread.
pub(crate) fn release_context(context: &'static MemoryContext) {
    context.scavenge(true);
    CONTROLLER.state.lock().free.push(context);
}

/// A thread died holding a context; the worker recovers it.
pub(crate) fn schedule_recovery(context: &'static MemoryContext) {
    {
        let mut state = CONTROLLER.state.lock();
        state.recovered.push(context);
    }
    CONTROLLER.notify.notify_one();
}

/// Number of contexts ever created (plus the default one).
pub fn context_count() -> usize {
    CONTROLLER.state.lock().contexts.len() + 1
}

// ============================================================================
// OPTIONS
// ============================================================================

pub fn set_time_stamp_option(enabled: bool) {
    update_options(|options| options.time_stamp = enabled);
}

pub fn set_stack_stamp_option(enabled: bool) {
    update_options(|options| options.stack_stamp = enabled);
}

pub fn set_security_padding_option(size: u32) {
    CONTROLLER.padding_size.store(size, Ordering::Relaxed);
    update_options(|options| options.padding = size);
}

/// Guard padding in force (objects flag whether they carry it).
pub fn security_padding_size() -> u32 {
    CONTROLLER.padding_size.load(Ordering::Relaxed)
}

pub fn set_max_physical_bytes(limit: usize) {
    space().set_max_physical_bytes(limit);
}

fn update_options(mutate: impl Fn(&mut AllocOptions)) {
    let controller = &*CONTROLLER;
    let mut options = controller.options.lock();
    mutate(&mut options);
    let snapshot = *options;
    drop(options);

    DEFAULT_CONTEXT.set_options(snapshot);
    let contexts = controller.state.lock().contexts.clone();
    for context in contexts {
        context.set_options(snapshot);
    }
}

// ============================================================================
// STARVATION RESCUE
// ============================================================================

/// Park until a cleanup cycle freed around `expected` bytes.
///
/// Returns the bytes the rescue claims to have freed.
pub fn rescue_starved(expected: usize) -> usize {
    ensure_initialized();
    let token = Arc::new(StarvedToken::new(expected));
    {
        let mut state = CONTROLLER.state.lock();
        state.starved.push(Arc::clone(&token));
    }
    CONTROLLER.notify.notify_one();
    token.wait()
}

/// Run one full cleanup cycle: scavenge every context, clean both
/// central contexts, and flush the retention caches.
///
/// Returns the physical bytes freed.
pub fn perform_memory_cleanup() -> usize {
    let before = space().used_physical_bytes();

    DEFAULT_CONTEXT.try_scavenge(false);
    let contexts = CONTROLLER.state.lock().contexts.clone();
    for context in contexts {
        context.try_scavenge(false);
    }
    CONTROLLER.unmanaged_central.clean();
    CONTROLLER.managed_central.clean();
    space().flush_caches();

    before.saturating_sub(space().used_physical_bytes())
}

// ============================================================================
// MARK AND SWEEP
// ============================================================================

/// Register an external roots supplier.
pub fn register_tracker(tracker: Arc<dyn ReferenceTracker>) {
    CONTROLLER.trackers.lock().push(tracker);
}

pub(crate) fn register_hard_ref_cell(cell: usize) {
    CONTROLLER.hard_ref_cells.lock().push(cell);
}

pub(crate) fn unregister_hard_ref_cell(cell: usize) {
    let mut cells = CONTROLLER.hard_ref_cells.lock();
    if let Some(position) = cells.iter().rposition(|&entry| entry == cell) {
        cells.swap_remove(position);
    }
}

pub(crate) fn register_weak_ref_cell(cell: usize) {
    CONTROLLER.weak_ref_cells.lock().push(cell);
}

pub(crate) fn unregister_weak_ref_cell(cell: usize) {
    let mut cells = CONTROLLER.weak_ref_cells.lock();
    if let Some(position) = cells.iter().rposition(|&entry| entry == cell) {
        cells.swap_remove(position);
    }
}

/// Run one full mark-and-sweep session over the managed heap.
///
/// Returns the number of objects swept. A cycle that cannot snapshot
/// every thread's roots is abandoned, which is safe: aliveness bits are
/// monotonic and no sweep happens.
pub fn mark_and_sweep_unused_objects() -> usize {
    ensure_initialized();
    let controller = &*CONTROLLER;
    let mut session = controller.session.lock();
    session.reset();
    analysis::set_enabled(&session);

    // Roots: explicit thread-local handles first.
    let mut roots = Vec::new();
    let mut complete = DEFAULT_CONTEXT.try_collect_roots(&mut roots);
    let contexts = controller.state.lock().contexts.clone();
    for context in &contexts {
        complete &= context.try_collect_roots(&mut roots);
    }
    if !complete {
        analysis::clear_enabled();
        log::warn!("mark-and-sweep abandoned: a context was busy during root collection");
        return 0;
    }
    for root in roots {
        session.mark_root(root);
    }
    // Hard reference cells pin their targets.
    for &cell in controller.hard_ref_cells.lock().iter() {
        let target = unsafe { *(cell as *const usize) };
        if target != 0 {
            session.mark_root(target);
        }
    }
    // External trackers.
    for tracker in controller.trackers.lock().iter() {
        tracker.mark_roots(&session);
    }

    // Fixed point: the session ends only when the notified stack is
    // stably empty (the write barrier may repopulate it meanwhile).
    loop {
        session.run_once();
        if !session.has_pending_work() {
            break;
        }
    }

    let swept = session.sweep();
    analysis::clear_enabled();

    // Weak cells whose target died read as null from now on.
    if swept > 0 {
        for &cell in controller.weak_ref_cells.lock().iter() {
            let target = unsafe { *(cell as *const usize) };
            if target != 0 && !crate::api::is_object_alive(target) {
                unsafe { *(cell as *mut usize) = 0 };
            }
        }
    }

    let cycle = controller.cycle.fetch_add(1, Ordering::Relaxed);
    log::info!("mark-and-sweep cycle {}: swept {} objects", cycle, swept);
    swept
}

// ============================================================================
// BACKGROUND WORKER
// ============================================================================

fn worker_loop() {
    let controller = &*CONTROLLER;
    log::debug!("background worker started");
    let mut wakeups = 0u32;
    loop {
        wakeups = wakeups.wrapping_add(1);
        let interval = controller.worker_interval_ms.load(Ordering::Relaxed);
        let mut state = controller.state.lock();
        controller
            .notify
            .wait_for(&mut state, Duration::from_millis(interval));

        let recovered: Vec<&'static MemoryContext> = state.recovered.drain(..).collect();
        let starved: Vec<Arc<StarvedToken>> = state.starved.drain(..).collect();
        drop(state);

        // 1. Contexts of dead threads: move their regions to central,
        //    recycle the context.
        for context in recovered {
            context.scavenge(true);
            controller.state.lock().free.push(context);
            log::debug!("recovered context {}", context.id());
        }

        // 2. Starved consumers: cleanup until enough physical memory
        //    came back.
        if !starved.is_empty() {
            let need: usize = starved.iter().map(|token| token.expected).max().unwrap_or(0);
            let mut freed = 0usize;
            for round in 0..RESCUE_ROUNDS {
                freed += perform_memory_cleanup();
                // Other threads may free directly; what matters is the
                // headroom the retry will see.
                let headroom = space()
                    .max_physical_bytes()
                    .saturating_sub(space().used_physical_bytes());
                if freed >= need || headroom >= need {
                    break;
                }
                if round + 1 < RESCUE_ROUNDS {
                    std::thread::sleep(RESCUE_ROUND_PAUSE);
                }
            }
            log::debug!("rescue freed {} bytes for {} consumers", freed, starved.len());
            for token in starved {
                token.complete(freed);
            }
        }

        // 3. Periodic managed-heap analysis.
        let period = controller.analysis_period.load(Ordering::Relaxed);
        if period > 0 && wakeups % period == 0 {
            // Only collect when managed arenas exist at all.
            let mut has_managed = false;
            space().directory().foreach_arena(|arena| {
                if arena.is_managed() {
                    has_managed = true;
                    return false;
                }
                true
            });
            if has_managed {
                mark_and_sweep_unused_objects();
            }
        }
    }
}
