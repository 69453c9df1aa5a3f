//! # Zonal - Zoned-Buddy Memory Allocator
//!
//! Zonal is a general-purpose dynamic memory allocator built around an
//! O(1) address directory: every byte of the 48-bit virtual space maps
//! to a region descriptor through one flat table lookup. On top of the
//! classic malloc surface it offers metadata-tagged allocations,
//! managed allocations with reference counts and mark-and-sweep
//! collection, and full address introspection (base, size, heap and
//! metadata from any interior pointer).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   Mutator Threads                        │
//! │  ┌───────────────┐  ┌───────────────┐                   │
//! │  │ MemoryContext │  │ MemoryContext │   per-thread      │
//! │  │  local pools  │  │  local pools  │   lock-free path  │
//! │  └───────┬───────┘  └───────┬───────┘                   │
//! │          │   cross-thread   │                           │
//! │          │   notified stacks│                           │
//! └──────────┼──────────────────┼───────────────────────────┘
//!            ▼                  ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │ Central contexts (per-class pools)                      │
//! │ Region space: directory + arenas + retention caches     │
//! │ OS shim: reserve / commit / decommit / release          │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Small and medium requests are served from size-classed object
//! regions (up to 64 slots behind a 64-byte head); anything above the
//! 512 KiB slab ceiling gets its own buffer segment. Freeing from a
//! foreign thread sets a bit in the region's atomic notified bitmap
//! and enqueues the region on its owner's lock-free stack; the owner
//! reconciles on its next allocation or scavenge.
//!
//! ## Quick Start
//!
//! ```rust
//! zonal::init().unwrap();
//! zonal::attach_current_thread();
//!
//! let ptr = zonal::malloc(100);
//! assert!(!ptr.is_null());
//!
//! let infos = zonal::get_address_infos(ptr).unwrap();
//! assert!(infos.usable_size >= 100);
//!
//! unsafe { zonal::free(ptr) };
//! zonal::detach_current_thread();
//! ```
//!
//! ## Managed objects
//!
//! A managed object carries a schema (`{base_size, traverser}`); the
//! controller's background worker periodically marks the reachable
//! graph from registered roots and sweeps the rest. Reference counts
//! (hard and weak) work on both managed and unmanaged objects.
//!
//! ## Modules
//!
//! - [`space`]: address directory, arenas, region manager
//! - [`objects`]: size classes, object regions, local/central contexts
//! - [`analysis`]: the mark-and-sweep session
//! - [`controller`]: process lifecycle and the background worker
//! - [`api`]: the allocation surface wrapped by `zonal-abi`

pub mod analysis;
pub mod api;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod objects;
pub mod os;
pub mod schemas;
pub mod space;
pub mod stats;
pub mod util;

pub use api::{
    attach_current_thread, calloc, detach_current_thread, flush_cache, free, get_address_infos,
    malloc, malloc_ex, msize, new_managed, new_unmanaged, realloc, release, release_weak, retain,
    retain_weak, AddressInfos, LocalRoot,
};
pub use config::MemConfig;
pub use controller::{init_process, init_with_config, mark_and_sweep_unused_objects};
pub use error::{MemError, Result};
pub use schemas::{register_schema, SchemaId, TraversalContext, Traverser};
pub use stats::MemoryStats;

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the allocator with the environment configuration.
pub fn init() -> Result<()> {
    controller::init_process()
}

/// Initialize the allocator with an explicit configuration.
pub fn init_with(config: MemConfig) -> Result<()> {
    controller::init_with_config(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_default() {
        assert!(init().is_ok());
    }

    #[test]
    fn test_version_not_empty() {
        assert!(!VERSION.is_empty());
    }
}
