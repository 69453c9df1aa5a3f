//! Object Layer - Size-Classed Slab Allocation
//!
//! ============================================================================
//! OBJECT REGIONS
//! ============================================================================
//!
//! Every allocation below the slab ceiling lives in an *object region*:
//! a region whose layout byte names an object class, carved into up to
//! 64 fixed-size slots behind a 64-byte head:
//!
//! ```text
//! region base
//! ┌───────────┬──────────┬──────────┬──────────┬───   ───┬──────────┐
//! │ head (64) │ slot 0   │ slot 1   │ slot 2   │   ...   │ slot N-1 │
//! └───────────┴──────────┴──────────┴──────────┴───   ───┴──────────┘
//!               └ header word + payload, `multiplier` bytes each
//! ```
//!
//! The head holds the region's used bitmap, the atomic cross-thread
//! freed bitmap, the owner back-pointer and the intrusive list links.
//! Slot `i` sits at `base + head + i * multiplier`; the reverse mapping
//! divides the region offset by the multiplier with a precomputed
//! exact divider.
//!
//! Larger allocations bypass the slab layer entirely and get a buffer
//! segment of whole units (see `large`).

pub mod central;
pub mod header;
pub mod large;
pub mod layout;
pub mod local;
pub mod region;

pub use central::ObjectCentralContext;
pub use header::ObjectHeader;
pub use large::LargeSegment;
pub use layout::{class_for_size, layout_infos, ObjectLayoutInfos, LAYOUT_COUNT, SLAB_SIZE_MAX};
pub use local::ObjectLocalContext;
pub use region::{ObjectRegion, OwnerKind, RegionOwner};
