//! Utility Functions
//!
//! Small helpers shared across the allocator:
//! - Bit scanning and masks
//! - Address alignment
//! - Exact division by a precomputed reciprocal

pub mod alignment;
pub mod bits;
pub mod divider;

pub use alignment::{align_down, align_up, is_aligned};
pub use bits::{bit_mask, ceil_log2, lsb_64, msb_64};
pub use divider::ExactDivider;
