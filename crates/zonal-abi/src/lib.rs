//! Zonal ABI - C FFI for the Zonal Allocator
//!
//! Stable C entry points over the `zonal` engine:
//! - process and thread lifecycle,
//! - the malloc family with metadata and introspection,
//! - the managed surface (schemas, reference counts, reference cells).
//!
//! No panic ever crosses these functions; failures surface as null
//! pointers or false returns. Fallback function pointers for unknown
//! pointers are dispatched here, never inside the engine.

mod malloc;
mod managed;

pub use malloc::*;
pub use managed::*;
