//! Schema Registry - Type Descriptors for Managed Objects
//!
//! A schema is `{base_size, traverser}`: the default allocation size of
//! a managed class and the callback that visits its outgoing
//! references during analysis. Schemas are registered once, identified
//! by a 24-bit id stored in every object header (`0` = untyped), and
//! never unregistered.
//!
//! Traversers run inside the mark loop and must not allocate.

use crate::error::{MemError, Result};
use lazy_static::lazy_static;
use parking_lot::RwLock;

/// Schema identifier; fits the 24-bit header field. 0 means untyped.
pub type SchemaId = u32;

const SCHEMA_ID_MAX: usize = (1 << 24) - 1;

/// Passed to traversers; forwards each visited reference to the
/// current analysis.
pub struct TraversalContext<'a> {
    pub(crate) visit: &'a mut dyn FnMut(usize),
}

impl<'a> TraversalContext<'a> {
    /// Visit the pointer-sized reference stored at `object + offset`.
    ///
    /// # Safety-by-contract
    /// `offset` must lie within the object's base size; the traverser
    /// owns that knowledge.
    #[inline]
    pub fn visit_ref(&mut self, object: *const u8, offset: u32) {
        let ptr = unsafe { *(object.add(offset as usize) as *const usize) };
        self.visit_ptr(ptr);
    }

    /// Visit an already-loaded reference value.
    #[inline]
    pub fn visit_ptr(&mut self, ptr: usize) {
        if ptr != 0 {
            (self.visit)(ptr);
        }
    }
}

/// Reference-visiting callback of a managed class
pub type Traverser = fn(&mut TraversalContext, object: *const u8);

/// One registered schema
#[derive(Clone, Copy)]
pub struct Schema {
    pub name: &'static str,
    pub base_size: u32,
    pub traverser: Option<Traverser>,
}

lazy_static! {
    static ref REGISTRY: RwLock<Vec<Schema>> = RwLock::new(Vec::new());
}

/// Register a schema; returns its id (1-based, 0 stays untyped).
pub fn register_schema(
    name: &'static str,
    base_size: u32,
    traverser: Option<Traverser>,
) -> Result<SchemaId> {
    if base_size == 0 {
        return Err(MemError::Schema(format!("schema {name}: zero base size")));
    }
    let mut registry = REGISTRY.write();
    if registry.len() >= SCHEMA_ID_MAX {
        return Err(MemError::Schema("schema id space exhausted".into()));
    }
    registry.push(Schema {
        name,
        base_size,
        traverser,
    });
    Ok(registry.len() as SchemaId)
}

/// Look up a schema by id.
pub fn schema(id: SchemaId) -> Option<Schema> {
    if id == 0 {
        return None;
    }
    REGISTRY.read().get(id as usize - 1).copied()
}
