//! Error Module - Allocator Error Types
//!
//! Defines all error types used by the allocator engine. The C ABI
//! layer never surfaces these directly; it maps allocation failures to
//! null returns and invalid pointers to the caller's fallback.

use thiserror::Error;

/// Main error type for all allocator operations
#[derive(Debug, Error)]
pub enum MemError {
    #[error("Out of physical memory: requested {requested} bytes, budget leaves {available} bytes")]
    OutOfPhysicalMemory { requested: usize, available: usize },

    #[error("Out of virtual memory: could not reserve {requested} bytes")]
    OutOfVirtualMemory { requested: usize },

    #[error("Invalid pointer address: {address:#x}")]
    InvalidPointer { address: usize },

    #[error("Region allocation failed: {reason}")]
    RegionAllocationFailed { reason: String },

    #[error("Arena space exhausted: all {limit} directory entries in use")]
    ArenaSpaceExhausted { limit: usize },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Operating system error: {0}")]
    Os(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MemError {
    /// Check if this error is recoverable
    ///
    /// Recoverable errors are resource shortages that a cleanup cycle or
    /// a freed allocation can resolve. Everything else indicates a bug
    /// or an unusable environment.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MemError::OutOfPhysicalMemory { .. } | MemError::RegionAllocationFailed { .. }
        )
    }

    /// Check if this error indicates a bug in the allocator
    pub fn is_bug(&self) -> bool {
        matches!(self, MemError::Corruption(_) | MemError::Internal(_))
    }
}

/// Result type alias for allocator operations
pub type Result<T> = std::result::Result<T, MemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let oom = MemError::OutOfPhysicalMemory {
            requested: 4096,
            available: 0,
        };
        assert!(oom.is_recoverable());
        assert!(!oom.is_bug());

        let corrupt = MemError::Corruption("bitmap mismatch".into());
        assert!(!corrupt.is_recoverable());
        assert!(corrupt.is_bug());
    }

    #[test]
    fn test_display_contains_context() {
        let err = MemError::InvalidPointer { address: 0xdead };
        assert!(err.to_string().contains("0xdead"));
    }
}
