//! Memory Statistics
//!
//! Point-in-time snapshot of the allocator's footprint, for logging
//! and diagnostics.

use crate::controller;
use crate::space::space;

/// Snapshot of the allocator state
#[derive(Debug, Clone)]
pub struct MemoryStats {
    /// Virtual address space reserved for arenas
    pub reserved_bytes: usize,
    /// Physical bytes currently committed
    pub committed_bytes: usize,
    /// Physical budget in force
    pub max_physical_bytes: usize,
    /// Arenas installed in the directory
    pub arena_count: usize,
    /// Memory contexts ever created (including the default one)
    pub context_count: usize,
}

impl MemoryStats {
    /// Capture the current state.
    pub fn gather() -> Self {
        let space = space();
        Self {
            reserved_bytes: space.reserved_bytes(),
            committed_bytes: space.used_physical_bytes(),
            max_physical_bytes: space.max_physical_bytes(),
            arena_count: space.arena_count(),
            context_count: controller::context_count(),
        }
    }

    /// Fraction of the physical budget in use.
    pub fn budget_utilization(&self) -> f64 {
        if self.max_physical_bytes == 0 {
            return 0.0;
        }
        self.committed_bytes as f64 / self.max_physical_bytes as f64
    }
}

impl std::fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MemoryStats {{ reserved: {} MiB, committed: {} KiB, budget: {:.1}%, arenas: {}, contexts: {} }}",
            self.reserved_bytes >> 20,
            self.committed_bytes >> 10,
            self.budget_utilization() * 100.0,
            self.arena_count,
            self.context_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_and_display() {
        let stats = MemoryStats::gather();
        assert!(stats.max_physical_bytes > 0);
        let text = stats.to_string();
        assert!(text.contains("MemoryStats"));
        assert!(text.contains("arenas"));
    }

    #[test]
    fn test_budget_utilization_bounds() {
        let stats = MemoryStats {
            reserved_bytes: 0,
            committed_bytes: 512,
            max_physical_bytes: 1024,
            arena_count: 0,
            context_count: 1,
        };
        assert!((stats.budget_utilization() - 0.5).abs() < 1e-9);
    }
}
