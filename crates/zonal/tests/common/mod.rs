//! Shared test fixture
//!
//! Initializes the allocator once per test binary with a configuration
//! that keeps the background worker out of the way: collections run
//! only when a test asks for one.

use std::sync::Once;

/// Initialize the allocator for this test binary.
pub fn setup() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let config = zonal::MemConfig {
            worker_interval_ms: 100,
            analysis_period: 0,
            ..Default::default()
        };
        zonal::init_with(config).expect("allocator initialization failed");
    });
}

/// Fill a payload with a position-dependent pattern.
pub fn fill_pattern(ptr: *mut u8, len: usize, seed: u8) {
    for offset in 0..len {
        unsafe { *ptr.add(offset) = seed.wrapping_add(offset as u8) };
    }
}

/// Check a pattern written by `fill_pattern`.
pub fn check_pattern(ptr: *const u8, len: usize, seed: u8) -> bool {
    (0..len).all(|offset| unsafe { *ptr.add(offset) } == seed.wrapping_add(offset as u8))
}
