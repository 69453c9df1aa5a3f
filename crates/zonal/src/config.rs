//! Configuration Module - Allocator Tuning Parameters
//!
//! Manages all configuration parameters for the allocator. Most
//! parameters have sensible defaults; everything can also be loaded
//! from the environment for deployments that cannot call the set-option
//! API before the first allocation.

use crate::error::{MemError, Result};

/// Main configuration for the allocator
///
/// # Examples
///
/// ```rust
/// use zonal::MemConfig;
///
/// // Default configuration
/// let config = MemConfig::default();
///
/// // Tight physical budget for a constrained service
/// let config = MemConfig {
///     max_usable_physical_bytes: 256 * 1024 * 1024,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct MemConfig {
    /// Process-wide physical memory budget in bytes
    ///
    /// Commits beyond this budget park the allocating thread on the
    /// starvation protocol until the background worker frees enough.
    /// Default: 1 TiB (effectively unbounded).
    pub max_usable_physical_bytes: usize,

    /// Stamp every allocation with a nanosecond timestamp
    ///
    /// Stored in an extra word between the object header and the
    /// payload. Default: false.
    pub enable_time_stamp: bool,

    /// Stamp every allocation with the registered stack-stamp word
    ///
    /// The stamp itself is produced by an external provider; the
    /// allocator only records it. Default: false.
    pub enable_stack_stamp: bool,

    /// Guard padding appended after each payload, in bytes
    ///
    /// Pattern-filled at allocation and verified on free; a mismatch is
    /// reported as corruption. 0 disables. Default: 0.
    pub security_padding_size: u32,

    /// Cached-free regions retained per sizing class
    ///
    /// Overrides the built-in retention ramp when set.
    /// Default: None (64 for region sizes up to 512 KiB, 0 above).
    pub region_retention: Option<u32>,

    /// Background worker wake-up interval in milliseconds
    ///
    /// The worker also wakes on demand for starvation rescue and
    /// context recovery. Default: 250 ms.
    pub worker_interval_ms: u64,

    /// Run a mark-and-sweep cycle every N worker wake-ups
    ///
    /// Only has an effect once managed objects exist. 0 disables
    /// periodic collection (explicit cycles still work).
    /// Default: 16.
    pub analysis_period: u32,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            max_usable_physical_bytes: 1 << 40,
            enable_time_stamp: false,
            enable_stack_stamp: false,
            security_padding_size: 0,
            region_retention: None,
            worker_interval_ms: 250,
            analysis_period: 16,
        }
    }
}

impl MemConfig {
    /// Load configuration from the environment
    ///
    /// Recognized variables:
    /// - `ZONAL_MAX_PHYSICAL_BYTES`
    /// - `ZONAL_TIME_STAMP` (0/1)
    /// - `ZONAL_STACK_STAMP` (0/1)
    /// - `ZONAL_SECURITY_PADDING` (bytes)
    ///
    /// Unset variables keep their defaults; malformed values are an
    /// error rather than a silent fallback.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = read_env("ZONAL_MAX_PHYSICAL_BYTES")? {
            config.max_usable_physical_bytes = value;
        }
        if let Some(value) = read_env("ZONAL_TIME_STAMP")? {
            config.enable_time_stamp = value != 0;
        }
        if let Some(value) = read_env("ZONAL_STACK_STAMP")? {
            config.enable_stack_stamp = value != 0;
        }
        if let Some(value) = read_env("ZONAL_SECURITY_PADDING")? {
            config.security_padding_size = value as u32;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate parameter consistency
    pub fn validate(&self) -> Result<()> {
        if self.max_usable_physical_bytes < 1 << 20 {
            return Err(MemError::Configuration(format!(
                "max_usable_physical_bytes too small: {} (minimum 1 MiB)",
                self.max_usable_physical_bytes
            )));
        }
        if self.security_padding_size > 4096 {
            return Err(MemError::Configuration(format!(
                "security_padding_size too large: {} (maximum 4096)",
                self.security_padding_size
            )));
        }
        if self.worker_interval_ms == 0 {
            return Err(MemError::Configuration(
                "worker_interval_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn read_env(name: &str) -> Result<Option<usize>> {
    match std::env::var(name) {
        Ok(text) => text
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| MemError::Configuration(format!("{name}: not a number: {text:?}"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(MemError::Configuration(format!("{name}: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(MemConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_tiny_budget() {
        let config = MemConfig {
            max_usable_physical_bytes: 4096,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_padding() {
        let config = MemConfig {
            security_padding_size: 1 << 20,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_interval() {
        let config = MemConfig {
            worker_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
