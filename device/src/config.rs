//! Device selection and allocator stack configuration.
//!
//! Provides typed configuration with bon builders and environment variable
//! fallbacks.

use std::str::FromStr;

use bon::bon;
use nmt_dtype::DeviceSpec;

use crate::error::{InvalidConfigSnafu, Result};
use crate::registry::DeviceSpecExt;

/// Default number of freed allocations parked per size by the pool.
pub const DEFAULT_POOL_MAX_BUFFERS: usize = 32;

/// How to open a [`crate::Device`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Backend to allocate on.
    pub device: DeviceSpec,
    /// Freed allocations kept per size for reuse. 0 disables pooling.
    pub pool_max_buffers: usize,
    /// Byte limit for the host backend. Ignored by CUDA.
    pub memory_limit: Option<usize>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { device: DeviceSpec::Cpu, pool_max_buffers: DEFAULT_POOL_MAX_BUFFERS, memory_limit: None }
    }
}

#[bon]
impl DeviceConfig {
    /// Create a device configuration with builder pattern.
    #[builder]
    pub fn new(
        #[builder(default)] device: DeviceSpec,
        #[builder(default = DEFAULT_POOL_MAX_BUFFERS)] pool_max_buffers: usize,
        memory_limit: Option<usize>,
    ) -> Self {
        Self { device, pool_max_buffers, memory_limit }
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `NMT_DEVICE` - Device string such as `CPU` or `CUDA:1` (default: CPU)
    /// * `NMT_POOL_MAX_BUFFERS` - Pooled allocations per size, 0 disables (default: 32)
    /// * `NMT_MEMORY_LIMIT` - Host backend byte limit (default: unlimited)
    ///
    /// Unlike unset variables, values that fail to parse are reported.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// As [`DeviceConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let device = match lookup("NMT_DEVICE") {
            Some(value) => <DeviceSpec as DeviceSpecExt>::parse(&value)?,
            None => DeviceSpec::Cpu,
        };
        let pool_max_buffers = parse_var(&lookup, "NMT_POOL_MAX_BUFFERS")?.unwrap_or(DEFAULT_POOL_MAX_BUFFERS);
        let memory_limit = parse_var(&lookup, "NMT_MEMORY_LIMIT")?;

        Ok(Self { device, pool_max_buffers, memory_limit })
    }

    pub fn pooling_enabled(&self) -> bool {
        self.pool_max_buffers > 0
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        Some(value) => match value.trim().parse() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => InvalidConfigSnafu { key, value }.fail(),
        },
        None => Ok(None),
    }
}
