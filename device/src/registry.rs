use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

pub use nmt_dtype::DeviceSpec;

use crate::allocator::{Allocator, HostAllocator, PoolAllocator};
use crate::config::DeviceConfig;
use crate::error::{Error, InvalidDeviceSnafu, Result};
use crate::stream::{HostStreamFactory, StreamFactory};
use crate::stream_registry::StreamRegistry;

/// Extension trait for DeviceSpec to add parsing functionality.
///
/// This is in the device crate because parsing reports device errors.
pub trait DeviceSpecExt {
    /// Parse a device string into a DeviceSpec.
    ///
    /// Examples:
    /// - "CPU" -> DeviceSpec::Cpu
    /// - "CUDA:1" -> DeviceSpec::Cuda { device_id: 1 }
    /// - "gpu" -> DeviceSpec::Cuda { device_id: 0 } (default to device 0)
    fn parse(s: &str) -> Result<DeviceSpec>;
}

impl DeviceSpecExt for DeviceSpec {
    fn parse(s: &str) -> Result<Self> {
        let s = s.trim().to_uppercase();
        let (name, index) = match s.split_once(':') {
            Some((name, index)) => (name, Some(index)),
            None => (s.as_str(), None),
        };

        match (name, index) {
            ("CPU", None) => Ok(DeviceSpec::Cpu),
            ("CUDA" | "GPU", None) => Ok(DeviceSpec::Cuda { device_id: 0 }),
            ("CUDA" | "GPU", Some(index)) => {
                let device_id = index.parse().map_err(|_| Error::InvalidDevice { device: s.clone() })?;
                Ok(DeviceSpec::Cuda { device_id })
            }
            _ => InvalidDeviceSnafu { device: s.clone() }.fail(),
        }
    }
}

/// An opened backend: the allocator stack and the stream factory for one
/// [`DeviceSpec`].
#[derive(Debug)]
pub struct Device {
    spec: DeviceSpec,
    allocator: Arc<dyn Allocator>,
    streams: Arc<dyn StreamFactory>,
}

impl Device {
    /// Build the allocator stack described by `config`.
    pub fn open(config: &DeviceConfig) -> Result<Self> {
        let (allocator, streams): (Arc<dyn Allocator>, Arc<dyn StreamFactory>) = match config.device {
            DeviceSpec::Cpu => {
                let host = match config.memory_limit {
                    Some(limit) => HostAllocator::with_limit(limit),
                    None => HostAllocator::new(),
                };
                let allocator: Arc<dyn Allocator> = Arc::new(host);
                let streams: Arc<dyn StreamFactory> = Arc::new(HostStreamFactory);
                (allocator, streams)
            }
            #[cfg(feature = "cuda")]
            DeviceSpec::Cuda { device_id } => {
                let cuda = Arc::new(crate::allocator::CudaAllocator::new(device_id)?);
                let allocator: Arc<dyn Allocator> = cuda.clone();
                let streams: Arc<dyn StreamFactory> = cuda;
                (allocator, streams)
            }
            #[cfg(not(feature = "cuda"))]
            DeviceSpec::Cuda { .. } => {
                return InvalidDeviceSnafu { device: format!("{} (built without the cuda feature)", config.device) }
                    .fail();
            }
        };

        let allocator: Arc<dyn Allocator> = if config.pooling_enabled() {
            Arc::new(PoolAllocator::with_capacity(allocator, config.pool_max_buffers))
        } else {
            allocator
        };

        tracing::debug!(
            device = %config.device,
            allocator = allocator.name(),
            pool_max_buffers = config.pool_max_buffers,
            memory_limit = ?config.memory_limit,
            "device opened"
        );
        Ok(Self { spec: config.device, allocator, streams })
    }

    pub fn spec(&self) -> DeviceSpec {
        self.spec
    }

    /// Allocator for buffers and matrices on this device.
    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    pub fn stream_factory(&self) -> &Arc<dyn StreamFactory> {
        &self.streams
    }

    /// A fresh stream registry creating its streams on this device.
    pub fn stream_registry(&self) -> StreamRegistry {
        StreamRegistry::new(Arc::clone(&self.streams))
    }
}

pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceSpec, Arc<Device>>>,
}

impl DeviceRegistry {
    fn new() -> Self {
        Self { devices: RwLock::new(HashMap::new()) }
    }

    /// Get or open a device with default settings.
    pub fn get(&self, spec: &DeviceSpec) -> Result<Arc<Device>> {
        // Fast path: read lock
        {
            let devices = self.devices.read();
            if let Some(device) = devices.get(spec) {
                return Ok(Arc::clone(device));
            }
        }

        // Slow path: write lock to create
        let mut devices = self.devices.write();

        // Double-check after acquiring write lock
        if let Some(device) = devices.get(spec) {
            return Ok(Arc::clone(device));
        }

        let device = Arc::new(Device::open(&DeviceConfig::builder().device(*spec).build())?);
        devices.insert(*spec, Arc::clone(&device));
        Ok(device)
    }

    /// Get a device by parsing a device string.
    pub fn get_device(&self, device: &str) -> Result<Arc<Device>> {
        let spec = <DeviceSpec as DeviceSpecExt>::parse(device)?;
        self.get(&spec)
    }
}

/// Global device registry instance.
static REGISTRY: Lazy<DeviceRegistry> = Lazy::new(DeviceRegistry::new);

/// Get the global device registry.
pub fn registry() -> &'static DeviceRegistry {
    &REGISTRY
}

/// Convenience function to get a device by string.
pub fn get_device(device: &str) -> Result<Arc<Device>> {
    registry().get_device(device)
}

/// Convenience function to get the host device.
pub fn host() -> Result<Arc<Device>> {
    registry().get(&DeviceSpec::Cpu)
}
