//! Device-resident storage for the nmt inference engine.
//!
//! Provides typed device buffers, row-major matrices on top of them, and a
//! registry handing each thread its own in-order execution stream per
//! element type.
//!
//! # Backends
//!
//! The host backend keeps "device" memory in aligned host RAM and runs
//! streams on worker threads. The `cuda` feature adds a cudarc backend.
//!
//! # Failures
//!
//! Allocation and stream failures are unrecoverable at the public API and
//! terminate the process; see [`fatal`] for the test seam that captures them.

pub mod allocator;
pub mod buffer;
pub mod config;
pub mod error;
pub mod fatal;
pub mod fault;
pub mod matrix;
pub mod registry;
pub mod stream;
pub mod stream_registry;
pub mod sync;


pub use allocator::{Allocator, BufferOptions, HostAllocator, PoolAllocator, PoolStats, RawBuffer};
#[cfg(feature = "cuda")]
pub use allocator::CudaAllocator;
pub use buffer::DeviceBuffer;
pub use config::DeviceConfig;
pub use error::{Error, Result};
pub use fatal::{catch_unrecoverable, unrecoverable};
pub use fault::{FaultyAllocator, FaultyStreamFactory};
pub use matrix::Matrix;
pub use registry::{Device, DeviceRegistry, DeviceSpec, DeviceSpecExt, get_device, host, registry};
pub use stream::{HostStreamFactory, Stream, StreamFactory, StreamHandle};
pub use stream_registry::{StreamKey, StreamRegistry};
pub use sync::{CpuTimelineSignal, TimelineSignal};
