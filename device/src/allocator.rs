use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaContext, CudaSlice};
use nmt_dtype::DeviceSpec;
use parking_lot::Mutex;
#[cfg(feature = "cuda")]
use snafu::ResultExt;

#[cfg(feature = "cuda")]
use crate::error::CudaSnafu;
use crate::error::{AllocationFailedSnafu, InvalidRangeSnafu, Result};

/// Zero-initialised, 64-byte aligned host allocation.
///
/// Never zero-sized: an empty buffer holds no allocation at all.
pub struct HostMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: HostMemory uniquely owns its allocation; shared access is read-only.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
    /// Alignment of every host allocation, enough for any [`nmt_dtype::Element`].
    pub const ALIGN: usize = 64;

    /// Allocate `size` zeroed bytes. Returns `None` for `size == 0` or when
    /// the system allocator fails.
    pub fn zeroed(size: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, Self::ALIGN).ok()?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).map(|ptr| Self { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid and initialised for layout.size() bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid, initialised and uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with exactly this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMemory").field("ptr", &self.ptr).field("size", &self.layout.size()).finish()
    }
}

/// Opaque handle to device memory.
#[derive(Debug)]
pub enum RawBuffer {
    Host {
        data: HostMemory,
    },
    #[cfg(feature = "cuda")]
    Cuda {
        data: CudaSlice<u8>,
        context: Arc<CudaContext>,
    },
}

impl RawBuffer {
    /// Get the size of the buffer in bytes.
    pub fn size(&self) -> usize {
        match self {
            RawBuffer::Host { data } => data.len(),
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, .. } => data.len(),
        }
    }

    /// Host-visible bytes, if the allocation lives in host memory.
    pub fn host(&self) -> Option<&[u8]> {
        match self {
            RawBuffer::Host { data } => Some(data.as_slice()),
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { .. } => None,
        }
    }

    pub fn host_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            RawBuffer::Host { data } => Some(data.as_mut_slice()),
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { .. } => None,
        }
    }

    /// Address of the allocation, for identity checks.
    pub fn addr(&self) -> usize {
        match self {
            RawBuffer::Host { data } => data.as_slice().as_ptr() as usize,
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, .. } => data as *const CudaSlice<u8> as usize,
        }
    }

    fn check_range(&self, offset: usize, size: usize) -> Result<()> {
        let buffer_size = self.size();
        snafu::ensure!(
            offset.checked_add(size).is_some_and(|end| end <= buffer_size),
            InvalidRangeSnafu { offset, size, buffer_size }
        );
        Ok(())
    }

    /// Copy `dst.len()` bytes starting at `offset` into host memory.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len())?;
        match self {
            RawBuffer::Host { data } => {
                dst.copy_from_slice(&data.as_slice()[offset..offset + dst.len()]);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, context } => {
                let view = data.slice(offset..offset + dst.len());
                context.default_stream().memcpy_dtoh(&view, dst).context(CudaSnafu)
            }
        }
    }

    /// Copy host bytes into the allocation starting at `offset`.
    pub fn write(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        self.check_range(offset, src.len())?;
        match self {
            RawBuffer::Host { data } => {
                data.as_mut_slice()[offset..offset + src.len()].copy_from_slice(src);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, context } => {
                let mut view = data.slice_mut(offset..offset + src.len());
                context.default_stream().memcpy_htod(src, &mut view).context(CudaSnafu)
            }
        }
    }

    /// Zero the whole allocation.
    pub fn zero(&mut self) -> Result<()> {
        match self {
            RawBuffer::Host { data } => {
                data.as_mut_slice().fill(0);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, context } => context.default_stream().memset_zeros(data).context(CudaSnafu),
        }
    }

    /// Copy the first `size` bytes of `src` into the start of this allocation.
    pub fn copy_prefix_from(&mut self, src: &RawBuffer, size: usize) -> Result<()> {
        self.check_range(0, size)?;
        src.check_range(0, size)?;

        match (self, src) {
            (RawBuffer::Host { data: dst }, RawBuffer::Host { data: src }) => {
                dst.as_mut_slice()[..size].copy_from_slice(&src.as_slice()[..size]);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            (RawBuffer::Cuda { data: dst, context }, RawBuffer::Cuda { data: src, .. }) => {
                let src_view = src.slice(..size);
                let mut dst_view = dst.slice_mut(..size);
                context.default_stream().memcpy_dtod(&src_view, &mut dst_view).context(CudaSnafu)
            }
            #[cfg(feature = "cuda")]
            (RawBuffer::Cuda { data: dst, context }, RawBuffer::Host { data: src }) => {
                let mut dst_view = dst.slice_mut(..size);
                context.default_stream().memcpy_htod(&src.as_slice()[..size], &mut dst_view).context(CudaSnafu)
            }
            #[cfg(feature = "cuda")]
            (RawBuffer::Host { data: dst }, RawBuffer::Cuda { data: src, context }) => {
                let src_view = src.slice(..size);
                context.default_stream().memcpy_dtoh(&src_view, &mut dst.as_mut_slice()[..size]).context(CudaSnafu)
            }
        }
    }
}

/// Options for buffer allocation.
#[derive(Debug, Clone, Default)]
pub struct BufferOptions {
    /// Whether to zero-initialize the buffer.
    pub zero_init: bool,
}

impl BufferOptions {
    pub const ZEROED: Self = Self { zero_init: true };
    pub const UNINIT: Self = Self { zero_init: false };
}

/// Provider of device memory.
///
/// Implementations return errors; escalation to the fatal path is the
/// caller's decision.
pub trait Allocator: Send + Sync + fmt::Debug {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer>;
    fn free(&self, _buffer: RawBuffer) {}
    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
    fn name(&self) -> &str;
    fn device(&self) -> DeviceSpec;
}

/// Host memory standing in for device memory.
///
/// An optional byte limit models the scarce memory of an accelerator:
/// requests that would push the live total past it fail.
#[derive(Debug, Default)]
pub struct HostAllocator {
    limit: Option<usize>,
    in_use: AtomicUsize,
}

impl HostAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self { limit: Some(limit), in_use: AtomicUsize::new(0) }
    }

    /// Bytes currently handed out and not yet freed.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}

impl Allocator for HostAllocator {
    fn alloc(&self, size: usize, _options: &BufferOptions) -> Result<RawBuffer> {
        let limit = self.limit;
        let reserved = self.in_use.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
            used.checked_add(size).filter(|total| limit.is_none_or(|limit| *total <= limit))
        });
        if let Err(used) = reserved {
            return AllocationFailedSnafu {
                allocator: self.name(),
                size,
                reason: format!("limit of {} bytes reached ({used} in use)", limit.unwrap_or(usize::MAX)),
            }
            .fail();
        }

        match HostMemory::zeroed(size) {
            Some(data) => Ok(RawBuffer::Host { data }),
            None => {
                self.in_use.fetch_sub(size, Ordering::AcqRel);
                AllocationFailedSnafu { allocator: self.name(), size, reason: "system allocator returned null" }.fail()
            }
        }
    }

    fn free(&self, buffer: RawBuffer) {
        self.in_use.fetch_sub(buffer.size(), Ordering::AcqRel);
    }

    fn name(&self) -> &str {
        "CPU"
    }

    fn device(&self) -> DeviceSpec {
        DeviceSpec::Cpu
    }
}

/// CUDA allocator using GPU memory.
#[cfg(feature = "cuda")]
#[derive(Debug, Clone)]
pub struct CudaAllocator {
    context: Arc<CudaContext>,
    device_id: usize,
}

#[cfg(feature = "cuda")]
impl CudaAllocator {
    pub fn new(device_id: usize) -> Result<Self> {
        let context = CudaContext::new(device_id).context(CudaSnafu)?;
        Ok(Self { context, device_id })
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    pub fn context(&self) -> &Arc<CudaContext> {
        &self.context
    }
}

#[cfg(feature = "cuda")]
impl Allocator for CudaAllocator {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer> {
        let stream = self.context.default_stream();
        let data = if options.zero_init { stream.alloc_zeros::<u8>(size) } else { unsafe { stream.alloc::<u8>(size) } }
            .map_err(|e| crate::Error::AllocationFailed {
                allocator: "CUDA".to_string(),
                size,
                reason: e.to_string(),
            })?;

        Ok(RawBuffer::Cuda { data, context: Arc::clone(&self.context) })
    }

    fn synchronize(&self) -> Result<()> {
        self.context.default_stream().synchronize().context(CudaSnafu)
    }

    fn name(&self) -> &str {
        "CUDA"
    }

    fn device(&self) -> DeviceSpec {
        DeviceSpec::Cuda { device_id: self.device_id }
    }
}

/// Counters reported by [`PoolAllocator::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    /// Allocations currently parked in the pool.
    pub cached: usize,
}

/// Allocator that keeps freed allocations for reuse by requests of the same size.
#[derive(Debug)]
pub struct PoolAllocator {
    inner: Arc<dyn Allocator>,
    cache: Mutex<HashMap<usize, Vec<RawBuffer>>>,
    max_buffers_per_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    name: String,
}

impl PoolAllocator {
    pub fn new(inner: Arc<dyn Allocator>) -> Self {
        Self::with_capacity(inner, 32)
    }

    pub fn with_capacity(inner: Arc<dyn Allocator>, max_buffers_per_size: usize) -> Self {
        let name = format!("{}+pool", inner.name());
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
            max_buffers_per_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            name,
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            cached: self.cache.lock().values().map(Vec::len).sum(),
        }
    }

    /// Return every parked allocation to the inner allocator.
    pub fn trim(&self) {
        let drained: Vec<RawBuffer> = self.cache.lock().drain().flat_map(|(_, buffers)| buffers).collect();
        for buffer in drained {
            self.inner.free(buffer);
        }
    }
}

impl Allocator for PoolAllocator {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer> {
        // Try cache first
        let cached = {
            let mut cache = self.cache.lock();
            let buffer = cache.get_mut(&size).and_then(Vec::pop);
            if cache.get(&size).is_some_and(Vec::is_empty) {
                cache.remove(&size);
            }
            buffer
        }; // Drop lock before expensive allocation

        if let Some(mut buffer) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(size, allocator = %self.name, "pool hit");
            if options.zero_init {
                buffer.zero()?;
            }
            return Ok(buffer);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        match self.inner.alloc(size, options) {
            Ok(buffer) => Ok(buffer),
            Err(error) => {
                // Out of memory with buffers parked here: give them back and retry once.
                tracing::debug!(size, %error, "pool miss failed, trimming cache and retrying");
                self.trim();
                self.inner.alloc(size, options).map_err(|_| error)
            }
        }
    }

    fn free(&self, buffer: RawBuffer) {
        let mut cache = self.cache.lock();
        let buffers = cache.entry(buffer.size()).or_default();
        if buffers.len() < self.max_buffers_per_size {
            buffers.push(buffer);
        } else {
            drop(cache);
            self.inner.free(buffer);
        }
    }

    fn synchronize(&self) -> Result<()> {
        self.inner.synchronize()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn device(&self) -> DeviceSpec {
        self.inner.device()
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        self.trim();
    }
}
