//! Fault injection for exercising the unrecoverable-failure path.
//!
//! Both wrappers let a fixed number of calls through and fail every call
//! after that, so a test can place a failure at an exact point in a
//! sequence of operations.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use nmt_dtype::{DeviceSpec, ScalarDType};

use crate::allocator::{Allocator, BufferOptions, RawBuffer};
use crate::error::{AllocationFailedSnafu, Result, StreamCreationFailedSnafu};
use crate::stream::{Stream, StreamFactory};

/// Take one unit from `budget`, or report that it is exhausted.
fn take_one(budget: &AtomicUsize) -> bool {
    budget.fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1)).is_ok()
}

/// Allocator that fails once `successes` allocations have been served.
#[derive(Debug)]
pub struct FaultyAllocator {
    inner: Arc<dyn Allocator>,
    remaining: AtomicUsize,
    name: String,
}

impl FaultyAllocator {
    pub fn fail_after(inner: Arc<dyn Allocator>, successes: usize) -> Self {
        let name = format!("{}+faulty", inner.name());
        Self { inner, remaining: AtomicUsize::new(successes), name }
    }

    /// Allocations still allowed before failures start.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

impl Allocator for FaultyAllocator {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer> {
        if !take_one(&self.remaining) {
            return AllocationFailedSnafu { allocator: self.name(), size, reason: "injected failure" }.fail();
        }
        self.inner.alloc(size, options)
    }

    fn free(&self, buffer: RawBuffer) {
        self.inner.free(buffer)
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

/// Stream factory that fails once `successes` streams have been created.
#[derive(Debug)]
pub struct FaultyStreamFactory {
    inner: Arc<dyn StreamFactory>,
    remaining: AtomicUsize,
}

impl FaultyStreamFactory {
    pub fn fail_after(inner: Arc<dyn StreamFactory>, successes: usize) -> Self {
        Self { inner, remaining: AtomicUsize::new(successes) }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

impl StreamFactory for FaultyStreamFactory {
    fn create_stream(&self, dtype: ScalarDType) -> Result<Stream> {
        if !take_one(&self.remaining) {
            return StreamCreationFailedSnafu {
                device: self.inner.device().to_string(),
                reason: format!("injected failure for {dtype} stream"),
            }
            .fail();
        }
        self.inner.create_stream(dtype)
    }

    fn device(&self) -> DeviceSpec {
        self.inner.device()
    }
}
