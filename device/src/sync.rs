//! Timeline synchronization primitives for stream ordering.
//!
//! A timeline signal is a monotonically increasing counter. A stream bumps
//! it as operations complete in issue order, so waiting for value `n` means
//! waiting for the `n`-th issued operation and everything before it.
//!
//! # Example
//!
//! ```ignore
//! let signal = CpuTimelineSignal::new();
//!
//! // Worker thread
//! signal.set(1);  // Operation 1 completed
//!
//! // Issuing thread
//! signal.wait(1, 1000)?;  // Wait for operation 1
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, TimeoutSnafu};

/// Monotonic timeline signal for synchronization.
///
/// All implementations must be `Send + Sync` for cross-thread use.
pub trait TimelineSignal: Send + Sync + std::fmt::Debug {
    /// Get the current signal value.
    fn value(&self) -> u64;

    /// Raise the signal to `value`. Lower values are ignored.
    fn set(&self, value: u64);

    /// Wait for the signal to reach or exceed `value`.
    ///
    /// `timeout_ms == 0` waits without limit.
    fn wait(&self, value: u64, timeout_ms: u64) -> Result<()>;

    /// Check if the signal has reached `value` without blocking.
    fn is_reached(&self, value: u64) -> bool {
        self.value() >= value
    }
}

/// CPU timeline signal using an atomic counter and a condvar.
#[derive(Debug)]
pub struct CpuTimelineSignal {
    value: AtomicU64,
    /// Protects nothing; pairs with the condvar.
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Default for CpuTimelineSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuTimelineSignal {
    /// Create a new CPU timeline signal starting at 0.
    pub fn new() -> Self {
        Self::with_initial(0)
    }

    pub fn with_initial(initial: u64) -> Self {
        Self { value: AtomicU64::new(initial), mutex: Mutex::new(()), condvar: Condvar::new() }
    }
}

impl TimelineSignal for CpuTimelineSignal {
    fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    fn set(&self, value: u64) {
        // Taking the mutex orders the store against a waiter that has checked
        // the value but not yet parked.
        let _guard = self.mutex.lock();
        self.value.fetch_max(value, Ordering::AcqRel);
        self.condvar.notify_all();
    }

    fn wait(&self, target: u64, timeout_ms: u64) -> Result<()> {
        // Fast path: already reached
        if self.value.load(Ordering::Acquire) >= target {
            return Ok(());
        }

        let mut guard = self.mutex.lock();

        if timeout_ms == 0 {
            while self.value.load(Ordering::Acquire) < target {
                self.condvar.wait(&mut guard);
            }
            return Ok(());
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        while self.value.load(Ordering::Acquire) < target {
            if self.condvar.wait_until(&mut guard, deadline).timed_out() {
                let current = self.value.load(Ordering::Acquire);
                snafu::ensure!(current >= target, TimeoutSnafu { waited_ms: timeout_ms, target, current });
            }
        }
        Ok(())
    }
}
