//! Unrecoverable failure policy.
//!
//! Device memory exhaustion and driver failures have no degraded mode in the
//! middle of an inference step, so public buffer and stream operations route
//! them to [`unrecoverable`], which terminates the process. Internally every
//! layer still returns [`Result`]; escalation happens only at the public edge.
//!
//! Test harnesses observe the fatal path without losing the process through
//! [`catch_unrecoverable`]: on the calling thread the abort is replaced by an
//! unwind carrying the error, which is caught and handed back as `Err`.
//!
//! ```ignore
//! let allocator: Arc<dyn Allocator> = Arc::new(FaultyAllocator::fail_after(Arc::new(HostAllocator::new()), 0));
//! let result = catch_unrecoverable(|| DeviceBuffer::<f32>::with_len(&allocator, 16));
//! assert!(matches!(result, Err(Error::AllocationFailed { .. })));
//! ```

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};

use crate::error::{Error, Result};

thread_local! {
    static CAPTURE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Unwind payload used while [`catch_unrecoverable`] is active.
struct Unrecoverable(Error);

/// Terminate on an unrecoverable error.
///
/// Inside [`catch_unrecoverable`] this unwinds to the capture point instead.
#[cold]
#[track_caller]
pub fn unrecoverable(error: Error) -> ! {
    if CAPTURE_DEPTH.with(Cell::get) > 0 {
        tracing::debug!(%error, "unrecoverable device failure captured");
        // resume_unwind skips the panic hook, so captured failures stay quiet.
        panic::resume_unwind(Box::new(Unrecoverable(error)));
    }

    let location = std::panic::Location::caller();
    tracing::error!(%error, %location, "unrecoverable device failure, aborting");
    eprintln!("fatal: {error} (at {location})");
    std::process::abort()
}

/// Unwrap `result` or escalate its error through [`unrecoverable`].
#[inline]
#[track_caller]
pub fn or_abort<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(error) => unrecoverable(error),
    }
}

/// Run `f` with fatal failures on this thread converted into `Err`.
///
/// Ordinary panics inside `f` keep propagating. Captures nest; the previous
/// mode is restored on exit even when `f` unwinds.
pub fn catch_unrecoverable<R>(f: impl FnOnce() -> R) -> Result<R> {
    struct DepthGuard;

    impl Drop for DepthGuard {
        fn drop(&mut self) {
            CAPTURE_DEPTH.with(|depth| depth.set(depth.get() - 1));
        }
    }

    CAPTURE_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let guard = DepthGuard;
    let outcome = panic::catch_unwind(AssertUnwindSafe(f));
    drop(guard);

    match outcome {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<Unrecoverable>() {
            Ok(fatal) => Err(fatal.0),
            Err(payload) => panic::resume_unwind(payload),
        },
    }
}

/// Whether fatal failures on this thread are currently being captured.
pub fn is_capturing() -> bool {
    CAPTURE_DEPTH.with(Cell::get) > 0
}
