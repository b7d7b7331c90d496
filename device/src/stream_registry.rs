//! Per-thread, per-element-type execution streams.
//!
//! A [`StreamRegistry`] hands out one stream per (calling thread, element
//! type) pair. The stream is created on first request and kept for as long
//! as the registry lives, so repeated requests from the same thread return
//! the same handle and everything issued through it stays ordered.
//!
//! The registry is an ordinary value passed to whoever issues asynchronous
//! work; tests substitute their own by constructing one over a different
//! [`StreamFactory`].
//!
//! # Thread Safety
//!
//! The map is append-only and lock-free (papaya). A lookup never blocks.
//! Because the key contains the calling thread's id, two threads never race
//! to create the same entry; insertion still goes through an atomic
//! compute so the invariant holds even if a handle is created elsewhere.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use nmt_dtype::{HasDType, ScalarDType};
use papaya::HashMap;

use crate::error::Result;
use crate::fatal;
use crate::stream::{StreamFactory, StreamHandle};

/// Registry key: the requesting thread and the element type of the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub thread: ThreadId,
    pub dtype: ScalarDType,
}

impl StreamKey {
    /// Key for the calling thread.
    pub fn current<T: HasDType>() -> Self {
        Self { thread: thread::current().id(), dtype: T::DTYPE }
    }
}

pub struct StreamRegistry {
    factory: Arc<dyn StreamFactory>,
    streams: HashMap<StreamKey, StreamHandle>,
}

impl StreamRegistry {
    pub fn new(factory: Arc<dyn StreamFactory>) -> Self {
        Self { factory, streams: HashMap::new() }
    }

    /// Stream for the calling thread and element type `T`, created on first use.
    ///
    /// Stream creation failure is unrecoverable.
    #[track_caller]
    pub fn get_stream<T: HasDType>(&self) -> StreamHandle {
        fatal::or_abort(self.try_get_stream::<T>())
    }

    pub fn try_get_stream<T: HasDType>(&self) -> Result<StreamHandle> {
        self.get_or_create(StreamKey::current::<T>())
    }

    fn get_or_create(&self, key: StreamKey) -> Result<StreamHandle> {
        let guard = self.streams.guard();

        // Fast path: steady state after the first request
        if let Some(stream) = self.streams.get(&key, &guard) {
            return Ok(Arc::clone(stream));
        }

        let created = Arc::new(self.factory.create_stream(key.dtype)?);
        tracing::debug!(
            stream = created.id(),
            dtype = %key.dtype,
            thread = ?key.thread,
            device = %self.factory.device(),
            "created execution stream"
        );

        use papaya::{Compute, Operation};
        match self.streams.compute(
            key,
            |entry| match entry {
                Some((_, existing)) => Operation::Abort(Arc::clone(existing)),
                None => Operation::Insert(Arc::clone(&created)),
            },
            &guard,
        ) {
            Compute::Inserted(_, stream) => Ok(Arc::clone(stream)),
            Compute::Aborted(stream) => Ok(stream),
            _ => Ok(created),
        }
    }

    /// Stream already registered for `key`, without creating one.
    pub fn lookup(&self, key: &StreamKey) -> Option<StreamHandle> {
        let guard = self.streams.guard();
        self.streams.get(key, &guard).map(Arc::clone)
    }

    /// Number of live streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Block until every registered stream has drained.
    #[track_caller]
    pub fn synchronize_all(&self) {
        let guard = self.streams.guard();
        for (_, stream) in self.streams.iter(&guard) {
            stream.synchronize();
        }
    }

    pub fn factory(&self) -> &Arc<dyn StreamFactory> {
        &self.factory
    }
}

impl fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRegistry").field("factory", &self.factory).field("streams", &self.len()).finish()
    }
}
