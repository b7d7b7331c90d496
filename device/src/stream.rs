//! Asynchronous execution streams.
//!
//! A [`Stream`] is an in-order queue of device work. Operations issued to
//! one stream complete in issue order; operations on different streams are
//! unordered unless the caller synchronizes. Issuing never blocks; only
//! [`Stream::synchronize`] and [`Stream::wait_for`] do.
//!
//! Every stream owns a worker thread that drains its queue. On CUDA the
//! stream also wraps a driver stream: each closure is preceded by an event
//! recorded at issue time, and the worker waits on that event before
//! running it.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle, ThreadId};

#[cfg(feature = "cuda")]
use cudarc::driver::CudaStream;
use nmt_dtype::{DeviceSpec, ScalarDType};
use parking_lot::Mutex;

use crate::error::{Result, StreamCreationFailedSnafu, StreamFailedSnafu};
use crate::fatal;
use crate::sync::{CpuTimelineSignal, TimelineSignal};

/// Shared handle to a stream. Two handles are the same stream iff
/// [`Arc::ptr_eq`] holds (equivalently, their ids match).
pub type StreamHandle = Arc<Stream>;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Creates execution streams for one device.
pub trait StreamFactory: Send + Sync + fmt::Debug {
    /// Create a stream that will carry work on `dtype` buffers for the calling thread.
    fn create_stream(&self, dtype: ScalarDType) -> Result<Stream>;

    fn device(&self) -> DeviceSpec;
}

/// Stream factory for the host backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostStreamFactory;

impl StreamFactory for HostStreamFactory {
    fn create_stream(&self, dtype: ScalarDType) -> Result<Stream> {
        Stream::host(dtype)
    }

    fn device(&self) -> DeviceSpec {
        DeviceSpec::Cpu
    }
}

type HostOp = Box<dyn FnOnce() + Send + 'static>;

struct HostQueue {
    sender: Option<mpsc::Sender<(u64, HostOp)>>,
    issued: u64,
}

/// Worker thread draining closures in issue order.
struct HostStream {
    queue: Mutex<HostQueue>,
    signal: Arc<CpuTimelineSignal>,
    worker: Option<JoinHandle<()>>,
}

impl HostStream {
    fn spawn(id: u64, device: DeviceSpec) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<(u64, HostOp)>();
        let signal = Arc::new(CpuTimelineSignal::new());
        let worker_signal = Arc::clone(&signal);

        let worker = thread::Builder::new()
            .name(format!("nmt-stream-{id}"))
            .spawn(move || {
                for (seq, op) in receiver {
                    if panic::catch_unwind(AssertUnwindSafe(op)).is_err() {
                        tracing::error!(stream = id, seq, "stream operation panicked");
                    }
                    worker_signal.set(seq);
                }
            })
            .map_err(|e| StreamCreationFailedSnafu { device: device.to_string(), reason: e.to_string() }.build())?;

        Ok(Self { queue: Mutex::new(HostQueue { sender: Some(sender), issued: 0 }), signal, worker: Some(worker) })
    }

    fn issued(&self) -> u64 {
        self.queue.lock().issued
    }

    fn submit(&self, stream: u64, op: HostOp) -> Result<u64> {
        let mut queue = self.queue.lock();
        let seq = queue.issued + 1;
        let sender =
            queue.sender.as_ref().ok_or_else(|| StreamFailedSnafu { stream, reason: "stream is shut down" }.build())?;
        sender.send((seq, op)).map_err(|_| StreamFailedSnafu { stream, reason: "stream worker exited" }.build())?;
        queue.issued = seq;
        Ok(seq)
    }

    fn wait(&self, value: u64) -> Result<()> {
        self.signal.wait(value, 0)
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish queued work and exit.
        self.queue.get_mut().sender.take();
        if let Some(worker) = self.worker.take()
            && worker.thread().id() != thread::current().id()
        {
            let _ = worker.join();
        }
    }
}

/// A driver stream plus a host worker that runs each closure once the
/// device work issued before it has finished.
#[cfg(feature = "cuda")]
struct CudaQueue {
    // Drained and joined before the driver stream goes away.
    host: HostStream,
    stream: Arc<CudaStream>,
}

enum Backend {
    Host(HostStream),
    #[cfg(feature = "cuda")]
    Cuda(CudaQueue),
}

impl Backend {
    fn host_stream(&self) -> &HostStream {
        match self {
            Backend::Host(host) => host,
            #[cfg(feature = "cuda")]
            Backend::Cuda(cuda) => &cuda.host,
        }
    }
}

/// An in-order execution stream bound to one thread and element type.
pub struct Stream {
    id: u64,
    dtype: ScalarDType,
    thread: ThreadId,
    device: DeviceSpec,
    backend: Backend,
}

impl Stream {
    /// Create a host stream owned by the calling thread.
    pub fn host(dtype: ScalarDType) -> Result<Self> {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let backend = Backend::Host(HostStream::spawn(id, DeviceSpec::Cpu)?);
        Ok(Self { id, dtype, thread: thread::current().id(), device: DeviceSpec::Cpu, backend })
    }

    /// Wrap a CUDA driver stream.
    #[cfg(feature = "cuda")]
    pub fn cuda(stream: Arc<CudaStream>, device_id: usize, dtype: ScalarDType) -> Result<Self> {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let device = DeviceSpec::Cuda { device_id };
        let backend = Backend::Cuda(CudaQueue { host: HostStream::spawn(id, device)?, stream });
        Ok(Self { id, dtype, thread: thread::current().id(), device, backend })
    }

    /// Process-unique stream id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dtype(&self) -> ScalarDType {
        self.dtype
    }

    /// Thread the stream was created for.
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn device(&self) -> DeviceSpec {
        self.device
    }

    /// Number of operations issued so far; also the timeline value of the last one.
    pub fn issued(&self) -> u64 {
        self.backend.host_stream().issued()
    }

    /// Timeline value of the last completed operation.
    pub fn completed(&self) -> u64 {
        self.backend.host_stream().signal.value()
    }

    /// Issue `op` behind all previously issued work and return its timeline value.
    pub fn try_enqueue<F>(&self, op: F) -> Result<u64>
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.backend {
            Backend::Host(host) => host.submit(self.id, Box::new(op)),
            #[cfg(feature = "cuda")]
            Backend::Cuda(cuda) => {
                use snafu::ResultExt;
                // Device work issued so far; only the worker waits on it.
                let event = cuda.stream.record_event(None).context(crate::error::CudaSnafu)?;
                let stream = self.id;
                cuda.host.submit(
                    stream,
                    Box::new(move || {
                        if let Err(error) = event.synchronize() {
                            tracing::error!(stream, %error, "waiting for device work failed");
                        }
                        op();
                    }),
                )
            }
        }
    }

    /// Like [`Stream::try_enqueue`], escalating failures to the fatal path.
    #[track_caller]
    pub fn enqueue<F>(&self, op: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        fatal::or_abort(self.try_enqueue(op))
    }

    /// Block until the operation with timeline value `value` has completed.
    pub fn try_wait_for(&self, value: u64) -> Result<()> {
        snafu::ensure!(
            value <= self.issued(),
            StreamFailedSnafu { stream: self.id, reason: format!("waiting for unissued operation {value}") }
        );
        self.backend.host_stream().wait(value)
    }

    #[track_caller]
    pub fn wait_for(&self, value: u64) {
        fatal::or_abort(self.try_wait_for(value))
    }

    /// Block until every issued operation has completed.
    pub fn try_synchronize(&self) -> Result<()> {
        let host = self.backend.host_stream();
        host.wait(host.issued())?;
        #[cfg(feature = "cuda")]
        if let Backend::Cuda(cuda) = &self.backend {
            use snafu::ResultExt;
            cuda.stream.synchronize().context(crate::error::CudaSnafu)?;
        }
        Ok(())
    }

    #[track_caller]
    pub fn synchronize(&self) {
        fatal::or_abort(self.try_synchronize())
    }
}

impl PartialEq for Stream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Stream {}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("dtype", &self.dtype)
            .field("thread", &self.thread)
            .field("device", &self.device)
            .field("issued", &self.issued())
            .field("completed", &self.completed())
            .finish()
    }
}

#[cfg(feature = "cuda")]
impl StreamFactory for crate::allocator::CudaAllocator {
    fn create_stream(&self, dtype: ScalarDType) -> Result<Stream> {
        let stream = self.context().new_stream().map_err(|e| {
            let device = DeviceSpec::Cuda { device_id: self.device_id() };
            StreamCreationFailedSnafu { device: device.to_string(), reason: e.to_string() }.build()
        })?;
        Stream::cuda(stream, self.device_id(), dtype)
    }

    fn device(&self) -> DeviceSpec {
        DeviceSpec::Cuda { device_id: self.device_id() }
    }
}
