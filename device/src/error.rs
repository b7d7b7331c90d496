use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The device allocator could not provide the requested memory.
    #[snafu(display("{allocator} allocation of {size} bytes failed: {reason}"))]
    AllocationFailed { allocator: String, size: usize, reason: String },

    /// The device runtime could not create an execution stream.
    #[snafu(display("stream creation failed on {device}: {reason}"))]
    StreamCreationFailed { device: String, reason: String },

    /// A stream stopped accepting or completing work.
    #[snafu(display("stream {stream} failed: {reason}"))]
    StreamFailed { stream: u64, reason: String },

    /// A timeline wait ran out of time.
    #[snafu(display("timeline signal timeout: waited {waited_ms}ms for value {target}, current {current}"))]
    Timeout { waited_ms: u64, target: u64, current: u64 },

    #[snafu(display("size mismatch: expected {expected}, got {actual}"))]
    SizeMismatch { expected: usize, actual: usize },

    /// Byte range outside of a raw allocation.
    #[snafu(display("invalid range: offset {offset} + size {size} exceeds allocation size {buffer_size}"))]
    InvalidRange { offset: usize, size: usize, buffer_size: usize },

    /// Failed to copy data between host and device.
    #[snafu(display("copy operation failed: {reason}"))]
    CopyFailed { reason: String },

    /// Invalid device specification.
    #[snafu(display("invalid device: {device}"))]
    InvalidDevice { device: String },

    /// Configuration value that could not be parsed.
    #[snafu(display("invalid value {value:?} for {key}"))]
    InvalidConfig { key: String, value: String },

    #[cfg(feature = "cuda")]
    /// CUDA-specific errors.
    #[snafu(display("CUDA error: {source}"))]
    Cuda { source: cudarc::driver::DriverError },
}

impl Error {
    /// Whether this error terminates the process once it reaches a public
    /// buffer or stream operation (see [`crate::fatal`]).
    pub fn is_unrecoverable(&self) -> bool {
        match self {
            Self::AllocationFailed { .. }
            | Self::StreamCreationFailed { .. }
            | Self::StreamFailed { .. }
            | Self::CopyFailed { .. } => true,
            #[cfg(feature = "cuda")]
            Self::Cuda { .. } => true,
            _ => false,
        }
    }
}
