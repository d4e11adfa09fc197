//! Error types for the decode pipeline.
//!
//! Accelerator implementations report [`AccelError`]; everything that crosses
//! the session API is a [`VpuError`]. Raw accelerator status codes never leave
//! the drive loop, they are translated into one of the variants below.

use thiserror::Error;

use crate::accel::CodecFormat;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, VpuError>;

/// Errors surfaced by a decode session.
///
/// The type is `Clone` so a fatal condition can be latched in the session and
/// replayed to every later `put_packet`/`get_frame` call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VpuError {
    /// The next stream buffer slot is still owned by the decoder.
    #[error("stream buffer slot {slot} is still in use, retry once the decoder consumed it")]
    WouldBlock { slot: usize },

    /// The accelerator rejected the stream.
    #[error("{format} stream is not supported by the decoder core")]
    StreamNotSupported { format: CodecFormat },

    /// Legacy error-resilience tooling cannot run in multi-core mode.
    #[error("stream uses advanced error-resilience tooling, not decodable in multi-core mode")]
    AdvancedTooling,

    /// The accelerator reported a hardware hang.
    #[error("decoder hardware timed out")]
    HardwareTimeout,

    /// The accelerator reported an unrecoverable system error.
    #[error("decoder system error: {0}")]
    SystemError(String),

    /// A DMA allocation failed.
    #[error("no buffer memory: failed to allocate {requested} bytes")]
    OutOfMemory { requested: usize },

    /// A buffer request would exceed the external buffer cap.
    #[error("external buffer request for {requested} buffers exceeds the limit of {limit}")]
    BufferLimit { requested: usize, limit: usize },

    /// Internal buffer bookkeeping disagrees with the accelerator.
    #[error("buffer bookkeeping inconsistency: {0}")]
    BufferInconsistency(String),

    /// Too many frames are held by the consumer.
    #[error("outstanding frame table is full ({capacity} entries), consumer is not returning frames")]
    ConsumeTableFull { capacity: usize },

    /// The frame id is not outstanding (never handed out or already returned).
    #[error("frame {0} is not outstanding")]
    UnknownFrame(u64),

    /// The call is not valid in the current session state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The session configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Any other accelerator failure.
    #[error("accelerator error: {0}")]
    Accelerator(#[from] AccelError),
}

impl VpuError {
    /// Whether this error terminates the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            VpuError::WouldBlock { .. }
                | VpuError::UnknownFrame(_)
                | VpuError::InvalidState(_)
                | VpuError::Config(_)
        )
    }
}

/// Errors returned by accelerator entry points.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccelError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("no sequence headers decoded yet")]
    NoSequence,

    #[error("decoder instance has been released")]
    Released,

    #[error("buffer {0:#x} is not known to the decoder")]
    UnknownBuffer(u64),

    #[error("picture {0} is not owned by the consumer")]
    UnknownPicture(u32),
}
