// ABOUTME: Error types for the buffer, framing, WebSocket, and protocol layers
// ABOUTME: Each layer gets its own thiserror enum; BoltError aggregates them for the connection API

use thiserror::Error;

use crate::state::{MessageType, ProtocolState};

/// Errors raised by the chunked buffer (component A).
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("cursor offset {offset} is out of range for a buffer with {allocated} bytes allocated")]
    OutOfRange { offset: u64, allocated: u64 },

    #[error("attempted to read {needed} bytes but only {available} are buffered")]
    ShortRead { needed: usize, available: usize },

    #[error("cursor ordering violated: {0:?} must not precede {1:?}")]
    Misordered(crate::buffer::Cursor, crate::buffer::Cursor),

    #[error("chunk allocation failed")]
    ChunkAllocationFailed,

    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while assembling or emitting Bolt chunk-framed messages
/// (component C).
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("buffer error while framing: {0}")]
    Buffer(#[from] BufferError),

    #[error("chunk length {0} would overflow the message size limit")]
    MessageTooLarge(usize),

    #[error("connection closed mid-message")]
    Truncated,
}

/// Errors raised by the WebSocket framing layer (component B).
#[derive(Debug, Error)]
pub enum WsError {
    #[error("buffer error while handling a WebSocket frame: {0}")]
    Buffer(#[from] BufferError),

    #[error("handshake request is missing the Sec-WebSocket-Key header")]
    MissingKey,

    #[error("reserved opcode {0:#x} is not supported")]
    ReservedOpcode(u8),

    #[error("control frame payload of {0} bytes exceeds the 125 byte limit")]
    ControlFrameTooLarge(usize),

    #[error("RSV bits set without a negotiated extension")]
    ReservedBitsSet,
}

/// A `(state, request, response)` triple the state machine does not permit.
#[derive(Debug, Error)]
#[error("{request:?}/{response:?} is not a legal reply in state {state:?}")]
pub struct IllegalTransition {
    pub state: ProtocolState,
    pub request: MessageType,
    pub response: MessageType,
}

/// Top-level error for connection operations, aggregating every layer per
/// the dispositions in the error handling design (transport, framing,
/// protocol violation, allocation).
#[derive(Debug, Error)]
pub enum BoltError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("protocol violation: {0}")]
    Protocol(#[from] IllegalTransition),

    #[error("invalid Bolt handshake: {0}")]
    Handshake(String),
}

impl From<BufferError> for BoltError {
    fn from(err: BufferError) -> Self {
        BoltError::Framing(FramingError::Buffer(err))
    }
}

/// A specialized `Result` type for connection operations.
pub type BoltResult<T> = std::result::Result<T, BoltError>;

/// Boxed error type for convenience at API boundaries that need to absorb
/// errors of any kind, mirroring the teacher crate's top-level `Error` alias.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type using the boxed error.
pub type Result<T> = std::result::Result<T, Error>;
