//! Error types shared by every peernet layer.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Frame errors
    /// A frame arrived out of sequence.
    #[error("frame ordinal mismatch: expected {expected}, got {got}")]
    OrdinalMismatch {
        /// Ordinal the reader was waiting for.
        expected: u32,
        /// Ordinal carried by the received header.
        got: u32,
    },

    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    // HTTP-over-frames errors
    /// Request or response header frame is malformed or misses a field.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// A signal frame other than the expected marker was received.
    #[error("unexpected signal frame: {0}")]
    UnexpectedSignal(String),

    /// An upgraded frame is empty or carries an unknown message tag.
    #[error("invalid websocket frame: {0}")]
    InvalidWebSocketFrame(String),

    /// URL could not be parsed into a peer address.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Transport negotiation with the remote peer did not complete.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The remote peer has nothing listening on the requested port.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The underlying transport reported an error.
    #[error("transport error: {0}")]
    Transport(String),

    // Resource misuse
    /// Port is already bound on this transport.
    #[error("address in use: port {port}")]
    AddressInUse {
        /// The contested port.
        port: u16,
    },

    /// Operation on a resource that has been disposed.
    #[error("{0} has been disposed")]
    Disposed(&'static str),

    /// Read or write on a closed socket.
    #[error("socket closed: {0}")]
    SocketClosed(String),

    /// Semaphore created with a concurrency below one.
    #[error("invalid concurrency: {0} (must be at least 1)")]
    InvalidConcurrency(usize),

    /// A deferred value was rejected.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Returns true for errors that are fatal to the stream they occurred on.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ProtocolError::OrdinalMismatch { .. }
                | ProtocolError::FrameTooLarge { .. }
                | ProtocolError::MalformedHeader(_)
                | ProtocolError::UnexpectedSignal(_)
                | ProtocolError::InvalidWebSocketFrame(_)
        )
    }
}

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Transport(err.to_string()),
        }
    }
}
