//! Protocol error types and wire constants.

use thiserror::Error;

/// Maximum frame size in bytes (length prefix excluded).
///
/// Matches the largest message the connection-oriented transports this
/// server descends from will carry; validated before any allocation.
pub const MAX_FRAME_SIZE: usize = 65535;

/// Lowest protocol version this server speaks.
pub const PROTO_MIN_VERSION: u32 = 2;

/// Highest protocol version this server speaks.
pub const PROTO_MAX_VERSION: u32 = 2;

/// Error at the framing or message-decoding layer.
///
/// Any of these is a protocol violation: the session is closed without
/// further ceremony.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame length prefix exceeded the cap.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Announced payload length.
        size: usize,
        /// The configured cap.
        max: usize,
    },

    /// A frame payload was not a valid protocol record.
    #[error("malformed protocol message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Transport-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias for protocol-layer results.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
