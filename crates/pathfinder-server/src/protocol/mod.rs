//! Wire protocol: framing and message types.
//!
//! The protocol stack, bottom up:
//!
//! ```text
//! +-----------------------------------------+
//! |        Requests / Responses             |  JSON records (messages)
//! +-----------------------------------------+
//! |             Framing                     |  4-byte BE length prefix
//! +-----------------------------------------+
//! |        TCP / Unix socket                |  transport
//! +-----------------------------------------+
//! ```
//!
//! Frame sizes are validated before allocation and unknown commands or
//! message types fail decoding; both are protocol violations that close
//! the session.

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{MAX_FRAME_SIZE, PROTO_MAX_VERSION, PROTO_MIN_VERSION, ProtocolError};
pub use framing::FrameCodec;
pub use messages::{
    AcceptBody, Command, FailReason, NotifyBody, Request, Response, ResponseBody, epoch_seconds,
};
