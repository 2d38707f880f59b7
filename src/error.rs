//! Error taxonomy shared by the client and viewer cores.
//!
//! All failures are explicit return values; the public client API swallows
//! them (logging must never perturb the host application), the viewer
//! surfaces them through the delegate's disconnect notification.

use std::io;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket-level failure. Triggers a reconnect on the client and
    /// terminates the session on the viewer.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// TLS setup or handshake failure.
    #[cfg(feature = "tls")]
    #[error("tls error: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    /// Malformed or out-of-contract data on the wire. Fatal for the
    /// session on both sides.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The bounded queue refused a record while non-buffering.
    #[error("capacity exceeded, record dropped")]
    Capacity,

    /// Bad certificate, port in use, and similar startup-time problems.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Normal shutdown path; not a failure.
    #[error("operation cancelled")]
    Cancelled,
}

/// Session-fatal wire violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// A frame or part length exceeds what remains readable.
    #[error("bad length: declared {declared} bytes, {available} available")]
    BadLength { declared: u32, available: u32 },

    /// The part type tag is outside the wire contract, so the part length
    /// cannot be determined.
    #[error("unknown part type {part_type} for key {key}")]
    UnknownType { key: u8, part_type: u8 },

    /// A frame lacks a part required for its message type.
    #[error("missing required part key {key}")]
    MissingPart { key: u8 },

    /// A string part does not decode as UTF-8.
    #[error("invalid utf-8 in part key {key}")]
    InvalidUtf8 { key: u8 },

    /// Sequence numbers must be densely contiguous within a run.
    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u32, got: u32 },

    /// The first frame of a connection was not CLIENT_INFO.
    #[error("first frame was not client info")]
    UnexpectedFirstFrame,

    /// A CLIENT_INFO frame changed `unique_id` mid-session.
    #[error("client identity changed mid-session")]
    IdentityMismatch,
}

pub type Result<T> = std::result::Result<T, Error>;
