//! Protocol error types and error codes.

use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("length prefix exceeds {max} bytes")]
    PrefixTooLong { max: usize },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("unexpected end of payload: need {needed} more bytes")]
    Truncated { needed: usize },

    #[error("varint overflows {bits} bits")]
    VarintOverflow { bits: u32 },

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: u64 },

    #[error("unknown tag: {0}")]
    UnknownTag(u8),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,
}

impl ProtocolError {
    /// Returns whether the error corrupts the stream itself, as opposed to a
    /// single frame whose payload could not be decoded.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::PrefixTooLong { .. } | ProtocolError::FrameTooLarge { .. }
        )
    }
}

/// Stable error codes carried in callback and iterator error messages.
///
/// These codes are part of the protocol contract and must remain stable
/// across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The stream was torn down while work was pending.
    ConnectionLost,
    /// The operation was issued on a closed database.
    DatabaseNotOpen,
    /// A write was attempted against a read-only host.
    Readonly,
    /// The host failed for a reason it does not disclose.
    RemoteError,
    /// A storage read failed while iterating.
    IteratorReadFailed,
    /// The storage engine does not support the operation.
    NotSupported,
    /// The storage engine found corrupt data.
    Corruption,
}

impl ErrorCode {
    /// All recognized codes.
    pub const ALL: [ErrorCode; 7] = [
        ErrorCode::ConnectionLost,
        ErrorCode::DatabaseNotOpen,
        ErrorCode::Readonly,
        ErrorCode::RemoteError,
        ErrorCode::IteratorReadFailed,
        ErrorCode::NotSupported,
        ErrorCode::Corruption,
    ];

    /// Returns the wire representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionLost => "CONNECTION_LOST",
            ErrorCode::DatabaseNotOpen => "DATABASE_NOT_OPEN",
            ErrorCode::Readonly => "READONLY",
            ErrorCode::RemoteError => "REMOTE_ERROR",
            ErrorCode::IteratorReadFailed => "ITERATOR_READ_FAILED",
            ErrorCode::NotSupported => "NOT_SUPPORTED",
            ErrorCode::Corruption => "CORRUPTION",
        }
    }

    /// Parses a recognized code from its wire representation.
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == code)
    }

    /// Parses a code received from a peer. Unrecognized codes say nothing
    /// about their cause, so they collapse to [`ErrorCode::RemoteError`].
    pub fn from_wire(code: &str) -> Self {
        Self::from_code(code).unwrap_or(ErrorCode::RemoteError)
    }

    /// Returns whether the operation may succeed if re-issued on a new stream.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::ConnectionLost)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
