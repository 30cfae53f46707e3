//! Guest error types.

use manykv_protocol::{ErrorCode, ProtocolError};
use manykv_storage::StoreError;
use thiserror::Error;

/// Guest errors.
#[derive(Debug, Error)]
pub enum GuestError {
    #[error("connection lost")]
    ConnectionLost,

    #[error("database is not open")]
    NotOpen,

    #[error("a stream is already connected")]
    AlreadyConnected,

    #[error("{op} failed: {code}")]
    Remote { op: &'static str, code: ErrorCode },

    #[error("iterator read failed: {cause}")]
    IteratorRead { cause: ErrorCode },

    #[error("unexpected reply to {op}")]
    UnexpectedReply { op: &'static str },

    #[error("local store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl GuestError {
    /// Returns the protocol error code describing this error, if there is one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            GuestError::ConnectionLost => Some(ErrorCode::ConnectionLost),
            GuestError::NotOpen => Some(ErrorCode::DatabaseNotOpen),
            GuestError::Remote { code, .. } => Some(*code),
            GuestError::IteratorRead { .. } => Some(ErrorCode::IteratorReadFailed),
            GuestError::Store(e) => e.code(),
            _ => None,
        }
    }

    /// Returns whether the operation may succeed if issued again on a new stream.
    pub fn is_retryable(&self) -> bool {
        match self {
            GuestError::Io(_) => true,
            GuestError::ConnectionLost => true,
            GuestError::Remote { code, .. } => code.is_retryable(),
            _ => false,
        }
    }
}
