//! Storage error types.

use manykv_protocol::ErrorCode;
use thiserror::Error;

/// Errors from a storage engine or a write hook.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failure carrying a protocol error code that may be shown to guests.
    #[error("{code}: {message}")]
    Coded { code: ErrorCode, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cursor is closed")]
    CursorClosed,

    #[error("storage error: {0}")]
    Other(String),
}

impl StoreError {
    pub fn coded(code: ErrorCode, message: impl Into<String>) -> Self {
        StoreError::Coded {
            code,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        StoreError::Other(message.into())
    }

    /// Returns the protocol code carried by the error, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            StoreError::Coded { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns the code to transmit for this error. Errors without a
    /// recognized code are reported as [`ErrorCode::RemoteError`].
    pub fn wire_code(&self) -> ErrorCode {
        self.code().unwrap_or(ErrorCode::RemoteError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_code() {
        let err = StoreError::coded(ErrorCode::Corruption, "bad block");
        assert_eq!(err.wire_code(), ErrorCode::Corruption);
        assert_eq!(err.to_string(), "CORRUPTION: bad block");

        let err = StoreError::other("disk on fire");
        assert_eq!(err.code(), None);
        assert_eq!(err.wire_code(), ErrorCode::RemoteError);

        let err = StoreError::from(std::io::Error::new(std::io::ErrorKind::Other, "eio"));
        assert_eq!(err.wire_code(), ErrorCode::RemoteError);
    }
}
