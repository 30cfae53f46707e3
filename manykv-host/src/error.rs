//! Host error types.

use crate::config::ConfigError;
use thiserror::Error;

/// Host errors.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] manykv_protocol::ProtocolError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("host shutting down")]
    ShuttingDown,
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_config_error_converts() {
        let err: HostError = ConfigError::Parse {
            path: PathBuf::from("manykv.yaml"),
            message: "invalid type".into(),
        }
        .into();
        assert!(matches!(err, HostError::Config(_)));
        assert!(err.to_string().contains("manykv.yaml"));
    }

    #[test]
    fn test_protocol_error_converts() {
        let err: HostError = manykv_protocol::ProtocolError::PrefixTooLong { max: 10 }.into();
        assert!(matches!(err, HostError::Protocol(_)));
        assert!(err.to_string().contains("10 bytes"));
    }
}
