//! Error types for clipsync-relay.

use clipsync_types::{DeviceId, WireError};

/// Main error type for clipsync-relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol layer errors.
///
/// Each of these ends the offending connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame or envelope could not be decoded.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The first frame was not a `register` control.
    #[error("session not registered: register required first")]
    NotRegistered,

    /// No `register` arrived within the hello timeout.
    #[error("no register within {secs}s")]
    HelloTimeout {
        /// Configured timeout.
        secs: u64,
    },

    /// Socket failure.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// A newer registration for the same device took over.
    #[error("session for {0} replaced by a newer connection")]
    Replaced(DeviceId),

    /// Another connection already holds this device id.
    #[error("{0} is already registered by another connection")]
    AlreadyRegistered(DeviceId),
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_converts_to_relay_error() {
        let err: RelayError = ProtocolError::NotRegistered.into();
        assert!(matches!(err, RelayError::Protocol(ProtocolError::NotRegistered)));
        assert_eq!(
            err.to_string(),
            "protocol error: session not registered: register required first"
        );
    }

    #[test]
    fn wire_error_keeps_detail() {
        let err: ProtocolError = WireError::FrameTooLarge { len: 9, max: 4 }.into();
        assert_eq!(err.to_string(), "wire error: frame too large: 9 bytes (limit: 4 bytes)");
    }
}
