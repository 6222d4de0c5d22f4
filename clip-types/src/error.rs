//! Error types for the clipsync wire format.

use thiserror::Error;

/// Errors produced while encoding, decoding, or framing wire messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// JSON serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    /// JSON deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] serde_json::Error),

    /// Unsupported protocol version string
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// Envelope type does not match its payload
    #[error("envelope type {declared} does not match payload")]
    TypeMismatch {
        /// The declared `type` field.
        declared: &'static str,
    },

    /// Invalid device identifier
    #[error("invalid device id: {0:?}")]
    InvalidDeviceId(String),

    /// Frame exceeds the configured maximum
    #[error("frame too large: {len} bytes (limit: {max} bytes)")]
    FrameTooLarge {
        /// Declared or actual payload length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = WireError::FrameTooLarge { len: 10, max: 5 };
        assert_eq!(err.to_string(), "frame too large: 10 bytes (limit: 5 bytes)");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WireError>();
    }
}
