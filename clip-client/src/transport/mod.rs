//! Transport abstraction for clipsync.
//!
//! Two transports carry the same frames:
//! - [`DirectTransport`]: authenticated TCP links to individual peers
//! - [`RelayTransport`]: one TCP link to the relay, which routes by target
//!
//! A transport only moves encoded envelope bytes; encryption happens above it
//! and the length prefix is added below it. Inbound frames from every
//! transport are funneled into one `mpsc` channel of [`InboundFrame`]s that
//! the sync coordinator drains.
//!
//! Each transport owns its [`PeerConnectionRecord`]s and publishes
//! [`ConnectionEvent`]s on a broadcast channel; consumers subscribe rather
//! than registering callbacks.

mod direct;
mod framed;
mod mock;
mod relay;

pub use direct::{DirectConfig, DirectTransport, DIRECT_PROOF_DOMAIN};
pub use framed::{write_envelope, write_frame, FrameReader};
pub use mock::MockTransport;
pub use relay::{RelayConfig, RelayTransport};

use async_trait::async_trait;
use clipsync_core::{ConnectionEvent, PeerConnectionRecord, TransportKind};
use clipsync_types::{DeviceId, WireError};
use thiserror::Error;
use tokio::sync::broadcast;

/// Capacity of each transport's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Operation timed out.
    #[error("timed out")]
    Timeout,

    /// No usable link to the peer on this transport.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(DeviceId),

    /// The peer presented an identity that does not match its trust record.
    #[error("fingerprint mismatch for {peer}: {reason}")]
    FingerprintMismatch {
        /// Claimed peer id.
        peer: String,
        /// What did not match.
        reason: String,
    },

    /// The address was answered by a different device than the one dialed.
    #[error("expected {expected} at that address, got {actual}")]
    UnexpectedPeer {
        /// Device we dialed.
        expected: DeviceId,
        /// Device that answered.
        actual: DeviceId,
    },

    /// Frame exceeds the configured maximum; the connection is closed.
    #[error("frame too large: {len} bytes (limit: {max} bytes)")]
    FrameTooLarge {
        /// Declared or actual length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Malformed frame or unexpected message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<WireError> for TransportError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::FrameTooLarge { len, max } => TransportError::FrameTooLarge { len, max },
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

/// One frame received from any transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Which transport delivered it.
    pub kind: TransportKind,
    /// Authenticated sender, when the transport knows it (direct links).
    pub peer: Option<DeviceId>,
    /// Encoded envelope bytes (length prefix stripped).
    pub payload: Vec<u8>,
}

/// A channel that can deliver encoded envelopes to peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which kind of transport this is.
    fn kind(&self) -> TransportKind;

    /// Whether a send to `peer` can currently be attempted.
    fn can_reach(&self, peer: &DeviceId) -> bool;

    /// Deliver one encoded envelope to `peer`.
    ///
    /// Success means the frame was handed to the peer's link; there is no
    /// end-to-end acknowledgement.
    async fn send(&self, peer: &DeviceId, payload: &[u8]) -> Result<(), TransportError>;

    /// Subscribe to connection events. Each call returns a fresh receiver.
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Snapshot of this transport's connection records.
    fn records(&self) -> Vec<PeerConnectionRecord>;
}
