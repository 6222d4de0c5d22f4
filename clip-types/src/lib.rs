//! # clipsync-types
//!
//! Wire format types for the clipsync clipboard protocol.
//!
//! This crate provides the foundational types used across all clipsync crates:
//! - [`DeviceId`] - Canonical device identity (normalized on construction)
//! - [`Envelope`] - JSON message wrapper with routing metadata
//! - [`ControlMessage`] - Relay registration, direct-channel auth, pairing traffic
//! - [`FrameCodec`] / [`FrameDecoder`] - 4-byte big-endian length framing
//! - [`WireError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod encoding;
mod envelope;
mod error;
mod frame;
mod ids;
mod messages;

pub use envelope::{
    ContentPayload, ContentType, EncryptionMeta, Envelope, MessageType, Payload,
    AEAD_ALGORITHM, PROTOCOL_VERSION,
};
pub use error::WireError;
pub use frame::{FrameCodec, FrameDecoder, DEFAULT_MAX_FRAME_LEN, LENGTH_PREFIX_LEN};
pub use ids::DeviceId;
pub use messages::{ControlMessage, ErrorCode, SealedPairingMessage};
