//! Control messages carried in `type: "control"` envelopes.

use serde::{Deserialize, Serialize};

use crate::encoding::{base64_array, base64_array_opt, base64_bytes};
use crate::DeviceId;

/// Control traffic shared by the relay, the direct channel, and pairing.
///
/// Discriminated on the wire by an `action` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlMessage {
    /// First frame on a relay connection; binds the session to a device.
    Register {
        /// Registering device.
        device_id: DeviceId,
        /// Human-readable device name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_name: Option<String>,
        /// Take over a live session for the same device id.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        force: bool,
    },

    /// First frame on a direct connection, sent by both sides.
    DirectHello {
        /// Sender's device id.
        device_id: DeviceId,
        /// Sender's Ed25519 identity key, pinned against the trust record.
        #[serde(with = "base64_array")]
        signing_public_key: [u8; 32],
        /// Fresh random nonce the peer must sign.
        #[serde(with = "base64_array")]
        nonce: [u8; 32],
    },

    /// Second frame on a direct connection: proof of identity-key possession.
    DirectProof {
        /// Ed25519 signature over the peer's hello nonce.
        #[serde(with = "base64_array")]
        signature: [u8; 64],
    },

    /// Sealed pairing challenge (initiator to responder).
    PairingChallenge(SealedPairingMessage),

    /// Sealed pairing acknowledgement (responder to initiator).
    PairingAck(SealedPairingMessage),

    /// Error report from the relay or a peer.
    Error {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },
}

impl ControlMessage {
    /// The device this message must be routed to, if it is addressed.
    pub fn target(&self) -> Option<&DeviceId> {
        match self {
            ControlMessage::PairingChallenge(sealed) | ControlMessage::PairingAck(sealed) => {
                Some(&sealed.target)
            }
            _ => None,
        }
    }

    /// Short name for logging.
    pub fn action(&self) -> &'static str {
        match self {
            ControlMessage::Register { .. } => "register",
            ControlMessage::DirectHello { .. } => "direct_hello",
            ControlMessage::DirectProof { .. } => "direct_proof",
            ControlMessage::PairingChallenge(_) => "pairing_challenge",
            ControlMessage::PairingAck(_) => "pairing_ack",
            ControlMessage::Error { .. } => "error",
        }
    }
}

/// A pairing message sealed under the pairing initial key.
///
/// Only routing fields and, for challenges, the initiator's ephemeral public
/// key travel in the clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedPairingMessage {
    /// Sending device.
    pub sender: DeviceId,
    /// Receiving device (relay routing key).
    pub target: DeviceId,
    /// Initiator ephemeral X25519 public key (challenge only).
    #[serde(
        default,
        with = "base64_array_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub ephemeral_public_key: Option<[u8; 32]>,
    /// AEAD nonce.
    #[serde(with = "base64_array")]
    pub nonce: [u8; 12],
    /// AEAD authentication tag.
    #[serde(with = "base64_array")]
    pub tag: [u8; 16],
    /// Encrypted message body.
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Error codes carried by [`ControlMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Sender exceeded its message quota.
    RateLimited,
    /// A frame arrived before registration.
    NotRegistered,
    /// The frame could not be parsed or validated.
    InvalidMessage,
    /// The addressed device is not connected.
    TargetOffline,
    /// Another connection already holds this device id.
    AlreadyRegistered,
}
