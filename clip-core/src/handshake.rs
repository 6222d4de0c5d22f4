//! Pairing handshake messages and state machines.
//!
//! This module defines the plaintext bodies of the challenge and ack, the
//! exact bytes each signature covers, the timestamp freshness rule, and the
//! pure state machines for both roles. Sealing, signing, and key agreement
//! happen in `clipsync-client`.
//!
//! ```text
//! Initiator: Idle -> ChallengeSent -> AwaitingAck -> Paired
//!                         \______________\________-> Failed
//!
//! Responder: Idle -> ChallengeReceived -> AwaitingApproval -> AckSent -> Paired
//!                         \__________________\_________________\-> Failed
//!                                              \-> Denied
//! ```
//!
//! Cancelling returns either role to `Idle` from any non-terminal state.

use std::time::Duration;

use clipsync_types::encoding::{base64_array, base64_array_opt};
use clipsync_types::DeviceId;
use serde::{Deserialize, Serialize};

use crate::PairingError;

/// Default clock tolerance for challenge and ack timestamps (30 seconds).
pub const DEFAULT_TIMESTAMP_TOLERANCE: Duration = Duration::from_secs(30);

const CHALLENGE_DOMAIN: &[u8] = b"clipsync/pairing-challenge/v1";
const ACK_DOMAIN: &[u8] = b"clipsync/pairing-ack/v1";

/// Plaintext of a pairing challenge (sealed under the initial key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeBody {
    /// Initiator device.
    pub device_id: DeviceId,
    /// Initiator name, shown in the approval prompt.
    pub device_name: String,
    /// Initiator ephemeral X25519 public key.
    #[serde(with = "base64_array")]
    pub ephemeral_public_key: [u8; 32],
    /// Initiator Ed25519 identity key.
    #[serde(with = "base64_array")]
    pub signing_public_key: [u8; 32],
    /// Random challenge nonce.
    #[serde(with = "base64_array")]
    pub nonce: [u8; 32],
    /// Unix milliseconds at creation.
    pub timestamp: u64,
    /// Signature over [`ChallengeBody::signing_bytes`].
    #[serde(with = "base64_array")]
    pub signature: [u8; 64],
}

impl ChallengeBody {
    /// Bytes covered by the initiator's signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CHALLENGE_DOMAIN.len() + 160);
        out.extend_from_slice(CHALLENGE_DOMAIN);
        push_field(&mut out, self.device_id.as_bytes());
        push_field(&mut out, self.device_name.as_bytes());
        out.extend_from_slice(&self.ephemeral_public_key);
        out.extend_from_slice(&self.signing_public_key);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PairingError> {
        serde_json::to_vec(self)
            .map_err(|e| PairingError::InvalidPayload(format!("challenge: {}", e)))
    }

    /// Parse decrypted bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PairingError> {
        serde_json::from_slice(bytes)
            .map_err(|e| PairingError::InvalidPayload(format!("challenge: {}", e)))
    }
}

/// Plaintext of a pairing ack (sealed under the initial key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckBody {
    /// Responder device.
    pub device_id: DeviceId,
    /// Responder name.
    pub device_name: String,
    /// Responder ephemeral X25519 public key.
    ///
    /// Absent only from legacy responders; see `PairingOptions` in the client.
    #[serde(default, with = "base64_array_opt", skip_serializing_if = "Option::is_none")]
    pub ephemeral_public_key: Option<[u8; 32]>,
    /// Nonce of the challenge being answered.
    #[serde(with = "base64_array")]
    pub challenge_nonce: [u8; 32],
    /// Fresh responder nonce.
    #[serde(with = "base64_array")]
    pub nonce: [u8; 32],
    /// Unix milliseconds at creation.
    pub timestamp: u64,
    /// Signature over [`AckBody::signing_bytes`].
    #[serde(with = "base64_array")]
    pub signature: [u8; 64],
}

impl AckBody {
    /// Bytes covered by the responder's signature.
    ///
    /// Includes the challenge nonce, so an ack only answers one challenge.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ACK_DOMAIN.len() + 170);
        out.extend_from_slice(ACK_DOMAIN);
        push_field(&mut out, self.device_id.as_bytes());
        push_field(&mut out, self.device_name.as_bytes());
        match &self.ephemeral_public_key {
            Some(key) => {
                out.push(1);
                out.extend_from_slice(key);
            }
            None => out.push(0),
        }
        out.extend_from_slice(&self.challenge_nonce);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PairingError> {
        serde_json::to_vec(self).map_err(|e| PairingError::InvalidPayload(format!("ack: {}", e)))
    }

    /// Parse decrypted bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PairingError> {
        serde_json::from_slice(bytes)
            .map_err(|e| PairingError::InvalidPayload(format!("ack: {}", e)))
    }
}

/// Length-prefixed field so adjacent variable fields cannot be shifted.
fn push_field(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// Require `|now - timestamp| <= tolerance` (all in unix milliseconds).
pub fn check_freshness(
    timestamp_ms: u64,
    now_ms: u64,
    tolerance: Duration,
) -> Result<(), PairingError> {
    let skew_ms = now_ms.abs_diff(timestamp_ms);
    if skew_ms as u128 > tolerance.as_millis() {
        return Err(PairingError::StaleTimestamp { skew_ms });
    }
    Ok(())
}

/// Generate a random 32-byte nonce.
pub fn random_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    getrandom::getrandom(&mut nonce).expect("getrandom failed");
    nonce
}

/// Initiator pairing state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InitiatorState {
    /// No pairing in progress.
    #[default]
    Idle,
    /// Challenge built and handed to the transport.
    ChallengeSent,
    /// Challenge delivered; waiting for the responder's ack.
    AwaitingAck,
    /// Final key derived and stored.
    Paired,
    /// Pairing aborted.
    Failed {
        /// Why pairing failed.
        reason: String,
    },
}

/// Inputs to the initiator state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiatorEvent {
    /// Challenge built and sent.
    ChallengeSent,
    /// Transport confirmed delivery.
    ChallengeDelivered,
    /// Ack verified and session key stored.
    AckAccepted,
    /// Any protocol, crypto, or transport failure.
    Failed {
        /// Failure description.
        reason: String,
    },
    /// User cancelled.
    Cancelled,
}

impl InitiatorState {
    /// Apply an event. Transitions not listed keep the current state.
    pub fn on_event(self, event: InitiatorEvent) -> Self {
        match (self, event) {
            (Self::Idle, InitiatorEvent::ChallengeSent) => Self::ChallengeSent,
            (Self::ChallengeSent, InitiatorEvent::ChallengeDelivered) => Self::AwaitingAck,
            (Self::AwaitingAck, InitiatorEvent::AckAccepted) => Self::Paired,

            (state, InitiatorEvent::Failed { reason }) if !state.is_terminal() => {
                Self::Failed { reason }
            }
            (state, InitiatorEvent::Cancelled) if !state.is_terminal() => Self::Idle,

            (state, _) => state,
        }
    }

    /// `Paired` and `Failed` accept no further events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Paired | Self::Failed { .. })
    }

    /// Whether an ack may be processed now.
    pub fn accepts_ack(&self) -> bool {
        matches!(self, Self::ChallengeSent | Self::AwaitingAck)
    }
}

/// Responder pairing state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResponderState {
    /// No pairing in progress.
    #[default]
    Idle,
    /// Challenge decrypted, signature and timestamp verified.
    ChallengeReceived,
    /// Request surfaced to the user.
    AwaitingApproval,
    /// Ack built and sent.
    AckSent,
    /// Final key derived and stored.
    Paired,
    /// Pairing aborted.
    Failed {
        /// Why pairing failed.
        reason: String,
    },
    /// User rejected the request.
    Denied,
}

/// Inputs to the responder state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderEvent {
    /// Challenge passed every check.
    ChallengeVerified,
    /// Approval requested from the user.
    ApprovalRequested,
    /// User approved and the ack was sent.
    Approved,
    /// Session key stored.
    KeyStored,
    /// User denied.
    Denied,
    /// Any protocol, crypto, or transport failure.
    Failed {
        /// Failure description.
        reason: String,
    },
    /// User cancelled.
    Cancelled,
}

impl ResponderState {
    /// Apply an event. Transitions not listed keep the current state.
    pub fn on_event(self, event: ResponderEvent) -> Self {
        match (self, event) {
            (Self::Idle, ResponderEvent::ChallengeVerified) => Self::ChallengeReceived,
            (Self::ChallengeReceived, ResponderEvent::ApprovalRequested) => Self::AwaitingApproval,
            (Self::AwaitingApproval, ResponderEvent::Approved) => Self::AckSent,
            (Self::AwaitingApproval, ResponderEvent::Denied) => Self::Denied,
            (Self::AckSent, ResponderEvent::KeyStored) => Self::Paired,

            (state, ResponderEvent::Failed { reason }) if !state.is_terminal() => {
                Self::Failed { reason }
            }
            (state, ResponderEvent::Cancelled) if !state.is_terminal() => Self::Idle,

            (state, _) => state,
        }
    }

    /// `Paired`, `Failed`, and `Denied` accept no further events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Paired | Self::Failed { .. } | Self::Denied)
    }
}
