//! Envelope - the wire format wrapper for all clipsync messages.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::encoding::{base64_array, base64_bytes};
use crate::{ControlMessage, DeviceId, WireError};

/// Protocol version written on every envelope.
pub const PROTOCOL_VERSION: &str = "1.0";

/// AEAD algorithm name carried in [`EncryptionMeta`].
pub const AEAD_ALGORITHM: &str = "AES-256-GCM";

/// Envelope type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Encrypted clipboard content
    Clipboard,
    /// Pairing, registration, and other control traffic
    Control,
}

impl MessageType {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Clipboard => "clipboard",
            MessageType::Control => "control",
        }
    }
}

/// Kind of clipboard content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    /// Plain text
    Text,
    /// URL
    Link,
    /// Image bytes
    Image,
    /// Arbitrary file bytes
    File,
}

/// AEAD parameters for one content payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionMeta {
    /// Algorithm name (always [`AEAD_ALGORITHM`]).
    pub algorithm: String,
    /// 96-bit nonce.
    #[serde(with = "base64_array")]
    pub nonce: [u8; 12],
    /// 128-bit authentication tag.
    #[serde(with = "base64_array")]
    pub tag: [u8; 16],
}

impl EncryptionMeta {
    /// AES-256-GCM metadata for the given nonce and tag.
    pub fn aes_gcm(nonce: [u8; 12], tag: [u8; 16]) -> Self {
        Self {
            algorithm: AEAD_ALGORITHM.to_string(),
            nonce,
            tag,
        }
    }
}

/// Payload of a `clipboard` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPayload {
    /// Kind of content (visible to the relay for routing decisions only).
    pub content_type: ContentType,
    /// Encrypted content body.
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// Sending device; also the AEAD associated data.
    pub device_id: DeviceId,
    /// Sender's human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// Addressed device. Absent means broadcast to all paired peers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<DeviceId>,
    /// AEAD parameters.
    pub encryption: EncryptionMeta,
}

/// Envelope payload, selected by the envelope `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    /// Clipboard content.
    Content(ContentPayload),
    /// Control traffic.
    Control(ControlMessage),
}

/// The envelope wraps every message on the wire.
///
/// Envelopes are immutable once built; every field is set by a constructor.
/// The relay reads only `type` and the routing fields of the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope")]
pub struct Envelope {
    /// Unique message id
    pub id: Uuid,
    /// Unix timestamp (milliseconds) - informational only, not trusted
    pub timestamp: u64,
    /// Protocol version
    pub version: String,
    /// Message type discriminator
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Typed payload
    pub payload: Payload,
}

impl Envelope {
    /// Create a clipboard envelope.
    pub fn content(payload: ContentPayload) -> Self {
        Self::build(MessageType::Clipboard, Payload::Content(payload))
    }

    /// Create a control envelope.
    pub fn control(message: ControlMessage) -> Self {
        Self::build(MessageType::Control, Payload::Control(message))
    }

    fn build(msg_type: MessageType, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            version: PROTOCOL_VERSION.to_string(),
            msg_type,
            payload,
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Serialization)
    }

    /// Deserialize and validate from JSON bytes.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let raw: RawEnvelope = serde_json::from_slice(bytes).map_err(WireError::Deserialization)?;
        Self::try_from(raw)
    }

    /// The content payload, if this is a clipboard envelope.
    pub fn content_payload(&self) -> Option<&ContentPayload> {
        match &self.payload {
            Payload::Content(content) => Some(content),
            Payload::Control(_) => None,
        }
    }

    /// The control message, if this is a control envelope.
    pub fn control_message(&self) -> Option<&ControlMessage> {
        match &self.payload {
            Payload::Control(control) => Some(control),
            Payload::Content(_) => None,
        }
    }

    /// The device this envelope is addressed to, if any.
    pub fn target(&self) -> Option<&DeviceId> {
        match &self.payload {
            Payload::Content(content) => content.target.as_ref(),
            Payload::Control(control) => control.target(),
        }
    }
}

/// Untyped envelope used to pick the payload type from `type`.
#[derive(Deserialize)]
struct RawEnvelope {
    id: Uuid,
    timestamp: u64,
    version: String,
    #[serde(rename = "type")]
    msg_type: MessageType,
    payload: serde_json::Value,
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = WireError;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        if !is_supported_version(&raw.version) {
            return Err(WireError::UnsupportedVersion(raw.version));
        }

        let payload = match raw.msg_type {
            MessageType::Clipboard => serde_json::from_value(raw.payload)
                .map(Payload::Content)
                .map_err(|_| WireError::TypeMismatch {
                    declared: MessageType::Clipboard.as_str(),
                })?,
            MessageType::Control => serde_json::from_value(raw.payload)
                .map(Payload::Control)
                .map_err(|_| WireError::TypeMismatch {
                    declared: MessageType::Control.as_str(),
                })?,
        };

        Ok(Self {
            id: raw.id,
            timestamp: raw.timestamp,
            version: raw.version,
            msg_type: raw.msg_type,
            payload,
        })
    }
}

/// Any 1.x version is accepted.
fn is_supported_version(version: &str) -> bool {
    version
        .split('.')
        .next()
        .map(|major| major == "1")
        .unwrap_or(false)
}
