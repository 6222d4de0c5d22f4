//! Out-of-band pairing payload.
//!
//! The payload is what one device shows (QR code, discovery attributes) so a
//! second device can start pairing with it:
//! - identity keys for the initial key agreement and signature checks
//! - a fingerprint of the signing key, pinned by the direct channel
//! - optional hints for reaching the device (relay URL, direct address)
//! - a short validity window
//!
//! Loosely typed inputs (QR text, TXT-record maps) are validated and turned
//! into a [`PairingPayload`] here, so nothing past this boundary handles raw
//! strings.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use clipsync_types::encoding::base64_array;
use clipsync_types::DeviceId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default pairing payload TTL (60 seconds).
pub const DEFAULT_PAIRING_TTL: Duration = Duration::from_secs(60);

/// Current payload format version.
pub const PAYLOAD_VERSION: u32 = 1;

/// Error type for pairing payloads and pairing messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    /// The payload is invalid (bad base64, JSON, or field value).
    InvalidPayload(String),
    /// A required attribute is absent.
    MissingField(&'static str),
    /// The payload has expired.
    Expired,
    /// Version mismatch.
    UnsupportedVersion(u32),
    /// The fingerprint does not match the signing key.
    FingerprintMismatch,
    /// A pairing message timestamp is outside the tolerance.
    StaleTimestamp {
        /// Absolute clock difference in milliseconds.
        skew_ms: u64,
    },
}

impl std::fmt::Display for PairingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PairingError::InvalidPayload(msg) => write!(f, "invalid pairing payload: {}", msg),
            PairingError::MissingField(field) => write!(f, "missing pairing field: {}", field),
            PairingError::Expired => write!(f, "pairing payload has expired"),
            PairingError::UnsupportedVersion(v) => {
                write!(f, "unsupported pairing payload version: {}", v)
            }
            PairingError::FingerprintMismatch => {
                write!(f, "fingerprint does not match signing key")
            }
            PairingError::StaleTimestamp { skew_ms } => {
                write!(f, "pairing message timestamp off by {}ms", skew_ms)
            }
        }
    }
}

impl std::error::Error for PairingError {}

/// Hex SHA-256 of an Ed25519 signing public key.
pub fn key_fingerprint(signing_public_key: &[u8; 32]) -> String {
    hex::encode(Sha256::digest(signing_public_key))
}

/// Everything a device needs to start pairing with the advertising device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingPayload {
    /// Payload format version.
    pub version: u32,
    /// Advertising device.
    pub device_id: DeviceId,
    /// Human-readable device name.
    pub device_name: String,
    /// Long-lived X25519 identity public key.
    #[serde(with = "base64_array")]
    pub identity_public_key: [u8; 32],
    /// Long-lived Ed25519 signing public key.
    #[serde(with = "base64_array")]
    pub signing_public_key: [u8; 32],
    /// Hex SHA-256 of `signing_public_key`.
    pub fingerprint: String,
    /// Relay the device is registered with, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_hint: Option<String>,
    /// Direct `host:port` the device listens on, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_addr: Option<String>,
    /// Unix seconds when the payload was issued.
    pub issued_at: u64,
    /// Unix seconds when the payload stops being valid.
    pub expires_at: u64,
}

impl PairingPayload {
    /// Create a payload with the default TTL (60 seconds).
    pub fn create(
        device_id: DeviceId,
        device_name: impl Into<String>,
        identity_public_key: [u8; 32],
        signing_public_key: [u8; 32],
    ) -> Self {
        Self::create_with_ttl(
            device_id,
            device_name,
            identity_public_key,
            signing_public_key,
            DEFAULT_PAIRING_TTL,
        )
    }

    /// Create a payload with a custom TTL.
    pub fn create_with_ttl(
        device_id: DeviceId,
        device_name: impl Into<String>,
        identity_public_key: [u8; 32],
        signing_public_key: [u8; 32],
        ttl: Duration,
    ) -> Self {
        let now = unix_now_secs();
        Self {
            version: PAYLOAD_VERSION,
            device_id,
            device_name: device_name.into(),
            identity_public_key,
            signing_public_key,
            fingerprint: key_fingerprint(&signing_public_key),
            relay_hint: None,
            direct_addr: None,
            issued_at: now,
            expires_at: now.saturating_add(ttl.as_secs()),
        }
    }

    /// Set the relay hint.
    pub fn with_relay_hint(mut self, relay: impl Into<String>) -> Self {
        self.relay_hint = Some(relay.into());
        self
    }

    /// Set the direct address.
    pub fn with_direct_addr(mut self, addr: impl Into<String>) -> Self {
        self.direct_addr = Some(addr.into());
        self
    }

    /// Check if the payload has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(unix_now_secs())
    }

    /// Check expiry against a given unix time.
    pub fn is_expired_at(&self, now_secs: u64) -> bool {
        now_secs >= self.expires_at
    }

    /// Run every check a received payload must pass.
    pub fn validate(&self) -> Result<(), PairingError> {
        if self.version != PAYLOAD_VERSION {
            return Err(PairingError::UnsupportedVersion(self.version));
        }
        if !self
            .fingerprint
            .eq_ignore_ascii_case(&key_fingerprint(&self.signing_public_key))
        {
            return Err(PairingError::FingerprintMismatch);
        }
        if self.is_expired() {
            return Err(PairingError::Expired);
        }
        Ok(())
    }

    /// Encode as URL-safe base64 JSON for QR codes.
    pub fn to_qr_payload(&self) -> String {
        // Strings, integers, and arrays only: serialization cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decode and validate a QR payload.
    pub fn from_qr_payload(payload: &str) -> Result<Self, PairingError> {
        let json = URL_SAFE_NO_PAD
            .decode(payload.trim())
            .map_err(|e| PairingError::InvalidPayload(format!("base64 decode: {}", e)))?;

        let parsed: Self = serde_json::from_slice(&json)
            .map_err(|e| PairingError::InvalidPayload(format!("json parse: {}", e)))?;

        parsed.validate()?;
        Ok(parsed)
    }

    /// Build a payload from discovery attributes (TXT-record style).
    ///
    /// Expected keys: `device_id`, `device_name`, `identity_public_key`,
    /// `signing_public_key`, `fingerprint`, `issued_at`, `expires_at`, and
    /// optionally `version`, `relay_hint`, `direct_addr`. Keys are standard
    /// base64.
    pub fn from_attributes(attrs: &HashMap<String, String>) -> Result<Self, PairingError> {
        let field = |name: &'static str| -> Result<&str, PairingError> {
            attrs
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .ok_or(PairingError::MissingField(name))
        };

        let version = match attrs.get("version") {
            Some(v) => v
                .trim()
                .parse::<u32>()
                .map_err(|_| PairingError::InvalidPayload(format!("version: {}", v)))?,
            None => PAYLOAD_VERSION,
        };

        let device_id = DeviceId::new(field("device_id")?)
            .map_err(|e| PairingError::InvalidPayload(e.to_string()))?;

        let payload = Self {
            version,
            device_id,
            device_name: field("device_name")?.to_string(),
            identity_public_key: parse_key("identity_public_key", field("identity_public_key")?)?,
            signing_public_key: parse_key("signing_public_key", field("signing_public_key")?)?,
            fingerprint: field("fingerprint")?.to_ascii_lowercase(),
            relay_hint: attrs.get("relay_hint").cloned().filter(|v| !v.is_empty()),
            direct_addr: attrs.get("direct_addr").cloned().filter(|v| !v.is_empty()),
            issued_at: parse_secs("issued_at", field("issued_at")?)?,
            expires_at: parse_secs("expires_at", field("expires_at")?)?,
        };

        payload.validate()?;
        Ok(payload)
    }

    /// Flatten into discovery attributes (inverse of [`from_attributes`]).
    ///
    /// [`from_attributes`]: PairingPayload::from_attributes
    pub fn to_attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        attrs.insert("version".into(), self.version.to_string());
        attrs.insert("device_id".into(), self.device_id.to_string());
        attrs.insert("device_name".into(), self.device_name.clone());
        attrs.insert(
            "identity_public_key".into(),
            STANDARD.encode(self.identity_public_key),
        );
        attrs.insert(
            "signing_public_key".into(),
            STANDARD.encode(self.signing_public_key),
        );
        attrs.insert("fingerprint".into(), self.fingerprint.clone());
        if let Some(relay) = &self.relay_hint {
            attrs.insert("relay_hint".into(), relay.clone());
        }
        if let Some(addr) = &self.direct_addr {
            attrs.insert("direct_addr".into(), addr.clone());
        }
        attrs.insert("issued_at".into(), self.issued_at.to_string());
        attrs.insert("expires_at".into(), self.expires_at.to_string());
        attrs
    }
}

fn parse_key(name: &'static str, value: &str) -> Result<[u8; 32], PairingError> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|e| PairingError::InvalidPayload(format!("{}: {}", name, e)))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
        PairingError::InvalidPayload(format!("{}: expected 32 bytes, got {}", name, bytes.len()))
    })
}

fn parse_secs(name: &'static str, value: &str) -> Result<u64, PairingError> {
    value
        .parse::<u64>()
        .map_err(|_| PairingError::InvalidPayload(format!("{}: {}", name, value)))
}

/// Current unix time in seconds.
pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current unix time in milliseconds.
pub fn unix_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
