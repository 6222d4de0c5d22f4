//! Serde helpers for base64 fields.
//!
//! The wire format carries binary values (ciphertext, nonces, tags, keys,
//! signatures) as standard padded base64 strings.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

/// Variable-length byte vectors as base64.
pub mod base64_bytes {
    use super::*;

    /// Serialize bytes as a base64 string.
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    /// Deserialize a base64 string into bytes.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| D::Error::custom(format!("invalid base64: {e}")))
    }
}

/// Fixed-length byte arrays as base64, rejecting the wrong length.
pub mod base64_array {
    use super::*;

    /// Serialize a fixed array as a base64 string.
    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    /// Deserialize a base64 string into a fixed array.
    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| D::Error::custom(format!("invalid base64: {e}")))?;
        <[u8; N]>::try_from(bytes).map_err(|v: Vec<u8>| {
            D::Error::invalid_length(v.len(), &format!("{N} bytes").as_str())
        })
    }
}

/// Optional fixed-length byte arrays as base64 (absent or null = `None`).
pub mod base64_array_opt {
    use super::*;

    /// Serialize an optional fixed array.
    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &Option<[u8; N]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize an optional fixed array.
    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<Option<[u8; N]>, D::Error> {
        let Some(encoded) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| D::Error::custom(format!("invalid base64: {e}")))?;
        <[u8; N]>::try_from(bytes)
            .map(Some)
            .map_err(|v: Vec<u8>| {
                D::Error::invalid_length(v.len(), &format!("{N} bytes").as_str())
            })
    }
}
