//! Clipboard content items, origin flags, and fingerprints.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use clipsync_types::{ContentType, DeviceId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where a content item came from.
///
/// Only `Local` items are ever sent to peers. `Remote` items are applied to
/// the local clipboard and stop there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Produced by this device (clipboard change observed locally).
    Local,
    /// Received from a paired peer.
    Remote,
}

/// One clipboard value plus routing metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentItem {
    /// Kind of content.
    pub content_type: ContentType,
    /// Raw content bytes (UTF-8 for text and links).
    pub data: Vec<u8>,
    /// Free-form metadata (mime type, file name, ...).
    pub metadata: BTreeMap<String, String>,
    /// Origin flag.
    pub origin: Origin,
    /// Sending device for remote items.
    pub source: Option<DeviceId>,
}

impl ContentItem {
    /// A locally produced item.
    pub fn local(content_type: ContentType, data: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type,
            data: data.into(),
            metadata: BTreeMap::new(),
            origin: Origin::Local,
            source: None,
        }
    }

    /// A locally produced text item.
    pub fn text(text: &str) -> Self {
        Self::local(ContentType::Text, text.as_bytes().to_vec())
    }

    /// An item received from `source`.
    pub fn remote(content_type: ContentType, data: impl Into<Vec<u8>>, source: DeviceId) -> Self {
        Self {
            content_type,
            data: data.into(),
            metadata: BTreeMap::new(),
            origin: Origin::Remote,
            source: Some(source),
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether this item may be sent to peers.
    pub fn is_broadcastable(&self) -> bool {
        self.origin == Origin::Local
    }

    /// Compute the content fingerprint.
    pub fn fingerprint(&self) -> ContentFingerprint {
        ContentFingerprint::of(self.content_type, &self.data)
    }

    /// Data as UTF-8 text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// The plaintext body that gets encrypted for a peer.
    pub fn to_plaintext(&self) -> ContentPlaintext {
        ContentPlaintext {
            content_type: self.content_type,
            data: STANDARD.encode(&self.data),
            metadata: self.metadata.clone(),
        }
    }
}

/// The JSON body sealed inside a content envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPlaintext {
    /// Kind of content.
    pub content_type: ContentType,
    /// Content bytes, base64.
    pub data: String,
    /// Metadata map.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ContentPlaintext {
    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse from decrypted bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Rebuild a remote-origin item.
    ///
    /// Returns `None` when `data` is not valid base64.
    pub fn into_remote_item(self, source: DeviceId) -> Option<ContentItem> {
        let data = STANDARD.decode(self.data.as_bytes()).ok()?;
        Some(ContentItem {
            content_type: self.content_type,
            data,
            metadata: self.metadata,
            origin: Origin::Remote,
            source: Some(source),
        })
    }
}

/// Type, length, and SHA-256 of a content item.
///
/// Device ids and timestamps are not part of the fingerprint: two items with
/// the same bytes are the same content no matter who sent them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentFingerprint {
    /// Kind of content.
    pub content_type: ContentType,
    /// Byte length.
    pub len: usize,
    /// SHA-256 of the full content.
    pub hash: [u8; 32],
}

impl ContentFingerprint {
    /// Fingerprint raw bytes of a given type.
    pub fn of(content_type: ContentType, data: &[u8]) -> Self {
        Self {
            content_type,
            len: data.len(),
            hash: Sha256::digest(data).into(),
        }
    }

    /// Short hex form for logs.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.hash[..6])
    }
}
