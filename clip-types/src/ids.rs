//! Device identity for clipsync.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::WireError;

/// Platform prefixes that some sources prepend to the same underlying id.
const PLATFORM_PREFIXES: &[&str] = &["android-", "macos-", "ios-", "windows-", "linux-"];

/// A device identifier in canonical form.
///
/// Discovery attributes, pairing payloads, wire envelopes, and stored trust
/// records all spell ids slightly differently (case, braces, platform
/// prefix). Every `DeviceId` is normalized on construction so equality and
/// hashing are insensitive to those variations.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Parse and normalize a device id.
    pub fn new(raw: &str) -> Result<Self, WireError> {
        let canonical = normalize(raw);
        if canonical.is_empty() {
            return Err(WireError::InvalidDeviceId(raw.to_string()));
        }
        if canonical.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(WireError::InvalidDeviceId(raw.to_string()));
        }
        Ok(Self(canonical))
    }

    /// Create a new random DeviceId (UUID v4).
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The canonical form as bytes (used as AEAD associated data).
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// Trim, strip braces, lowercase, and drop one platform prefix.
fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let unbraced = trimmed
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(trimmed);
    let lower = unbraced.trim().to_lowercase();
    for prefix in PLATFORM_PREFIXES {
        if let Some(rest) = lower.strip_prefix(prefix) {
            return rest.to_string();
        }
    }
    lower
}

impl TryFrom<String> for DeviceId {
    type Error = WireError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl std::str::FromStr for DeviceId {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.0.chars().take(8).collect();
        write!(f, "DeviceId({})", short)
    }
}
