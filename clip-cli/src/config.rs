//! Configuration management for clipsync.
//!
//! `device.json` holds this device's id, name and identity secrets. It is
//! written with owner-only permissions inside an owner-only directory.

use anyhow::{Context, Result};
use clipsync_client::IdentityKeys;
use clipsync_core::unix_now_secs;
use clipsync_types::DeviceId;
use serde::{Deserialize, Serialize};
use std::path::Path;

const DEVICE_FILE: &str = "device.json";

/// Device configuration stored locally.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Canonical device identifier.
    pub device_id: DeviceId,
    /// Human-readable device name.
    pub device_name: String,
    /// When the device was initialized (unix seconds).
    pub created_at: u64,
    /// Hex X25519 identity secret.
    agreement_secret_hex: String,
    /// Hex Ed25519 identity secret.
    signing_secret_hex: String,
}

impl std::fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("device_id", &self.device_id)
            .field("device_name", &self.device_name)
            .field("created_at", &self.created_at)
            .field("secrets", &"[REDACTED]")
            .finish()
    }
}

impl DeviceConfig {
    /// Create a new device with fresh identity keys.
    pub fn new(name: &str) -> Self {
        let identity = IdentityKeys::generate();
        let (agreement, signing) = identity.secret_bytes();
        Self {
            device_id: DeviceId::random(),
            device_name: name.to_string(),
            created_at: unix_now_secs(),
            agreement_secret_hex: hex::encode(agreement),
            signing_secret_hex: hex::encode(signing),
        }
    }

    /// Restore the identity keys.
    pub fn identity(&self) -> Result<IdentityKeys> {
        let agreement = decode_secret(&self.agreement_secret_hex)
            .context("Invalid agreement secret in device configuration")?;
        let signing = decode_secret(&self.signing_secret_hex)
            .context("Invalid signing secret in device configuration")?;
        Ok(IdentityKeys::from_bytes(agreement, signing))
    }

    /// Load device configuration from a directory.
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(DEVICE_FILE);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .context("Device not initialized. Run 'clipsync init' first.")?;
        serde_json::from_str(&contents).context("Invalid device configuration")
    }

    /// Save device configuration to a directory.
    pub async fn save(&self, data_dir: &Path) -> Result<()> {
        let path = data_dir.join(DEVICE_FILE);
        let contents = serde_json::to_string_pretty(self)?;
        write_private(&path, contents.as_bytes())
            .await
            .context("Failed to save device configuration")
    }

    /// Check if device is initialized.
    pub async fn exists(data_dir: &Path) -> bool {
        tokio::fs::try_exists(data_dir.join(DEVICE_FILE))
            .await
            .unwrap_or(false)
    }
}

fn decode_secret(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("expected 32 bytes, got {}", b.len()))
}

/// Create the data directory (if needed) and restrict it to the owner.
pub async fn ensure_data_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .context("Failed to create data directory")?;
    set_dir_permissions_0700(path).await
}

/// Write `contents` to `path` with 0600 permissions, replacing it atomically.
///
/// The bytes go to a sibling temp file first, so a reader sees either the
/// old file or the new one.
pub async fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    set_file_permissions_0600(&tmp).await?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Set file permissions to 0600 (owner read/write only) on Unix.
/// No-op on non-Unix platforms.
async fn set_file_permissions_0600(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .context("Failed to set file permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Set directory permissions to 0700 (owner only) on Unix.
/// No-op on non-Unix platforms.
async fn set_dir_permissions_0700(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .await
            .context("Failed to set directory permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
