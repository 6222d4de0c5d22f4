//! Device trust store contract.
//!
//! The trust store maps a peer's canonical [`DeviceId`] to the session key
//! established by pairing, plus the peer's pinned identity key. Pairing
//! writes it; the crypto layer reads it before every encrypt and decrypt.
//!
//! Implementations must make `save` atomic with respect to `load`: a reader
//! sees either the old record or the new one, never a mix. [`MemoryTrustStore`]
//! does this by swapping whole `Arc<TrustedDevice>` values (copy-on-write).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use clipsync_types::encoding::base64_array;
use clipsync_types::DeviceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::crypto::SessionKey;

/// Trust store errors.
#[derive(Debug, Error)]
pub enum TrustStoreError {
    /// Backend I/O failed.
    #[error("trust store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be parsed or written.
    #[error("trust store serialization error: {0}")]
    Serialization(String),
}

/// Everything remembered about a paired peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedDevice {
    /// Peer device id (canonical).
    pub device_id: DeviceId,
    /// Peer name as presented during pairing.
    pub device_name: String,
    /// Session key derived from both ephemeral keys.
    pub session_key: SessionKey,
    /// Peer's Ed25519 identity key, pinned for direct connections.
    #[serde(with = "base64_array")]
    pub signing_public_key: [u8; 32],
    /// Hex SHA-256 of `signing_public_key`.
    pub fingerprint: String,
    /// Unix seconds when pairing completed.
    pub paired_at: u64,
}

/// Persistence for trusted devices, keyed by canonical device id.
#[async_trait]
pub trait TrustStore: Send + Sync {
    /// Insert or fully replace the record for `device.device_id`.
    async fn save(&self, device: TrustedDevice) -> Result<(), TrustStoreError>;

    /// Load the record for `device_id`.
    async fn load(&self, device_id: &DeviceId) -> Result<Option<Arc<TrustedDevice>>, TrustStoreError>;

    /// Remove the record. Returns whether one existed.
    async fn delete(&self, device_id: &DeviceId) -> Result<bool, TrustStoreError>;

    /// All paired device ids.
    async fn list(&self) -> Result<Vec<DeviceId>, TrustStoreError>;
}

/// In-memory trust store.
#[derive(Debug, Default, Clone)]
pub struct MemoryTrustStore {
    devices: Arc<RwLock<HashMap<DeviceId, Arc<TrustedDevice>>>>,
}

impl MemoryTrustStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `devices`.
    pub fn with_devices(devices: impl IntoIterator<Item = TrustedDevice>) -> Self {
        let map = devices
            .into_iter()
            .map(|d| (d.device_id.clone(), Arc::new(d)))
            .collect();
        Self {
            devices: Arc::new(RwLock::new(map)),
        }
    }

    /// Snapshot of all records.
    pub async fn snapshot(&self) -> Vec<Arc<TrustedDevice>> {
        self.devices.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl TrustStore for MemoryTrustStore {
    async fn save(&self, device: TrustedDevice) -> Result<(), TrustStoreError> {
        let record = Arc::new(device);
        self.devices
            .write()
            .await
            .insert(record.device_id.clone(), record);
        Ok(())
    }

    async fn load(&self, device_id: &DeviceId) -> Result<Option<Arc<TrustedDevice>>, TrustStoreError> {
        Ok(self.devices.read().await.get(device_id).cloned())
    }

    async fn delete(&self, device_id: &DeviceId) -> Result<bool, TrustStoreError> {
        Ok(self.devices.write().await.remove(device_id).is_some())
    }

    async fn list(&self) -> Result<Vec<DeviceId>, TrustStoreError> {
        let mut ids: Vec<DeviceId> = self.devices.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
pub(crate) fn test_device(id: &str, key: [u8; 32]) -> TrustedDevice {
    TrustedDevice {
        device_id: DeviceId::new(id).unwrap(),
        device_name: id.to_uppercase(),
        session_key: SessionKey::from_bytes(key),
        signing_public_key: [0x5A; 32],
        fingerprint: clipsync_core::key_fingerprint(&[0x5A; 32]),
        paired_at: 1_700_000_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load() {
        let store = MemoryTrustStore::new();
        store.save(test_device("pixel", [1; 32])).await.unwrap();

        let loaded = store.load(&DeviceId::new("pixel").unwrap()).await.unwrap();
        assert_eq!(loaded.unwrap().session_key.as_bytes(), &[1; 32]);
    }

    #[tokio::test]
    async fn lookup_is_normalized() {
        let store = MemoryTrustStore::new();
        store.save(test_device("pixel-7", [1; 32])).await.unwrap();

        let discovered = DeviceId::new("ANDROID-PIXEL-7").unwrap();
        assert!(store.load(&discovered).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn save_replaces_whole_record() {
        let store = MemoryTrustStore::new();
        store.save(test_device("pixel", [1; 32])).await.unwrap();

        let mut rotated = test_device("pixel", [2; 32]);
        rotated.device_name = "Renamed".into();
        store.save(rotated).await.unwrap();

        let loaded = store
            .load(&DeviceId::new("pixel").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.session_key.as_bytes(), &[2; 32]);
        assert_eq!(loaded.device_name, "Renamed");
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn readers_keep_old_snapshot_across_replace() {
        let store = MemoryTrustStore::new();
        store.save(test_device("pixel", [1; 32])).await.unwrap();
        let id = DeviceId::new("pixel").unwrap();

        let before = store.load(&id).await.unwrap().unwrap();
        store.save(test_device("pixel", [2; 32])).await.unwrap();

        assert_eq!(before.session_key.as_bytes(), &[1; 32]);
        assert_eq!(
            store.load(&id).await.unwrap().unwrap().session_key.as_bytes(),
            &[2; 32]
        );
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let store = MemoryTrustStore::with_devices([test_device("mac", [3; 32])]);
        let id = DeviceId::new("mac").unwrap();

        assert!(store.delete(&id).await.unwrap());
        assert!(!store.delete(&id).await.unwrap());
        assert!(store.load(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_sorted() {
        let store = MemoryTrustStore::with_devices([
            test_device("zeta", [1; 32]),
            test_device("alpha", [2; 32]),
        ]);
        let ids = store.list().await.unwrap();
        assert_eq!(ids[0].as_str(), "alpha");
        assert_eq!(ids[1].as_str(), "zeta");
    }

    #[test]
    fn trusted_device_serializes_key_as_base64() {
        let json = serde_json::to_value(test_device("mac", [0; 32])).unwrap();
        assert!(json["session_key"].is_string());
        assert!(json["signing_public_key"].is_string());
    }
}
