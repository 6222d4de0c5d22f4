//! File-backed trust store.
//!
//! All trusted devices live in one JSON file (`trusted.json`). Reads are
//! served from memory; every write rewrites the file through a temp file and
//! rename, then swaps the in-memory map.

use async_trait::async_trait;
use clipsync_client::{TrustStore, TrustStoreError, TrustedDevice};
use clipsync_types::DeviceId;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

const TRUST_FILE: &str = "trusted.json";

/// Trust store persisted as `trusted.json` in the data directory.
#[derive(Debug)]
pub struct FileTrustStore {
    path: PathBuf,
    devices: RwLock<Arc<BTreeMap<DeviceId, Arc<TrustedDevice>>>>,
}

impl FileTrustStore {
    /// Open the store in `data_dir`. A missing file is an empty store.
    pub async fn open(data_dir: &Path) -> Result<Self, TrustStoreError> {
        let path = data_dir.join(TRUST_FILE);
        let devices = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let list: Vec<TrustedDevice> = serde_json::from_slice(&bytes)
                    .map_err(|e| TrustStoreError::Serialization(e.to_string()))?;
                list.into_iter()
                    .map(|d| (d.device_id.clone(), Arc::new(d)))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            devices: RwLock::new(Arc::new(devices)),
        })
    }

    /// Every trusted device, sorted by id.
    pub async fn all(&self) -> Vec<Arc<TrustedDevice>> {
        self.devices.read().await.values().cloned().collect()
    }

    async fn persist(&self, devices: &BTreeMap<DeviceId, Arc<TrustedDevice>>) -> Result<(), TrustStoreError> {
        let list: Vec<&TrustedDevice> = devices.values().map(Arc::as_ref).collect();
        let json = serde_json::to_vec_pretty(&list)
            .map_err(|e| TrustStoreError::Serialization(e.to_string()))?;
        crate::config::write_private(&self.path, &json)
            .await
            .map_err(|e| TrustStoreError::Io(std::io::Error::other(format!("{e:#}"))))
    }
}

#[async_trait]
impl TrustStore for FileTrustStore {
    async fn save(&self, device: TrustedDevice) -> Result<(), TrustStoreError> {
        let mut guard = self.devices.write().await;
        let mut next = BTreeMap::clone(&guard);
        next.insert(device.device_id.clone(), Arc::new(device));
        self.persist(&next).await?;
        *guard = Arc::new(next);
        Ok(())
    }

    async fn load(&self, device_id: &DeviceId) -> Result<Option<Arc<TrustedDevice>>, TrustStoreError> {
        Ok(self.devices.read().await.get(device_id).cloned())
    }

    async fn delete(&self, device_id: &DeviceId) -> Result<bool, TrustStoreError> {
        let mut guard = self.devices.write().await;
        if !guard.contains_key(device_id) {
            return Ok(false);
        }
        let mut next = BTreeMap::clone(&guard);
        next.remove(device_id);
        self.persist(&next).await?;
        *guard = Arc::new(next);
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<DeviceId>, TrustStoreError> {
        Ok(self.devices.read().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipsync_client::SessionKey;
    use clipsync_core::key_fingerprint;
    use tempfile::tempdir;

    fn device(id: &str) -> TrustedDevice {
        TrustedDevice {
            device_id: DeviceId::new(id).unwrap(),
            device_name: id.to_uppercase(),
            session_key: SessionKey::random(),
            signing_public_key: [7u8; 32],
            fingerprint: key_fingerprint(&[7u8; 32]),
            paired_at: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn saved_devices_survive_reopen() {
        let dir = tempdir().unwrap();
        let store = FileTrustStore::open(dir.path()).await.unwrap();
        let pixel = device("pixel");
        store.save(pixel.clone()).await.unwrap();
        store.save(device("ipad")).await.unwrap();

        let reopened = FileTrustStore::open(dir.path()).await.unwrap();
        let loaded = reopened.load(&DeviceId::new("Android-Pixel").unwrap()).await.unwrap();
        assert_eq!(loaded.as_deref(), Some(&pixel));
        assert_eq!(
            reopened.list().await.unwrap(),
            vec![DeviceId::new("ipad").unwrap(), DeviceId::new("pixel").unwrap()]
        );
    }

    #[tokio::test]
    async fn save_replaces_whole_record() {
        let dir = tempdir().unwrap();
        let store = FileTrustStore::open(dir.path()).await.unwrap();
        let first = device("pixel");
        store.save(first.clone()).await.unwrap();
        let held = store.load(&first.device_id).await.unwrap().unwrap();

        let second = device("pixel");
        store.save(second.clone()).await.unwrap();

        assert_eq!(*held, first);
        let current = store.load(&first.device_id).await.unwrap().unwrap();
        assert_eq!(current.session_key, second.session_key);
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let dir = tempdir().unwrap();
        let store = FileTrustStore::open(dir.path()).await.unwrap();
        store.save(device("pixel")).await.unwrap();

        let id = DeviceId::new("pixel").unwrap();
        assert!(store.delete(&id).await.unwrap());
        assert!(!store.delete(&id).await.unwrap());

        let reopened = FileTrustStore::open(dir.path()).await.unwrap();
        assert!(reopened.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join(TRUST_FILE), b"not json").await.unwrap();

        let err = FileTrustStore::open(dir.path()).await.unwrap_err();
        assert!(matches!(err, TrustStoreError::Serialization(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn trust_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let store = FileTrustStore::open(dir.path()).await.unwrap();
        store.save(device("pixel")).await.unwrap();

        let perms = tokio::fs::metadata(dir.path().join(TRUST_FILE))
            .await
            .unwrap()
            .permissions();
        assert_eq!(perms.mode() & 0o777, 0o600);
    }
}
