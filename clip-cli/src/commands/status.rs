//! Show device identity and paired devices.

use anyhow::Result;
use std::path::Path;

use crate::config::DeviceConfig;
use crate::trust_store::FileTrustStore;

/// Run the status command.
pub async fn run(data_dir: &Path) -> Result<()> {
    println!("=== clipsync status ===");
    println!();

    let device = match DeviceConfig::load(data_dir).await {
        Ok(device) => device,
        Err(_) => {
            println!("Device: NOT INITIALIZED");
            println!();
            println!("Run 'clipsync init --name <name>' to initialize.");
            return Ok(());
        }
    };
    let identity = device.identity()?;

    println!("Device:");
    println!("  ID:          {}", device.device_id);
    println!("  Name:        {}", device.device_name);
    println!("  Fingerprint: {}", identity.fingerprint());
    println!("  Init:        {}", format_timestamp(device.created_at));
    println!();

    let store = FileTrustStore::open(data_dir).await?;
    let peers = store.all().await;
    if peers.is_empty() {
        println!("Paired devices: NONE");
        println!();
        println!("Run 'clipsync pair --show' or 'clipsync pair --join <code>'");
        return Ok(());
    }

    println!("Paired devices: {}", peers.len());
    for peer in peers {
        println!("  {} ({})", peer.device_name, peer.device_id);
        println!("    Fingerprint: {}", short(&peer.fingerprint));
        println!("    Paired:      {}", format_timestamp(peer.paired_at));
    }

    Ok(())
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..16).unwrap_or(fingerprint)
}

/// Format a Unix timestamp as a human-readable string.
fn format_timestamp(ts: u64) -> String {
    let diff = clipsync_core::unix_now_secs().saturating_sub(ts);

    if diff < 60 {
        "just now".to_string()
    } else if diff < 3600 {
        format!("{} minutes ago", diff / 60)
    } else if diff < 86400 {
        format!("{} hours ago", diff / 3600)
    } else {
        format!("{} days ago", diff / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipsync_client::{SessionKey, TrustStore, TrustedDevice};
    use clipsync_core::{key_fingerprint, unix_now_secs};
    use clipsync_types::DeviceId;
    use tempfile::tempdir;

    #[tokio::test]
    async fn status_without_init() {
        let dir = tempdir().unwrap();
        assert!(run(dir.path()).await.is_ok());
    }

    #[tokio::test]
    async fn status_with_paired_device() {
        let dir = tempdir().unwrap();
        DeviceConfig::new("Laptop").save(dir.path()).await.unwrap();
        let store = FileTrustStore::open(dir.path()).await.unwrap();
        store
            .save(TrustedDevice {
                device_id: DeviceId::new("pixel").unwrap(),
                device_name: "Pixel".into(),
                session_key: SessionKey::random(),
                signing_public_key: [3u8; 32],
                fingerprint: key_fingerprint(&[3u8; 32]),
                paired_at: unix_now_secs(),
            })
            .await
            .unwrap();

        assert!(run(dir.path()).await.is_ok());
    }

    #[test]
    fn short_fingerprint_tolerates_short_input() {
        assert_eq!(short("abc"), "abc");
        assert_eq!(short(&"f".repeat(64)).len(), 16);
    }

    #[test]
    fn format_timestamp_works() {
        let now = unix_now_secs();

        assert_eq!(format_timestamp(now), "just now");
        assert!(format_timestamp(now - 120).contains("minutes"));
        assert!(format_timestamp(now - 7200).contains("hours"));
        assert!(format_timestamp(now - 172800).contains("days"));
    }
}
