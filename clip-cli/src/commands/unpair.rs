//! Forget a paired device.

use anyhow::{Context, Result};
use clipsync_client::TrustStore;
use clipsync_types::DeviceId;
use std::path::Path;

use crate::config::DeviceConfig;
use crate::trust_store::FileTrustStore;

/// Run the unpair command.
pub async fn run(data_dir: &Path, device: &str) -> Result<()> {
    DeviceConfig::load(data_dir).await?;
    let device_id = DeviceId::new(device).context("Invalid device id")?;
    let store = FileTrustStore::open(data_dir).await?;

    if !store.delete(&device_id).await? {
        anyhow::bail!("No paired device with id {device_id}");
    }
    println!("Unpaired {device_id}");
    Ok(())
}
