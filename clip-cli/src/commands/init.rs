//! Initialize device identity.

use anyhow::Result;
use std::path::Path;

use crate::config::DeviceConfig;

/// Run the init command.
pub async fn run(data_dir: &Path, name: &str) -> Result<()> {
    if DeviceConfig::exists(data_dir).await {
        anyhow::bail!(
            "Device already initialized. Delete {} to reinitialize.",
            data_dir.join("device.json").display()
        );
    }
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("Device name must not be empty");
    }

    let config = DeviceConfig::new(name);
    let identity = config.identity()?;
    config.save(data_dir).await?;

    println!("Device initialized successfully!");
    println!();
    println!("  Device ID:   {}", config.device_id);
    println!("  Name:        {}", config.device_name);
    println!("  Fingerprint: {}", identity.fingerprint());
    println!("  Data dir:    {}", data_dir.display());
    println!();
    println!("Next steps:");
    println!("  1. Show a pairing code: clipsync pair --show");
    println!("  2. Or join another device: clipsync pair --join <code>");

    Ok(())
}
