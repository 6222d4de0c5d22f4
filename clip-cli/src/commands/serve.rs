//! Serve command: keep a device online, print what arrives and publish what
//! is typed.
//!
//! Each stdin line is published as a text clipboard item. After stdin closes
//! the device keeps receiving until interrupted.

use anyhow::Result;
use clipsync_client::PublishOutcome;
use clipsync_core::ContentItem;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::node::{Node, NodeOptions, StdoutSink};
use crate::trust_store::FileTrustStore;

/// Run the serve command.
pub async fn run(data_dir: &Path, options: NodeOptions) -> Result<()> {
    let device = DeviceConfig::load(data_dir).await?;
    let store = Arc::new(FileTrustStore::open(data_dir).await?);
    let mut node = Node::start(&device, store, &options, Arc::new(StdoutSink)).await?;
    node.spawn_inbound();

    println!("Serving as {} ({})", device.device_name, device.device_id);
    if let Some(addr) = node.listen_addr() {
        println!("  Direct: listening on {addr}");
    }
    for peer in node.direct_peers() {
        println!("  Direct: linked to {peer}");
    }
    if let Some(relay) = &options.relay {
        println!("  Relay:  {relay}");
    }
    println!();
    println!("Type a line to share it. Ctrl+C to stop.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => publish_line(&node, &line).await,
                Ok(None) => {
                    info!("stdin closed, still receiving");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "stdin read failed, still receiving");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!();
    println!("Shutting down...");
    let stats = node.sync().stats();
    info!(?stats, "sync stats");
    node.shutdown();
    Ok(())
}

async fn publish_line(node: &Node, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    match node.sync().publish(ContentItem::text(line)).await {
        Ok(PublishOutcome::Sent(report)) => {
            info!(
                delivered = report.delivered.len(),
                failed = report.failed.len(),
                "published"
            );
            for failure in &report.failed {
                warn!(error = %failure, "peer unreachable");
            }
        }
        Ok(PublishOutcome::Duplicate) => debug!("same content published moments ago, skipped"),
        Ok(PublishOutcome::NoPeers) => warn!("no paired devices, nothing sent"),
        Ok(PublishOutcome::SuppressedRemote) => {}
        Err(e) => warn!(error = %e, "publish failed"),
    }
}
