//! Send command: publish one text item and exit.

use anyhow::Result;
use clipsync_client::{BroadcastReport, PublishOutcome};
use clipsync_core::ContentItem;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::DeviceConfig;
use crate::node::{Node, NodeOptions, StdoutSink};
use crate::trust_store::FileTrustStore;

/// How long to wait for the relay to register before sending.
const RELAY_WAIT: Duration = Duration::from_secs(5);

/// Time for queued frames to reach the sockets before links close.
const FLUSH_GRACE: Duration = Duration::from_millis(300);

/// Run the send command.
pub async fn run(data_dir: &Path, text: &str, options: NodeOptions) -> Result<()> {
    let device = DeviceConfig::load(data_dir).await?;
    let store = Arc::new(FileTrustStore::open(data_dir).await?);
    let node = Node::start(&device, store, &options, Arc::new(StdoutSink)).await?;

    if options.relay.is_some() && !node.wait_for_relay(RELAY_WAIT).await {
        warn!("relay not connected, sending over direct links only");
    }

    let outcome = node.sync().publish(ContentItem::text(text)).await;
    tokio::time::sleep(FLUSH_GRACE).await;
    node.shutdown();

    match outcome? {
        PublishOutcome::Sent(report) => print_report(&report),
        PublishOutcome::NoPeers => {
            anyhow::bail!("No paired devices. Run 'clipsync pair' first.")
        }
        PublishOutcome::Duplicate | PublishOutcome::SuppressedRemote => {
            println!("Nothing to send.");
            Ok(())
        }
    }
}

fn print_report(report: &BroadcastReport) -> Result<()> {
    for delivery in &report.delivered {
        let via: Vec<&str> = delivery.via.iter().map(|kind| kind.as_str()).collect();
        println!("Sent to {} via {}", delivery.peer, via.join("+"));
    }
    for failure in &report.failed {
        println!("Failed: {failure}");
    }
    if !report.any_delivered() {
        anyhow::bail!("No paired device was reachable");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipsync_client::{Delivery, DualSendError, TransportError};
    use clipsync_core::TransportKind;
    use clipsync_types::DeviceId;
    use tempfile::tempdir;

    #[test]
    fn report_with_a_delivery_succeeds() {
        let report = BroadcastReport {
            delivered: vec![Delivery {
                peer: DeviceId::new("pixel").unwrap(),
                via: vec![TransportKind::Direct, TransportKind::Relay],
            }],
            failed: Vec::new(),
        };
        assert!(print_report(&report).is_ok());
    }

    #[test]
    fn report_without_deliveries_fails() {
        let peer = DeviceId::new("pixel").unwrap();
        let report = BroadcastReport {
            delivered: Vec::new(),
            failed: vec![DualSendError::AllFailed {
                peer: peer.clone(),
                direct: TransportError::PeerUnreachable(peer),
                relay: TransportError::NotConnected,
            }],
        };
        assert!(print_report(&report).is_err());
    }

    #[tokio::test]
    async fn send_without_peers_fails() {
        let dir = tempdir().unwrap();
        DeviceConfig::new("Laptop").save(dir.path()).await.unwrap();

        let err = run(dir.path(), "hello", NodeOptions::default()).await.unwrap_err();
        assert!(err.to_string().contains("No paired devices"));
    }
}
