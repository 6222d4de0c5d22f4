//! A running clipsync device: transports, fallback and the sync coordinator.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clipsync_client::{
    ClipboardSink, DirectConfig, DirectTransport, FallbackCoordinator, InboundFrame,
    RelayConfig, RelayTransport, SyncConfig, SyncCoordinator, Transport, TrustStore,
};
use clipsync_core::ContentItem;
use clipsync_types::{ContentType, DeviceId};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::DeviceConfig;

/// Frames buffered between the transports and the coordinator.
const INBOUND_CAPACITY: usize = 256;

/// A peer to dial directly, written `DEVICE_ID=HOST:PORT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    /// Expected device.
    pub device_id: DeviceId,
    /// Where it listens.
    pub addr: String,
}

impl FromStr for PeerAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addr) = s
            .split_once('=')
            .ok_or_else(|| format!("expected DEVICE_ID=HOST:PORT, got '{s}'"))?;
        let device_id = DeviceId::new(id).map_err(|e| e.to_string())?;
        let addr = addr.trim();
        if addr.is_empty() {
            return Err(format!("missing address for {device_id}"));
        }
        Ok(Self {
            device_id,
            addr: addr.to_string(),
        })
    }
}

/// Which transports to bring up.
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    /// Accept direct connections on this address.
    pub listen: Option<String>,
    /// Dial these peers directly.
    pub peers: Vec<PeerAddr>,
    /// Relay server, `host:port`.
    pub relay: Option<String>,
    /// Take over a relay session already held by this device id.
    pub force_register: bool,
}

/// Transports plus the sync coordinator for this device.
pub struct Node {
    sync: Arc<SyncCoordinator>,
    direct: DirectTransport,
    relay: Option<RelayTransport>,
    listen_addr: Option<SocketAddr>,
    inbound: Option<mpsc::Receiver<InboundFrame>>,
}

impl Node {
    /// Bring up the configured transports.
    ///
    /// Direct peers that cannot be reached are logged and skipped; the relay
    /// leg (if any) keeps reconnecting in the background.
    pub async fn start(
        device: &DeviceConfig,
        store: Arc<dyn TrustStore>,
        options: &NodeOptions,
        sink: Arc<dyn ClipboardSink>,
    ) -> Result<Self> {
        let identity = Arc::new(device.identity()?);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let direct = DirectTransport::new(
            device.device_id.clone(),
            identity,
            store.clone(),
            DirectConfig::default(),
            inbound_tx.clone(),
        );
        let listen_addr = match &options.listen {
            Some(addr) => Some(
                direct
                    .listen(addr.as_str())
                    .await
                    .with_context(|| format!("Failed to listen on {addr}"))?,
            ),
            None => None,
        };
        for peer in &options.peers {
            match direct.connect(peer.addr.as_str(), &peer.device_id).await {
                Ok(()) => {
                    info!(peer = %peer.device_id, addr = %peer.addr, "direct link up");
                }
                Err(e) => {
                    warn!(peer = %peer.device_id, addr = %peer.addr, error = %e, "direct connect failed");
                }
            }
        }

        let relay = options.relay.as_ref().map(|addr| {
            let config = RelayConfig::new(addr.clone())
                .with_device_name(device.device_name.clone())
                .with_force_register(options.force_register);
            let relay = RelayTransport::new(device.device_id.clone(), config, inbound_tx.clone());
            relay.start();
            relay
        });
        drop(inbound_tx);

        let fallback = FallbackCoordinator::new(
            Some(Arc::new(direct.clone()) as Arc<dyn Transport>),
            relay.clone().map(|r| Arc::new(r) as Arc<dyn Transport>),
        );
        let config = SyncConfig::new(device.device_id.clone()).with_device_name(device.device_name.clone());
        let sync = Arc::new(SyncCoordinator::new(config, store, fallback, sink));

        Ok(Self {
            sync,
            direct,
            relay,
            listen_addr,
            inbound: Some(inbound_rx),
        })
    }

    /// The coordinator.
    pub fn sync(&self) -> &Arc<SyncCoordinator> {
        &self.sync
    }

    /// Bound direct address, when listening.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// Peers with an open direct link.
    pub fn direct_peers(&self) -> Vec<DeviceId> {
        self.direct.connected_peers()
    }

    /// Spawn the inbound loop. Only the first call does anything.
    pub fn spawn_inbound(&mut self) -> Option<tokio::task::JoinHandle<()>> {
        let rx = self.inbound.take()?;
        let sync = self.sync.clone();
        Some(tokio::spawn(async move { sync.run_inbound(rx, None).await }))
    }

    /// Wait until the relay link registers. `false` on timeout or without a relay.
    pub async fn wait_for_relay(&self, timeout: Duration) -> bool {
        let Some(relay) = &self.relay else {
            return false;
        };
        let deadline = tokio::time::Instant::now() + timeout;
        while !relay.is_connected() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    /// Close the relay link and every direct link.
    pub fn shutdown(&self) {
        if let Some(relay) = &self.relay {
            relay.shutdown();
        }
        for peer in self.direct.connected_peers() {
            self.direct.disconnect(&peer);
        }
    }
}

/// Prints received clipboard content to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

#[async_trait]
impl ClipboardSink for StdoutSink {
    async fn apply(&self, item: &ContentItem) {
        println!("{}", describe(item));
    }
}

/// One-line rendering of a received item.
pub fn describe(item: &ContentItem) -> String {
    let from = item
        .source
        .as_ref()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "local".to_string());
    let label = match item.content_type {
        ContentType::Text | ContentType::Link => match item.as_text() {
            Some(text) => return format!("[{from}] {text}"),
            None => "text",
        },
        ContentType::Image => "image",
        ContentType::File => "file",
    };
    format!("[{from}] <{label} {} bytes>", item.data.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipsync_client::{MemoryTrustStore, PublishOutcome, SessionKey, TrustedDevice};

    // ===========================================
    // Parsing and rendering
    // ===========================================

    #[test]
    fn peer_addr_parses_and_normalizes() {
        let peer: PeerAddr = "Android-Pixel=192.168.1.20:7071".parse().unwrap();
        assert_eq!(peer.device_id, DeviceId::new("pixel").unwrap());
        assert_eq!(peer.addr, "192.168.1.20:7071");
    }

    #[test]
    fn peer_addr_requires_both_halves() {
        assert!("pixel".parse::<PeerAddr>().is_err());
        assert!("pixel=".parse::<PeerAddr>().is_err());
        assert!("=127.0.0.1:7071".parse::<PeerAddr>().is_err());
    }

    #[test]
    fn describe_text_and_binary() {
        let source = DeviceId::new("pixel").unwrap();
        let text = ContentItem::remote(ContentType::Text, "hi", source.clone());
        assert_eq!(describe(&text), "[pixel] hi");

        let image = ContentItem::remote(ContentType::Image, vec![0u8; 4], source);
        assert_eq!(describe(&image), "[pixel] <image 4 bytes>");
    }

    // ===========================================
    // Direct link end to end
    // ===========================================

    struct RecordingSink(mpsc::UnboundedSender<ContentItem>);

    #[async_trait]
    impl ClipboardSink for RecordingSink {
        async fn apply(&self, item: &ContentItem) {
            let _ = self.0.send(item.clone());
        }
    }

    fn trust_record(device: &DeviceConfig, key: &SessionKey) -> TrustedDevice {
        let signing = device.identity().unwrap().signing_public();
        TrustedDevice {
            device_id: device.device_id.clone(),
            device_name: device.device_name.clone(),
            session_key: key.clone(),
            signing_public_key: signing,
            fingerprint: clipsync_core::key_fingerprint(&signing),
            paired_at: 1,
        }
    }

    #[tokio::test]
    async fn text_crosses_a_direct_link() {
        let laptop = DeviceConfig::new("Laptop");
        let phone = DeviceConfig::new("Phone");
        let key = SessionKey::random();
        let laptop_store = Arc::new(MemoryTrustStore::with_devices([trust_record(&phone, &key)]));
        let phone_store = Arc::new(MemoryTrustStore::with_devices([trust_record(&laptop, &key)]));

        let (tx, mut received) = mpsc::unbounded_channel();
        let listen = NodeOptions {
            listen: Some("127.0.0.1:0".into()),
            ..NodeOptions::default()
        };
        let mut laptop_node = Node::start(&laptop, laptop_store, &listen, Arc::new(RecordingSink(tx)))
            .await
            .unwrap();
        laptop_node.spawn_inbound();
        let addr = laptop_node.listen_addr().unwrap();

        let dial = NodeOptions {
            peers: vec![PeerAddr {
                device_id: laptop.device_id.clone(),
                addr: addr.to_string(),
            }],
            ..NodeOptions::default()
        };
        let phone_node = Node::start(&phone, phone_store, &dial, Arc::new(StdoutSink))
            .await
            .unwrap();
        assert_eq!(phone_node.direct_peers(), vec![laptop.device_id.clone()]);

        let outcome = phone_node.sync().publish(ContentItem::text("from the phone")).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Sent(ref report) if report.any_delivered()));

        let item = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.as_text(), Some("from the phone"));
        assert_eq!(item.source, Some(phone.device_id.clone()));

        phone_node.shutdown();
        laptop_node.shutdown();
    }

    #[tokio::test]
    async fn peer_answering_with_another_id_is_not_linked() {
        let laptop = DeviceConfig::new("Laptop");
        let tablet = DeviceConfig::new("Tablet");
        let phone = DeviceConfig::new("Phone");
        let key = SessionKey::random();
        let laptop_store = Arc::new(MemoryTrustStore::with_devices([trust_record(&phone, &key)]));
        let phone_store = Arc::new(MemoryTrustStore::with_devices([
            trust_record(&laptop, &key),
            trust_record(&tablet, &SessionKey::random()),
        ]));

        let listen = NodeOptions {
            listen: Some("127.0.0.1:0".into()),
            ..NodeOptions::default()
        };
        let laptop_node = Node::start(&laptop, laptop_store, &listen, Arc::new(StdoutSink))
            .await
            .unwrap();
        let addr = laptop_node.listen_addr().unwrap();

        // The phone expects the tablet at the laptop's address.
        let dial = NodeOptions {
            peers: vec![PeerAddr {
                device_id: tablet.device_id.clone(),
                addr: addr.to_string(),
            }],
            ..NodeOptions::default()
        };
        let phone_node = Node::start(&phone, phone_store, &dial, Arc::new(StdoutSink))
            .await
            .unwrap();

        assert!(phone_node.direct_peers().is_empty());
        phone_node.shutdown();
        laptop_node.shutdown();
    }

    #[tokio::test]
    async fn wait_for_relay_without_relay_is_false() {
        let device = DeviceConfig::new("Laptop");
        let node = Node::start(
            &device,
            Arc::new(MemoryTrustStore::new()),
            &NodeOptions::default(),
            Arc::new(StdoutSink),
        )
        .await
        .unwrap();
        assert!(!node.wait_for_relay(Duration::from_millis(10)).await);
    }
}
