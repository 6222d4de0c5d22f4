//! Direct peer-to-peer TCP transport.
//!
//! Every connection starts with a mutual identity check before any clipboard
//! frame is accepted:
//!
//! 1. both sides send `direct_hello {device_id, signing_public_key, nonce}`
//! 2. the peer id must be paired and its signing key must equal the pinned key
//! 3. both sides send `direct_proof`, a signature over the peer's nonce
//!
//! A failure at any step closes the socket and publishes
//! [`ConnectionEvent::PeerRejected`]. There is no unauthenticated fallback.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clipsync_core::handshake::random_nonce;
use clipsync_core::{ConnectionEvent, Liveness, PeerConnectionRecord, TransportKind};
use clipsync_types::{ControlMessage, DeviceId, Envelope, FrameCodec, DEFAULT_MAX_FRAME_LEN};
use dashmap::DashMap;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::framed::{write_envelope, write_frame, FrameReader};
use super::{InboundFrame, Transport, TransportError, EVENT_CHANNEL_CAPACITY};
use crate::crypto::{verify_signature, IdentityKeys};
use crate::trust::TrustStore;

/// Domain tag for direct-channel identity proofs.
pub const DIRECT_PROOF_DOMAIN: &[u8] = b"clipsync/direct-proof/v1";

const OUTBOUND_QUEUE: usize = 64;

/// Direct transport settings.
#[derive(Debug, Clone)]
pub struct DirectConfig {
    /// Largest frame accepted or sent.
    pub max_frame_len: usize,
    /// Budget for TCP connect.
    pub connect_timeout: Duration,
    /// Budget for the hello/proof exchange.
    pub handshake_timeout: Duration,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl DirectConfig {
    /// Set the maximum frame length.
    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    /// Set the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Bytes signed in a `direct_proof`.
fn proof_bytes(peer_nonce: &[u8; 32], signer: &DeviceId) -> Vec<u8> {
    let mut out = Vec::with_capacity(DIRECT_PROOF_DOMAIN.len() + 32 + signer.as_bytes().len());
    out.extend_from_slice(DIRECT_PROOF_DOMAIN);
    out.extend_from_slice(peer_nonce);
    out.extend_from_slice(signer.as_bytes());
    out
}

struct Link {
    id: u64,
    outbound: mpsc::Sender<Vec<u8>>,
}

struct DirectInner {
    local_id: DeviceId,
    identity: Arc<IdentityKeys>,
    store: Arc<dyn TrustStore>,
    config: DirectConfig,
    codec: FrameCodec,
    links: DashMap<DeviceId, Link>,
    records: DashMap<DeviceId, PeerConnectionRecord>,
    events: broadcast::Sender<ConnectionEvent>,
    inbound: mpsc::Sender<InboundFrame>,
    next_link_id: AtomicU64,
}

/// Authenticated TCP links to paired peers.
#[derive(Clone)]
pub struct DirectTransport {
    inner: Arc<DirectInner>,
}

impl DirectTransport {
    /// Create a transport. Authenticated inbound frames go to `inbound`.
    pub fn new(
        local_id: DeviceId,
        identity: Arc<IdentityKeys>,
        store: Arc<dyn TrustStore>,
        config: DirectConfig,
        inbound: mpsc::Sender<InboundFrame>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let codec = FrameCodec::new(config.max_frame_len);
        Self {
            inner: Arc::new(DirectInner {
                local_id,
                identity,
                store,
                config,
                codec,
                links: DashMap::new(),
                records: DashMap::new(),
                events,
                inbound,
                next_link_id: AtomicU64::new(1),
            }),
        }
    }

    /// Accept connections on `addr`. Returns the bound address.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, "direct transport listening");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            if let Err(e) = inner.establish(stream, None).await {
                                debug!(remote = %remote, error = %e, "inbound direct connection rejected");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "direct accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        Ok(local)
    }

    /// Connect to `expected` at `addr` and authenticate it.
    ///
    /// A hello from any other device ends the connection before a proof is
    /// sent.
    pub async fn connect(
        &self,
        addr: impl ToSocketAddrs,
        expected: &DeviceId,
    ) -> Result<(), TransportError> {
        let stream = tokio::time::timeout(self.inner.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        self.inner.establish(stream, Some(expected)).await.map(|_| ())
    }

    /// Drop the link to `peer`, if any.
    pub fn disconnect(&self, peer: &DeviceId) -> bool {
        self.inner.links.remove(peer).is_some()
    }

    /// Peers with a live authenticated link.
    pub fn connected_peers(&self) -> Vec<DeviceId> {
        let mut peers: Vec<DeviceId> = self.inner.links.iter().map(|e| e.key().clone()).collect();
        peers.sort();
        peers
    }
}

impl DirectInner {
    async fn establish(
        self: &Arc<Self>,
        stream: TcpStream,
        expected: Option<&DeviceId>,
    ) -> Result<DeviceId, TransportError> {
        let _ = stream.set_nodelay(true);
        let (read, mut write) = stream.into_split();
        let mut reader = FrameReader::new(read, self.config.max_frame_len);

        let handshake = tokio::time::timeout(
            self.config.handshake_timeout,
            self.authenticate(&mut reader, &mut write, expected),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout));

        let peer = match handshake {
            Ok(peer) => peer,
            Err(e) => {
                let claimed = match &e {
                    TransportError::FingerprintMismatch { peer, .. } => DeviceId::new(peer).ok(),
                    TransportError::UnexpectedPeer { actual, .. } => Some(actual.clone()),
                    _ => None,
                };
                warn!(error = %e, "direct handshake failed");
                let _ = self.events.send(ConnectionEvent::PeerRejected {
                    peer: claimed,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        self.attach(peer.clone(), reader, write);
        Ok(peer)
    }

    async fn authenticate(
        &self,
        reader: &mut FrameReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
        expected: Option<&DeviceId>,
    ) -> Result<DeviceId, TransportError> {
        let our_nonce = random_nonce();
        let hello = ControlMessage::DirectHello {
            device_id: self.local_id.clone(),
            signing_public_key: self.identity.signing_public(),
            nonce: our_nonce,
        };
        write_envelope(writer, &self.codec, &Envelope::control(hello)).await?;

        let (peer, presented_key, their_nonce) = match next_control(reader).await? {
            ControlMessage::DirectHello {
                device_id,
                signing_public_key,
                nonce,
            } => (device_id, signing_public_key, nonce),
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected direct_hello, got {}",
                    other.action()
                )))
            }
        };

        if let Some(expected) = expected {
            if *expected != peer {
                return Err(TransportError::UnexpectedPeer {
                    expected: expected.clone(),
                    actual: peer,
                });
            }
        }

        let mismatch = |reason: &str| TransportError::FingerprintMismatch {
            peer: peer.to_string(),
            reason: reason.to_string(),
        };
        let trusted = self
            .store
            .load(&peer)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?
            .ok_or_else(|| mismatch("device is not paired"))?;
        if trusted.signing_public_key != presented_key {
            return Err(mismatch("identity key does not match trust record"));
        }

        let proof = ControlMessage::DirectProof {
            signature: self.identity.sign(&proof_bytes(&their_nonce, &self.local_id)),
        };
        write_envelope(writer, &self.codec, &Envelope::control(proof)).await?;

        match next_control(reader).await? {
            ControlMessage::DirectProof { signature } => {
                verify_signature(&presented_key, &proof_bytes(&our_nonce, &peer), &signature)
                    .map_err(|_| mismatch("identity proof failed"))?;
            }
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected direct_proof, got {}",
                    other.action()
                )))
            }
        }

        Ok(peer)
    }

    fn attach(
        self: &Arc<Self>,
        peer: DeviceId,
        mut reader: FrameReader<OwnedReadHalf>,
        mut writer: OwnedWriteHalf,
    ) {
        let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);

        // A newer link replaces an older one; the old writer exits when its
        // sender is dropped here.
        self.links.insert(
            peer.clone(),
            Link {
                id: link_id,
                outbound: tx,
            },
        );
        let mut record = PeerConnectionRecord::connecting(peer.clone(), TransportKind::Direct);
        record.set(Liveness::Up);
        self.records.insert(peer.clone(), record);
        let _ = self.events.send(ConnectionEvent::PeerUp {
            peer: peer.clone(),
            kind: TransportKind::Direct,
        });
        info!(peer = %peer, "direct link up");

        let codec = self.codec;
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &codec, &payload).await {
                    debug!(error = %e, "direct write failed");
                    break;
                }
            }
        });

        let inner = self.clone();
        tokio::spawn(async move {
            let reason = loop {
                match reader.next_frame().await {
                    Ok(Some(payload)) => {
                        let frame = InboundFrame {
                            kind: TransportKind::Direct,
                            peer: Some(peer.clone()),
                            payload,
                        };
                        if inner.inbound.send(frame).await.is_err() {
                            break "receiver dropped".to_string();
                        }
                    }
                    Ok(None) => break "connection closed".to_string(),
                    Err(e) => break e.to_string(),
                }
            };
            inner.detach(&peer, link_id, reason);
        });
    }

    fn detach(&self, peer: &DeviceId, link_id: u64, reason: String) {
        // Only the link that is still current may tear down shared state.
        if self.links.remove_if(peer, |_, link| link.id == link_id).is_none() {
            return;
        }
        if let Some(mut record) = self.records.get_mut(peer) {
            record.set(Liveness::Down);
        }
        info!(peer = %peer, reason = %reason, "direct link down");
        let _ = self.events.send(ConnectionEvent::PeerDown {
            peer: peer.clone(),
            kind: TransportKind::Direct,
            reason,
        });
    }
}

async fn next_control(
    reader: &mut FrameReader<OwnedReadHalf>,
) -> Result<ControlMessage, TransportError> {
    let envelope = reader
        .next_envelope()
        .await?
        .ok_or(TransportError::ConnectionClosed)?;
    envelope
        .control_message()
        .cloned()
        .ok_or_else(|| TransportError::Protocol("expected control envelope".into()))
}

#[async_trait]
impl Transport for DirectTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn can_reach(&self, peer: &DeviceId) -> bool {
        self.inner.links.contains_key(peer)
    }

    async fn send(&self, peer: &DeviceId, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > self.inner.codec.max_frame_len() {
            return Err(TransportError::FrameTooLarge {
                len: payload.len(),
                max: self.inner.codec.max_frame_len(),
            });
        }
        let outbound = self
            .inner
            .links
            .get(peer)
            .map(|link| link.outbound.clone())
            .ok_or_else(|| TransportError::PeerUnreachable(peer.clone()))?;
        outbound
            .send(payload.to_vec())
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    fn records(&self) -> Vec<PeerConnectionRecord> {
        self.inner.records.iter().map(|e| e.value().clone()).collect()
    }
}
