//! Sync coordinator: local changes out, remote content in.
//!
//! Outbound, a local item is encrypted once per paired peer (the associated
//! data is our own device id) and handed to the [`FallbackCoordinator`].
//! Inbound, frames from any transport are decrypted with the sender's
//! session key, deduplicated per sender, and applied through a
//! [`ClipboardSink`].
//!
//! Loop prevention:
//! - remote-origin items are never published
//! - a fingerprint seen from the same device inside the dedup window is
//!   dropped, which absorbs the second copy of every dual-send
//! - applied remote content is also recorded under the local device, so the
//!   clipboard change it causes does not bounce back out

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clipsync_core::{ContentItem, ContentPlaintext, DedupWindow, DEFAULT_DEDUP_WINDOW};
use clipsync_types::{
    ContentPayload, ControlMessage, DeviceId, EncryptionMeta, Envelope, WireError,
    DEFAULT_MAX_FRAME_LEN,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::crypto::{decrypt, encrypt_with, CryptoError, NonceSource, OsNonceSource};
use crate::fallback::{BroadcastReport, FallbackCoordinator, DEFAULT_DIRECT_TIMEOUT};
use crate::transport::InboundFrame;
use crate::trust::{TrustStore, TrustStoreError, TrustedDevice};

/// Sync errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Encoded envelope would exceed the frame limit. Nothing was sent.
    #[error("content too large: {len} bytes (limit: {max} bytes)")]
    ContentTooLarge {
        /// Encoded envelope size.
        len: usize,
        /// Frame limit.
        max: usize,
    },

    /// Trust store failure.
    #[error("trust store error: {0}")]
    TrustStore(#[from] TrustStoreError),

    /// Encryption failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Envelope encoding failure.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Content plaintext could not be encoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// This device.
    pub device_id: DeviceId,
    /// Name placed in outbound envelopes.
    pub device_name: Option<String>,
    /// Duplicate detection window.
    pub dedup_window: Duration,
    /// Direct leg budget for dual-send.
    pub direct_timeout: Duration,
    /// Largest encoded envelope that will be sent.
    pub max_frame_len: usize,
}

impl SyncConfig {
    /// Defaults for `device_id`.
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            device_name: None,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            direct_timeout: DEFAULT_DIRECT_TIMEOUT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Set the device name.
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    /// Set the dedup window.
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// Set the direct leg timeout.
    pub fn with_direct_timeout(mut self, timeout: Duration) -> Self {
        self.direct_timeout = timeout;
        self
    }

    /// Set the frame limit.
    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }
}

/// Receives remote content to apply locally.
#[async_trait]
pub trait ClipboardSink: Send + Sync {
    /// Write `item` to the local clipboard (or wherever it belongs).
    async fn apply(&self, item: &ContentItem);
}

/// Result of [`SyncCoordinator::publish`].
#[derive(Debug)]
pub enum PublishOutcome {
    /// Frames were handed to the transports.
    Sent(BroadcastReport),
    /// Remote-origin item; never re-broadcast.
    SuppressedRemote,
    /// Same content was published within the window.
    Duplicate,
    /// No paired peers.
    NoPeers,
}

/// Why an inbound frame was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Not a valid envelope or content body.
    Malformed,
    /// Addressed to a different device.
    NotForUs,
    /// Sender has no trust record.
    UnknownSender,
    /// Envelope sender differs from the authenticated link peer.
    SenderMismatch,
    /// Authentication failed.
    DecryptFailed,
}

/// Result of [`SyncCoordinator::handle_inbound`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Content decrypted and applied.
    Applied(ContentItem),
    /// Same content from the same sender inside the window.
    Duplicate {
        /// Sender.
        from: DeviceId,
    },
    /// Control traffic for the caller.
    Control(ControlMessage),
    /// Frame discarded.
    Dropped(DropReason),
}

/// Counters for observability.
#[derive(Debug, Default)]
pub struct SyncStats {
    published: AtomicU64,
    applied: AtomicU64,
    suppressed_remote: AtomicU64,
    duplicates_dropped: AtomicU64,
    decrypt_failures: AtomicU64,
    oversize_rejected: AtomicU64,
    unknown_senders: AtomicU64,
}

/// Point-in-time copy of [`SyncStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatsSnapshot {
    /// Local items sent to at least one transport.
    pub published: u64,
    /// Remote items applied locally.
    pub applied: u64,
    /// Remote-origin items refused for broadcast.
    pub suppressed_remote: u64,
    /// Duplicates dropped (either direction).
    pub duplicates_dropped: u64,
    /// Inbound frames that failed authentication.
    pub decrypt_failures: u64,
    /// Local items rejected for size.
    pub oversize_rejected: u64,
    /// Inbound frames from unpaired devices.
    pub unknown_senders: u64,
}

impl SyncStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counters.
    pub fn snapshot(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            suppressed_remote: self.suppressed_remote.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
            oversize_rejected: self.oversize_rejected.load(Ordering::Relaxed),
            unknown_senders: self.unknown_senders.load(Ordering::Relaxed),
        }
    }
}

/// Bridges local clipboard changes and inbound envelopes.
pub struct SyncCoordinator {
    config: SyncConfig,
    store: Arc<dyn TrustStore>,
    fallback: FallbackCoordinator,
    sink: Arc<dyn ClipboardSink>,
    nonces: Arc<dyn NonceSource>,
    dedup: Mutex<DedupWindow>,
    stats: SyncStats,
}

impl SyncCoordinator {
    /// Create a coordinator.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn TrustStore>,
        fallback: FallbackCoordinator,
        sink: Arc<dyn ClipboardSink>,
    ) -> Self {
        let dedup = Mutex::new(DedupWindow::new(config.dedup_window));
        let fallback = fallback.with_direct_timeout(config.direct_timeout);
        Self {
            config,
            store,
            fallback,
            sink,
            nonces: Arc::new(OsNonceSource),
            dedup,
            stats: SyncStats::default(),
        }
    }

    /// Replace the nonce source (tests only need this).
    pub fn with_nonce_source(mut self, nonces: Arc<dyn NonceSource>) -> Self {
        self.nonces = nonces;
        self
    }

    /// Settings in use.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Current counters.
    pub fn stats(&self) -> SyncStatsSnapshot {
        self.stats.snapshot()
    }

    /// The dual-send coordinator.
    pub fn fallback(&self) -> &FallbackCoordinator {
        &self.fallback
    }

    fn local_id(&self) -> &DeviceId {
        &self.config.device_id
    }

    /// Returns `true` if `item` is a duplicate from `device`.
    ///
    /// Expired entries of every sender are dropped first, so idle peers do
    /// not keep a partition alive.
    fn seen(&self, device: &DeviceId, item: &ContentItem) -> bool {
        let now = Instant::now();
        let mut dedup = self.dedup.lock().unwrap_or_else(|e| e.into_inner());
        dedup.prune(now);
        dedup.check_and_record(device, item.fingerprint(), now)
    }

    /// Senders with live duplicate-detection entries.
    pub fn tracked_senders(&self) -> usize {
        self.dedup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .device_count()
    }

    /// Send a local item to every paired peer.
    pub async fn publish(&self, item: ContentItem) -> Result<PublishOutcome, SyncError> {
        if !item.is_broadcastable() {
            SyncStats::bump(&self.stats.suppressed_remote);
            debug!(source = ?item.source, "remote item not re-broadcast");
            return Ok(PublishOutcome::SuppressedRemote);
        }

        let mut peers = Vec::new();
        for peer_id in self.store.list().await? {
            if let Some(device) = self.store.load(&peer_id).await? {
                peers.push(device);
            }
        }
        if peers.is_empty() {
            debug!("no paired peers");
            return Ok(PublishOutcome::NoPeers);
        }

        // Every frame is built before anything is sent, so an oversized item
        // reaches no one.
        let plaintext = item.to_plaintext().to_bytes()?;
        let mut frames = Vec::with_capacity(peers.len());
        for device in &peers {
            let envelope = self.seal_for(device, &item, &plaintext)?;
            let bytes = envelope.to_json_bytes()?;
            if bytes.len() > self.config.max_frame_len {
                SyncStats::bump(&self.stats.oversize_rejected);
                warn!(
                    len = bytes.len(),
                    max = self.config.max_frame_len,
                    "content rejected: frame too large"
                );
                return Err(SyncError::ContentTooLarge {
                    len: bytes.len(),
                    max: self.config.max_frame_len,
                });
            }
            frames.push((device.device_id.clone(), bytes));
        }

        if self.seen(self.local_id(), &item) {
            SyncStats::bump(&self.stats.duplicates_dropped);
            debug!(fingerprint = %item.fingerprint().short_hex(), "duplicate local change dropped");
            return Ok(PublishOutcome::Duplicate);
        }

        let report = self.fallback.broadcast(frames).await;
        if report.any_delivered() {
            SyncStats::bump(&self.stats.published);
        }
        info!(
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            fingerprint = %item.fingerprint().short_hex(),
            "published clipboard content"
        );
        Ok(PublishOutcome::Sent(report))
    }

    fn seal_for(
        &self,
        device: &TrustedDevice,
        item: &ContentItem,
        plaintext: &[u8],
    ) -> Result<Envelope, SyncError> {
        let sealed = encrypt_with(
            self.nonces.as_ref(),
            plaintext,
            &device.session_key,
            self.local_id().as_bytes(),
        )?;
        Ok(Envelope::content(ContentPayload {
            content_type: item.content_type,
            ciphertext: sealed.ciphertext,
            device_id: self.local_id().clone(),
            device_name: self.config.device_name.clone(),
            target: Some(device.device_id.clone()),
            encryption: EncryptionMeta::aes_gcm(sealed.nonce, sealed.tag),
        }))
    }

    /// Decrypt, deduplicate, and apply one inbound frame.
    ///
    /// Never fails: every problem resolves to a dropped frame.
    pub async fn handle_inbound(&self, frame: &InboundFrame) -> InboundOutcome {
        let envelope = match Envelope::from_json_bytes(&frame.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(transport = %frame.kind, error = %e, "malformed inbound frame");
                return InboundOutcome::Dropped(DropReason::Malformed);
            }
        };

        if let Some(control) = envelope.control_message() {
            if let ControlMessage::Error { code, message } = control {
                warn!(transport = %frame.kind, ?code, message = %message, "error from remote");
            }
            return InboundOutcome::Control(control.clone());
        }
        let Some(content) = envelope.content_payload() else {
            return InboundOutcome::Dropped(DropReason::Malformed);
        };

        if content.target.as_ref().is_some_and(|t| t != self.local_id()) {
            debug!(target = ?content.target, "content addressed elsewhere");
            return InboundOutcome::Dropped(DropReason::NotForUs);
        }
        let sender = &content.device_id;
        if frame.peer.as_ref().is_some_and(|peer| peer != sender) {
            warn!(peer = ?frame.peer, claimed = %sender, "sender does not match link peer");
            return InboundOutcome::Dropped(DropReason::SenderMismatch);
        }

        let device = match self.store.load(sender).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                SyncStats::bump(&self.stats.unknown_senders);
                debug!(sender = %sender, "content from unpaired device dropped");
                return InboundOutcome::Dropped(DropReason::UnknownSender);
            }
            Err(e) => {
                warn!(sender = %sender, error = %e, "trust store lookup failed");
                return InboundOutcome::Dropped(DropReason::UnknownSender);
            }
        };

        let plaintext = match decrypt(
            &content.ciphertext,
            &content.encryption.nonce,
            &content.encryption.tag,
            &device.session_key,
            sender.as_bytes(),
        ) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                SyncStats::bump(&self.stats.decrypt_failures);
                warn!(sender = %sender, transport = %frame.kind, error = %e, "content rejected");
                return InboundOutcome::Dropped(DropReason::DecryptFailed);
            }
        };

        let Some(item) = ContentPlaintext::from_bytes(&plaintext)
            .ok()
            .and_then(|body| body.into_remote_item(sender.clone()))
        else {
            warn!(sender = %sender, "undecodable content body");
            return InboundOutcome::Dropped(DropReason::Malformed);
        };

        if self.seen(sender, &item) {
            SyncStats::bump(&self.stats.duplicates_dropped);
            debug!(sender = %sender, transport = %frame.kind, "duplicate delivery dropped");
            return InboundOutcome::Duplicate {
                from: sender.clone(),
            };
        }
        {
            let mut dedup = self.dedup.lock().unwrap_or_else(|e| e.into_inner());
            dedup.record(self.local_id(), item.fingerprint(), Instant::now());
        }

        self.sink.apply(&item).await;
        SyncStats::bump(&self.stats.applied);
        info!(
            sender = %sender,
            transport = %frame.kind,
            fingerprint = %item.fingerprint().short_hex(),
            "applied remote content"
        );
        InboundOutcome::Applied(item)
    }

    /// Drain `inbound` until every transport has dropped its sender.
    ///
    /// Control messages are forwarded to `controls` when given.
    pub async fn run_inbound(
        &self,
        mut inbound: mpsc::Receiver<InboundFrame>,
        controls: Option<mpsc::Sender<ControlMessage>>,
    ) {
        while let Some(frame) = inbound.recv().await {
            if let InboundOutcome::Control(control) = self.handle_inbound(&frame).await {
                match &controls {
                    Some(tx) => {
                        if let Err(e) = tx.send(control).await {
                            warn!(action = e.0.action(), "control receiver gone, message dropped");
                        }
                    }
                    None => debug!(action = control.action(), "control message ignored"),
                }
            }
        }
        debug!("inbound channel closed");
    }
}
