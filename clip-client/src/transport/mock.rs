//! Mock transport for testing.
//!
//! Records every send and can inject per-send delays, failures, and
//! reachability. Clones share state, so a test keeps one handle while the
//! coordinator owns another.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use clipsync_core::{ConnectionEvent, Liveness, PeerConnectionRecord, TransportKind};
use clipsync_types::DeviceId;
use tokio::sync::broadcast;

use super::{Transport, TransportError, EVENT_CHANNEL_CAPACITY};

/// Mock transport for testing.
#[derive(Debug, Clone)]
pub struct MockTransport {
    kind: TransportKind,
    inner: Arc<Mutex<MockTransportInner>>,
    events: broadcast::Sender<ConnectionEvent>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    reach_all: bool,
    reachable: HashSet<DeviceId>,
    delay: Duration,
    fail_all: Option<String>,
    fail_next: Option<String>,
    sent: Vec<(DeviceId, Vec<u8>)>,
}

impl MockTransport {
    /// Create a mock that reaches every peer and never fails.
    pub fn new(kind: TransportKind) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            kind,
            inner: Arc::new(Mutex::new(MockTransportInner {
                reach_all: true,
                ..Default::default()
            })),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockTransportInner> {
        // A panicking test thread must not hide the recorded sends.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Restrict reachability to exactly `peers`.
    pub fn set_reachable(&self, peers: impl IntoIterator<Item = DeviceId>) {
        let mut inner = self.lock();
        inner.reach_all = false;
        inner.reachable = peers.into_iter().collect();
    }

    /// Delay every send by `delay` (on the tokio clock).
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    /// Fail every send with `error` until cleared.
    pub fn fail_sends(&self, error: &str) {
        self.lock().fail_all = Some(error.to_string());
    }

    /// Fail only the next send with `error`.
    pub fn fail_next_send(&self, error: &str) {
        self.lock().fail_next = Some(error.to_string());
    }

    /// Clear injected failures.
    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.fail_all = None;
        inner.fail_next = None;
    }

    /// Every successful send, in order.
    pub fn sent(&self) -> Vec<(DeviceId, Vec<u8>)> {
        self.lock().sent.clone()
    }

    /// Payloads delivered to `peer`.
    pub fn sent_to(&self, peer: &DeviceId) -> Vec<Vec<u8>> {
        self.lock()
            .sent
            .iter()
            .filter(|(to, _)| to == peer)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Publish an event to subscribers.
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn can_reach(&self, peer: &DeviceId) -> bool {
        let inner = self.lock();
        inner.reach_all || inner.reachable.contains(peer)
    }

    async fn send(&self, peer: &DeviceId, payload: &[u8]) -> Result<(), TransportError> {
        let delay = self.lock().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        if !(inner.reach_all || inner.reachable.contains(peer)) {
            return Err(TransportError::PeerUnreachable(peer.clone()));
        }
        if let Some(error) = inner.fail_next.take() {
            return Err(TransportError::SendFailed(error));
        }
        if let Some(error) = &inner.fail_all {
            return Err(TransportError::SendFailed(error.clone()));
        }
        inner.sent.push((peer.clone(), payload.to_vec()));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn records(&self) -> Vec<PeerConnectionRecord> {
        let inner = self.lock();
        let mut peers: Vec<&DeviceId> = inner.reachable.iter().collect();
        peers.sort();
        peers
            .into_iter()
            .map(|peer| {
                let mut record = PeerConnectionRecord::connecting(peer.clone(), self.kind);
                record.set(Liveness::Up);
                record
            })
            .collect()
    }
}
