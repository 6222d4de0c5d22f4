//! Dual-send over the direct and relay transports.
//!
//! Each send launches one leg per viable transport at the same time. The
//! relay leg runs in its own task and is never cancelled by the caller; the
//! direct leg is bounded by a short timeout so a dead LAN link cannot hold up
//! the result. The send succeeds if either leg succeeds. Only when both fail
//! does the caller see an error, and then it carries both causes.

use std::sync::Arc;
use std::time::Duration;

use clipsync_core::TransportKind;
use clipsync_types::DeviceId;
use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::transport::{Transport, TransportError};

/// Default budget for the direct leg.
pub const DEFAULT_DIRECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Every leg of a dual-send failed.
#[derive(Debug, Error)]
pub enum DualSendError {
    /// Neither transport delivered the frame.
    #[error("all transports failed for {peer}: direct: {direct}; relay: {relay}")]
    AllFailed {
        /// Target peer.
        peer: DeviceId,
        /// Direct leg failure (or why it was not attempted).
        direct: TransportError,
        /// Relay leg failure (or why it was not attempted).
        relay: TransportError,
    },
}

/// A successful dual-send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Target peer.
    pub peer: DeviceId,
    /// Transports that accepted the frame.
    pub via: Vec<TransportKind>,
}

/// Per-peer results of a broadcast.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Peers reached on at least one transport.
    pub delivered: Vec<Delivery>,
    /// Peers no transport reached.
    pub failed: Vec<DualSendError>,
}

impl BroadcastReport {
    /// Whether at least one peer was reached.
    pub fn any_delivered(&self) -> bool {
        !self.delivered.is_empty()
    }
}

/// Sends each frame over every viable transport concurrently.
#[derive(Clone)]
pub struct FallbackCoordinator {
    direct: Option<Arc<dyn Transport>>,
    relay: Option<Arc<dyn Transport>>,
    direct_timeout: Duration,
    last_success: Arc<DashMap<DeviceId, TransportKind>>,
}

impl FallbackCoordinator {
    /// Create a coordinator. Either transport may be absent.
    pub fn new(direct: Option<Arc<dyn Transport>>, relay: Option<Arc<dyn Transport>>) -> Self {
        Self {
            direct,
            relay,
            direct_timeout: DEFAULT_DIRECT_TIMEOUT,
            last_success: Arc::new(DashMap::new()),
        }
    }

    /// Set the direct leg timeout.
    pub fn with_direct_timeout(mut self, timeout: Duration) -> Self {
        self.direct_timeout = timeout;
        self
    }

    /// The transport that most recently delivered to `peer`.
    ///
    /// Informational only; both transports are still tried on every send.
    pub fn last_success(&self, peer: &DeviceId) -> Option<TransportKind> {
        self.last_success.get(peer).map(|kind| *kind)
    }

    /// Deliver `payload` to `peer` over every viable transport.
    pub async fn send(&self, peer: &DeviceId, payload: Arc<[u8]>) -> Result<Delivery, DualSendError> {
        let relay_leg = self
            .relay
            .as_ref()
            .filter(|relay| relay.can_reach(peer))
            .map(|relay| {
                let relay = relay.clone();
                let peer = peer.clone();
                let payload = payload.clone();
                tokio::spawn(async move { relay.send(&peer, &payload).await })
            });

        let direct_result = match self.direct.as_ref().filter(|direct| direct.can_reach(peer)) {
            Some(direct) => {
                match tokio::time::timeout(self.direct_timeout, direct.send(peer, &payload)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout),
                }
            }
            None => Err(TransportError::PeerUnreachable(peer.clone())),
        };

        let relay_result = match relay_leg {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                Err(TransportError::SendFailed(format!("relay task failed: {e}")))
            }),
            None => Err(TransportError::PeerUnreachable(peer.clone())),
        };

        let mut via = Vec::with_capacity(2);
        match direct_result {
            Ok(()) => via.push(TransportKind::Direct),
            Err(ref e) => debug!(peer = %peer, error = %e, "direct leg failed"),
        }
        match relay_result {
            Ok(()) => via.push(TransportKind::Relay),
            Err(ref e) => debug!(peer = %peer, error = %e, "relay leg failed"),
        }

        match (direct_result, relay_result) {
            (Err(direct), Err(relay)) => {
                warn!(peer = %peer, "all transports failed");
                Err(DualSendError::AllFailed {
                    peer: peer.clone(),
                    direct,
                    relay,
                })
            }
            _ => {
                self.last_success.insert(peer.clone(), via[0]);
                Ok(Delivery {
                    peer: peer.clone(),
                    via,
                })
            }
        }
    }

    /// Dual-send one frame per peer, all peers concurrently.
    pub async fn broadcast(&self, frames: Vec<(DeviceId, Vec<u8>)>) -> BroadcastReport {
        let mut tasks = JoinSet::new();
        for (peer, payload) in frames {
            let this = self.clone();
            let payload: Arc<[u8]> = payload.into();
            tasks.spawn(async move { this.send(&peer, payload).await });
        }

        let mut report = BroadcastReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(delivery)) => report.delivered.push(delivery),
                Ok(Err(failure)) => report.failed.push(failure),
                Err(e) => warn!(error = %e, "broadcast task failed"),
            }
        }
        report.delivered.sort_by(|a, b| a.peer.cmp(&b.peer));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn id(s: &str) -> DeviceId {
        DeviceId::new(s).unwrap()
    }

    fn setup() -> (MockTransport, MockTransport, FallbackCoordinator) {
        let direct = MockTransport::new(TransportKind::Direct);
        let relay = MockTransport::new(TransportKind::Relay);
        let coordinator = FallbackCoordinator::new(
            Some(Arc::new(direct.clone())),
            Some(Arc::new(relay.clone())),
        );
        (direct, relay, coordinator)
    }

    fn payload(bytes: &[u8]) -> Arc<[u8]> {
        Arc::from(bytes)
    }

    // ===========================================
    // Single Peer
    // ===========================================

    #[tokio::test]
    async fn both_legs_succeed() {
        let (direct, relay, coordinator) = setup();

        let delivery = coordinator.send(&id("pixel"), payload(b"x")).await.unwrap();

        assert_eq!(delivery.via, vec![TransportKind::Direct, TransportKind::Relay]);
        assert_eq!(direct.sent().len(), 1);
        assert_eq!(relay.sent().len(), 1);
        assert_eq!(coordinator.last_success(&id("pixel")), Some(TransportKind::Direct));
    }

    #[tokio::test]
    async fn failed_direct_is_absorbed_by_relay() {
        let (direct, _relay, coordinator) = setup();
        direct.fail_sends("connection reset");

        let delivery = coordinator.send(&id("pixel"), payload(b"x")).await.unwrap();

        assert_eq!(delivery.via, vec![TransportKind::Relay]);
        assert_eq!(coordinator.last_success(&id("pixel")), Some(TransportKind::Relay));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_direct_times_out_without_blocking_relay() {
        let (direct, relay, coordinator) = setup();
        direct.set_delay(Duration::from_secs(60));

        let start = tokio::time::Instant::now();
        let delivery = coordinator.send(&id("pixel"), payload(b"x")).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(delivery.via, vec![TransportKind::Relay]);
        assert!(elapsed >= DEFAULT_DIRECT_TIMEOUT);
        assert!(elapsed < Duration::from_secs(60));
        assert_eq!(relay.sent().len(), 1);
        assert!(direct.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn direct_timeout_is_configurable() {
        let (direct, _relay, coordinator) = setup();
        let coordinator = coordinator.with_direct_timeout(Duration::from_millis(500));
        direct.set_delay(Duration::from_secs(1));

        let start = tokio::time::Instant::now();
        coordinator.send(&id("pixel"), payload(b"x")).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn both_failures_surface_together() {
        let (direct, relay, coordinator) = setup();
        direct.fail_sends("lan down");
        relay.fail_sends("relay down");

        let err = coordinator.send(&id("pixel"), payload(b"x")).await.unwrap_err();

        let DualSendError::AllFailed { peer, direct, relay } = &err;
        assert_eq!(peer, &id("pixel"));
        assert!(direct.to_string().contains("lan down"));
        assert!(relay.to_string().contains("relay down"));
        assert!(coordinator.last_success(&id("pixel")).is_none());
    }

    #[tokio::test]
    async fn unreachable_transport_is_skipped() {
        let (direct, relay, coordinator) = setup();
        direct.set_reachable(Vec::<DeviceId>::new());

        let delivery = coordinator.send(&id("pixel"), payload(b"x")).await.unwrap();

        assert_eq!(delivery.via, vec![TransportKind::Relay]);
        assert_eq!(relay.sent().len(), 1);
    }

    #[tokio::test]
    async fn relay_only_coordinator() {
        let relay = MockTransport::new(TransportKind::Relay);
        let coordinator = FallbackCoordinator::new(None, Some(Arc::new(relay.clone())));

        let delivery = coordinator.send(&id("pixel"), payload(b"x")).await.unwrap();
        assert_eq!(delivery.via, vec![TransportKind::Relay]);
    }

    #[tokio::test]
    async fn last_success_does_not_pin_a_transport() {
        let (direct, relay, coordinator) = setup();
        direct.fail_next_send("blip");

        coordinator.send(&id("pixel"), payload(b"1")).await.unwrap();
        assert_eq!(coordinator.last_success(&id("pixel")), Some(TransportKind::Relay));

        coordinator.send(&id("pixel"), payload(b"2")).await.unwrap();
        assert_eq!(direct.sent().len(), 1);
        assert_eq!(relay.sent().len(), 2);
        assert_eq!(coordinator.last_success(&id("pixel")), Some(TransportKind::Direct));
    }

    // ===========================================
    // Broadcast
    // ===========================================

    #[tokio::test]
    async fn broadcast_reports_per_peer() {
        let (direct, relay, coordinator) = setup();
        direct.set_reachable([id("mac")]);
        relay.set_reachable([id("pixel")]);

        let report = coordinator
            .broadcast(vec![
                (id("mac"), b"m".to_vec()),
                (id("pixel"), b"p".to_vec()),
                (id("ipad"), b"i".to_vec()),
            ])
            .await;

        assert!(report.any_delivered());
        let reached: Vec<_> = report.delivered.iter().map(|d| d.peer.clone()).collect();
        assert_eq!(reached, vec![id("mac"), id("pixel")]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(direct.sent_to(&id("mac")), vec![b"m".to_vec()]);
        assert_eq!(relay.sent_to(&id("pixel")), vec![b"p".to_vec()]);
    }

    #[tokio::test]
    async fn empty_broadcast_is_empty_report() {
        let (_direct, _relay, coordinator) = setup();
        let report = coordinator.broadcast(Vec::new()).await;
        assert!(!report.any_delivered());
        assert!(report.failed.is_empty());
    }
}
