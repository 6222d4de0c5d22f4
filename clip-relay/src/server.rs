//! Main RelayServer coordination.
//!
//! RelayServer owns the session registry, the rate limiters and the
//! operational counters. Sessions register an outbound channel under their
//! device id; routing looks the target up and hands it the already-framed
//! bytes. The relay never parses ciphertext.

use crate::config::Config;
use crate::error::{ProtocolError, RelayError};
use crate::limits::RateLimits;
use crate::session::Session;
use clipsync_types::DeviceId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

/// An encoded frame (length prefix included), shared between recipients.
pub type Frame = Arc<[u8]>;

/// Operational metrics for monitoring relay activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Total connections accepted.
    pub connections_total: AtomicU64,
    /// Total frame deliveries (one per recipient).
    pub frames_routed: AtomicU64,
    /// Total payload bytes handed to recipients.
    pub bytes_relayed: AtomicU64,
    /// Total rate limit rejections (connection, device and global).
    pub rate_limit_hits: AtomicU64,
    /// Total protocol errors (bad frames, spoofed senders, late register).
    pub protocol_errors: AtomicU64,
}

/// Point-in-time copy of [`RelayMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Total connections accepted.
    pub connections_total: u64,
    /// Total frame deliveries.
    pub frames_routed: u64,
    /// Total payload bytes relayed.
    pub bytes_relayed: u64,
    /// Total rate limit rejections.
    pub rate_limit_hits: u64,
    /// Total protocol errors.
    pub protocol_errors: u64,
}

impl RelayMetrics {
    /// Read every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            frames_routed: self.frames_routed.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Outcome of routing one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Handed to this many sessions.
    Delivered(usize),
    /// The addressed device has no session.
    TargetOffline(DeviceId),
}

/// A connected device, as shown by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectedDevice {
    /// Canonical device id.
    pub device_id: DeviceId,
    /// Name announced at registration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// Unix seconds when the session registered.
    pub connected_at: u64,
}

/// What a session receives back from [`RelayServer::register`].
#[derive(Debug)]
pub struct Registration {
    /// Identifies this registration when unregistering.
    pub token: u64,
    /// Flips to `true` when a forced registration takes over the device id.
    pub replaced: watch::Receiver<bool>,
}

#[derive(Debug)]
struct SessionEntry {
    token: u64,
    outbound: mpsc::Sender<Frame>,
    replaced: watch::Sender<bool>,
    device_name: Option<String>,
    connected_at: u64,
}

/// Main relay server.
pub struct RelayServer {
    config: Config,
    rate_limits: RateLimits,
    metrics: RelayMetrics,
    sessions: DashMap<DeviceId, SessionEntry>,
    next_token: AtomicU64,
    started: Instant,
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("config", &self.config)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .field("sessions_count", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl RelayServer {
    /// Create a relay from a validated configuration.
    pub fn new(config: Config) -> Result<Self, RelayError> {
        config.validate()?;
        let rate_limits = RateLimits::new(&config.limits)?;
        Ok(Self {
            config,
            rate_limits,
            metrics: RelayMetrics::default(),
            sessions: DashMap::new(),
            next_token: AtomicU64::new(1),
            started: Instant::now(),
        })
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Seconds since the relay was created.
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Bind `device_id` to a session's outbound channel.
    ///
    /// A live session for the same id is kept and the new one rejected,
    /// unless `force` is set: then the previous session is told it was
    /// replaced and loses its routing entry immediately.
    pub fn register(
        &self,
        device_id: DeviceId,
        device_name: Option<String>,
        outbound: mpsc::Sender<Frame>,
        force: bool,
    ) -> Result<Registration, ProtocolError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (replaced_tx, replaced_rx) = watch::channel(false);
        let entry = SessionEntry {
            token,
            outbound,
            replaced: replaced_tx,
            device_name,
            connected_at: unix_secs(),
        };

        match self.sessions.entry(device_id.clone()) {
            Entry::Occupied(_) if !force => {
                tracing::warn!(device = %device_id, "duplicate registration rejected");
                return Err(ProtocolError::AlreadyRegistered(device_id));
            }
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(entry);
                let _ = previous.replaced.send(true);
                tracing::info!(device = %device_id, "session replaced by forced registration");
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        tracing::debug!(
            device = %device_id,
            token,
            total = self.sessions.len(),
            "registered session"
        );

        Ok(Registration {
            token,
            replaced: replaced_rx,
        })
    }

    /// Remove `device_id` if it is still held by `token`.
    ///
    /// Returns `false` when a newer registration owns the id, which is then
    /// left untouched.
    pub fn unregister(&self, device_id: &DeviceId, token: u64) -> bool {
        let removed = self
            .sessions
            .remove_if(device_id, |_, entry| entry.token == token)
            .is_some();
        if removed {
            tracing::debug!(device = %device_id, token, "unregistered session");
        }
        removed
    }

    /// Whether `device_id` has a live session.
    pub fn is_connected(&self, device_id: &DeviceId) -> bool {
        self.sessions.contains_key(device_id)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Live sessions, sorted by device id.
    pub fn connected_devices(&self) -> Vec<ConnectedDevice> {
        let mut devices: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| ConnectedDevice {
                device_id: entry.key().clone(),
                device_name: entry.value().device_name.clone(),
                connected_at: entry.value().connected_at,
            })
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    /// Forward a frame from `sender`.
    ///
    /// With a target the frame goes only there; without one it goes to every
    /// other session. A recipient whose queue is full loses the frame.
    pub fn route(
        &self,
        sender: &DeviceId,
        target: Option<&DeviceId>,
        frame: Frame,
        payload_len: usize,
    ) -> Route {
        let delivered = match target {
            Some(target) => {
                let Some(entry) = self.sessions.get(target) else {
                    return Route::TargetOffline(target.clone());
                };
                usize::from(self.deliver(target, &entry.outbound, frame))
            }
            None => {
                let recipients: Vec<(DeviceId, mpsc::Sender<Frame>)> = self
                    .sessions
                    .iter()
                    .filter(|entry| entry.key() != sender)
                    .map(|entry| (entry.key().clone(), entry.value().outbound.clone()))
                    .collect();
                recipients
                    .iter()
                    .filter(|(device, outbound)| self.deliver(device, outbound, frame.clone()))
                    .count()
            }
        };

        self.metrics
            .frames_routed
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.metrics
            .bytes_relayed
            .fetch_add((delivered * payload_len) as u64, Ordering::Relaxed);
        Route::Delivered(delivered)
    }

    fn deliver(&self, device: &DeviceId, outbound: &mpsc::Sender<Frame>, frame: Frame) -> bool {
        match outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(device = %device, "outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(device = %device, "session closing, dropping frame");
                false
            }
        }
    }

    /// Accept device connections until `shutdown` flips to `true`.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), RelayError> {
        tracing::info!(addr = %listener.local_addr()?, "relay listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = self.rate_limits.check_connection(peer.ip()) {
                        RelayMetrics::incr(&self.metrics.rate_limit_hits);
                        tracing::warn!(peer = %peer, error = %e, "rejecting connection");
                        continue;
                    }
                    RelayMetrics::incr(&self.metrics.connections_total);
                    let relay = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Session::new(relay, stream, peer).run().await {
                            tracing::debug!(peer = %peer, error = %e, "session ended");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    tracing::info!("relay listener stopping");
                    return Ok(());
                }
            }
        }
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> DeviceId {
        DeviceId::new(s).unwrap()
    }

    fn relay() -> RelayServer {
        RelayServer::new(Config::default()).unwrap()
    }

    fn frame(bytes: &[u8]) -> Frame {
        Arc::from(bytes)
    }

    #[test]
    fn register_and_unregister_session() {
        let relay = relay();
        let (tx, _rx) = mpsc::channel(4);

        let registration = relay
            .register(id("mac"), Some("MacBook".into()), tx, false)
            .unwrap();
        assert!(relay.is_connected(&id("macos-MAC")));
        assert_eq!(relay.session_count(), 1);

        assert!(relay.unregister(&id("mac"), registration.token));
        assert_eq!(relay.session_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_registration_keeps_live_session() {
        let relay = relay();
        let (old_tx, mut old_rx) = mpsc::channel(4);
        let (new_tx, _new_rx) = mpsc::channel(4);

        let old = relay.register(id("mac"), None, old_tx, false).unwrap();
        let result = relay.register(id("macos-mac"), None, new_tx, false);

        assert!(matches!(result, Err(ProtocolError::AlreadyRegistered(ref d)) if *d == id("mac")));
        assert!(!*old.replaced.borrow());
        assert_eq!(relay.session_count(), 1);

        relay.route(&id("pixel"), Some(&id("mac")), frame(b"still here"), 10);
        assert_eq!(&*old_rx.recv().await.unwrap(), b"still here");
    }

    #[test]
    fn stale_unregister_keeps_newer_session() {
        let relay = relay();
        let (old_tx, _old_rx) = mpsc::channel(4);
        let (new_tx, _new_rx) = mpsc::channel(4);

        let old = relay.register(id("mac"), None, old_tx, false).unwrap();
        let new = relay.register(id("mac"), None, new_tx, true).unwrap();

        assert!(*old.replaced.borrow());
        assert!(!*new.replaced.borrow());
        assert!(!relay.unregister(&id("mac"), old.token));
        assert!(relay.is_connected(&id("mac")));
        assert!(relay.unregister(&id("mac"), new.token));
    }

    #[tokio::test]
    async fn targeted_route_reaches_only_target() {
        let relay = relay();
        let (mac_tx, mut mac_rx) = mpsc::channel(4);
        let (pixel_tx, mut pixel_rx) = mpsc::channel(4);
        relay.register(id("mac"), None, mac_tx, false).unwrap();
        relay.register(id("pixel"), None, pixel_tx, false).unwrap();

        let route = relay.route(&id("mac"), Some(&id("pixel")), frame(b"hi"), 2);

        assert_eq!(route, Route::Delivered(1));
        assert_eq!(&*pixel_rx.recv().await.unwrap(), b"hi");
        assert!(mac_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn untargeted_route_skips_sender() {
        let relay = relay();
        let (mac_tx, mut mac_rx) = mpsc::channel(4);
        let (pixel_tx, mut pixel_rx) = mpsc::channel(4);
        let (ipad_tx, mut ipad_rx) = mpsc::channel(4);
        relay.register(id("mac"), None, mac_tx, false).unwrap();
        relay.register(id("pixel"), None, pixel_tx, false).unwrap();
        relay.register(id("ipad"), None, ipad_tx, false).unwrap();

        let route = relay.route(&id("mac"), None, frame(b"all"), 3);

        assert_eq!(route, Route::Delivered(2));
        assert_eq!(&*pixel_rx.recv().await.unwrap(), b"all");
        assert_eq!(&*ipad_rx.recv().await.unwrap(), b"all");
        assert!(mac_rx.try_recv().is_err());

        let snapshot = relay.metrics().snapshot();
        assert_eq!(snapshot.frames_routed, 2);
        assert_eq!(snapshot.bytes_relayed, 6);
    }

    #[test]
    fn offline_target_is_reported() {
        let relay = relay();
        let (tx, _rx) = mpsc::channel(4);
        relay.register(id("mac"), None, tx, false).unwrap();

        let route = relay.route(&id("mac"), Some(&id("pixel")), frame(b"x"), 1);

        assert_eq!(route, Route::TargetOffline(id("pixel")));
        assert_eq!(relay.metrics().snapshot().frames_routed, 0);
    }

    #[test]
    fn full_queue_drops_frame() {
        let relay = relay();
        let (tx, _rx) = mpsc::channel(1);
        relay.register(id("pixel"), None, tx, false).unwrap();

        assert_eq!(
            relay.route(&id("mac"), Some(&id("pixel")), frame(b"1"), 1),
            Route::Delivered(1)
        );
        assert_eq!(
            relay.route(&id("mac"), Some(&id("pixel")), frame(b"2"), 1),
            Route::Delivered(0)
        );
    }

    #[test]
    fn connected_devices_are_sorted() {
        let relay = relay();
        let (a, _ra) = mpsc::channel(1);
        let (b, _rb) = mpsc::channel(1);
        relay.register(id("pixel"), Some("Pixel".into()), a, false).unwrap();
        relay.register(id("ipad"), None, b, false).unwrap();

        let devices = relay.connected_devices();
        let ids: Vec<_> = devices.iter().map(|d| d.device_id.as_str()).collect();
        assert_eq!(ids, vec!["ipad", "pixel"]);
        assert_eq!(devices[1].device_name.as_deref(), Some("Pixel"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = Config::default();
        config.limits.messages_per_minute = 0;
        assert!(RelayServer::new(config).is_err());
    }
}
