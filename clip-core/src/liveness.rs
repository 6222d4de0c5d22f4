//! Connection liveness for clipsync transports.
//!
//! This module provides:
//! - [`PeerConnectionRecord`]: per-peer, per-transport liveness, written only
//!   by the owning transport task
//! - [`ConnectionEvent`]: what transports publish to subscribers
//! - [`ConnectionState`]: a pure reconnect state machine for the relay link
//!
//! The state machine takes events as input and produces a new state plus a
//! list of actions. The relay client in `clipsync-client` performs the I/O.

use std::time::{Duration, Instant};

use clipsync_types::DeviceId;
use serde::{Deserialize, Serialize};

/// Which channel a connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Direct local-network TCP connection.
    Direct,
    /// Relayed connection through the cloud relay.
    Relay,
}

impl TransportKind {
    /// Short name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Direct => "direct",
            TransportKind::Relay => "relay",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    /// Connect or authentication in progress.
    Connecting,
    /// Usable for sends.
    Up,
    /// Closed or failed.
    Down,
}

/// One peer reachable over one transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnectionRecord {
    /// Peer device.
    pub peer: DeviceId,
    /// Transport carrying the connection.
    pub kind: TransportKind,
    /// Current liveness.
    pub liveness: Liveness,
    /// When liveness last changed.
    pub changed_at: Instant,
}

impl PeerConnectionRecord {
    /// A new record in the `Connecting` state.
    pub fn connecting(peer: DeviceId, kind: TransportKind) -> Self {
        Self {
            peer,
            kind,
            liveness: Liveness::Connecting,
            changed_at: Instant::now(),
        }
    }

    /// Move to `liveness`, updating the change time only on a real change.
    pub fn set(&mut self, liveness: Liveness) {
        if self.liveness != liveness {
            self.liveness = liveness;
            self.changed_at = Instant::now();
        }
    }

    /// Whether sends may use this connection.
    pub fn is_up(&self) -> bool {
        self.liveness == Liveness::Up
    }
}

/// Events published by transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A peer became reachable.
    PeerUp {
        /// Peer device.
        peer: DeviceId,
        /// Transport.
        kind: TransportKind,
    },
    /// A peer stopped being reachable.
    PeerDown {
        /// Peer device.
        peer: DeviceId,
        /// Transport.
        kind: TransportKind,
        /// Why it went down.
        reason: String,
    },
    /// A direct connection was rejected during authentication.
    PeerRejected {
        /// Claimed peer id, if the hello got that far.
        peer: Option<DeviceId>,
        /// Why it was rejected.
        reason: String,
    },
    /// The relay link is registered and usable.
    RelayConnected,
    /// The relay link dropped.
    RelayDisconnected {
        /// Why it dropped.
        reason: String,
    },
    /// A relay reconnect attempt failed.
    RelayReconnectFailed {
        /// Which attempt this was.
        attempt: u32,
        /// Failure description.
        error: String,
    },
}

/// Relay link state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected to the relay.
    Disconnected,
    /// TCP connect in progress.
    Connecting,
    /// Connected, sending the register frame.
    Registering,
    /// Registered and usable.
    Connected,
    /// Disconnected, waiting to reconnect.
    Reconnecting {
        /// Number of reconnection attempts so far.
        attempt: u32,
    },
}

impl ConnectionState {
    /// Create a new state machine in the Disconnected state.
    pub fn new() -> Self {
        Self::Disconnected
    }

    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: Event) -> (Self, Vec<Action>) {
        match (self, event) {
            (Self::Disconnected, Event::ConnectRequested) => {
                (Self::Connecting, vec![Action::Connect])
            }

            (Self::Connecting, Event::ConnectSucceeded)
            | (Self::Reconnecting { .. }, Event::ConnectSucceeded) => {
                (Self::Registering, vec![Action::SendRegister])
            }
            (Self::Connecting, Event::ConnectFailed { error })
            | (Self::Registering, Event::RegisterFailed { error }) => (
                Self::Reconnecting { attempt: 1 },
                vec![
                    Action::Emit(ConnectionEvent::RelayReconnectFailed { attempt: 1, error }),
                    Action::StartReconnectTimer {
                        delay: calculate_backoff(1),
                    },
                ],
            ),

            (Self::Registering, Event::Registered) => (
                Self::Connected,
                vec![Action::Emit(ConnectionEvent::RelayConnected)],
            ),

            (Self::Connected, Event::Disconnected { reason }) => (
                Self::Reconnecting { attempt: 1 },
                vec![
                    Action::Emit(ConnectionEvent::RelayDisconnected { reason }),
                    Action::StartReconnectTimer {
                        delay: calculate_backoff(1),
                    },
                ],
            ),

            (Self::Reconnecting { .. }, Event::ReconnectTimer) => {
                (Self::Connecting, vec![Action::Connect])
            }
            (Self::Reconnecting { attempt }, Event::ConnectFailed { error }) => {
                let next_attempt = attempt.saturating_add(1);
                (
                    Self::Reconnecting {
                        attempt: next_attempt,
                    },
                    vec![
                        Action::Emit(ConnectionEvent::RelayReconnectFailed {
                            attempt: next_attempt,
                            error,
                        }),
                        Action::StartReconnectTimer {
                            delay: calculate_backoff(next_attempt),
                        },
                    ],
                )
            }

            (Self::Reconnecting { .. }, Event::DisconnectRequested) => {
                (Self::Disconnected, vec![Action::CancelReconnect])
            }
            (Self::Connected, Event::DisconnectRequested)
            | (Self::Registering, Event::DisconnectRequested)
            | (Self::Connecting, Event::DisconnectRequested) => (
                Self::Disconnected,
                vec![
                    Action::Disconnect,
                    Action::Emit(ConnectionEvent::RelayDisconnected {
                        reason: "shutdown requested".into(),
                    }),
                ],
            ),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if currently trying to connect.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Registering | Self::Reconnecting { .. }
        )
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Inputs to the relay link state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Start connecting.
    ConnectRequested,
    /// TCP connect succeeded.
    ConnectSucceeded,
    /// TCP connect failed.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Register frame written.
    Registered,
    /// Register frame could not be written.
    RegisterFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// The connection was lost.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
    /// Shutdown requested.
    DisconnectRequested,
    /// Reconnect timer fired.
    ReconnectTimer,
}

/// Actions for the relay client to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the TCP connection.
    Connect,
    /// Send the register control frame.
    SendRegister,
    /// Close the connection.
    Disconnect,
    /// Schedule a reconnect.
    StartReconnectTimer {
        /// Delay before attempting reconnection.
        delay: Duration,
    },
    /// Cancel any pending reconnect timer.
    CancelReconnect,
    /// Publish an event to subscribers.
    Emit(ConnectionEvent),
}

/// Reconnect backoff: min(30s, 2^attempt seconds) + random(0..=5000ms).
///
/// The jitter spreads out reconnects after a relay restart.
pub fn calculate_backoff(attempt: u32) -> Duration {
    let base_secs = 2u64.pow(attempt.min(5)).min(30);
    Duration::from_secs(base_secs) + Duration::from_millis(random_jitter_ms())
}

fn random_jitter_ms() -> u64 {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    u64::from_le_bytes(bytes) % 5001
}
