//! Rate limiting for clipsync-relay.
//!
//! Three token buckets, all from `governor`:
//! - connection attempts, keyed by source IP
//! - frames, keyed by registered [`DeviceId`]
//! - frames across every device (a single global bucket)
//!
//! Keyed buckets live in a DashMap and are evicted by the cleanup task once
//! they have fully recharged.

use crate::config::{ConfigError, LimitsConfig};
use clipsync_types::DeviceId;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiters for the relay server.
#[derive(Clone)]
pub struct RateLimits {
    connection_limiter: Arc<KeyedLimiter<IpAddr>>,
    message_limiter: Arc<KeyedLimiter<DeviceId>>,
    global_limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("connection_keys", &self.connection_limiter.len())
            .field("message_keys", &self.message_limiter.len())
            .finish_non_exhaustive()
    }
}

fn nonzero(field: &'static str, value: u32) -> Result<NonZeroU32, ConfigError> {
    NonZeroU32::new(value).ok_or(ConfigError::Invalid {
        field,
        reason: "must be greater than zero".into(),
    })
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// The per-device quota refills at `messages_per_minute` and holds at
    /// most `burst` tokens.
    pub fn new(config: &LimitsConfig) -> Result<Self, ConfigError> {
        let per_minute = nonzero("limits.messages_per_minute", config.messages_per_minute)?;
        let burst = nonzero("limits.burst", config.burst)?;
        let message_quota = Quota::per_minute(per_minute).allow_burst(burst);

        let connections = nonzero(
            "limits.connections_per_minute",
            config.connections_per_minute,
        )?;
        let connection_quota = Quota::per_minute(connections);

        let global_rps = nonzero(
            "limits.global_requests_per_second",
            config.global_requests_per_second,
        )?;
        let global_quota = Quota::per_second(global_rps);

        Ok(Self {
            connection_limiter: Arc::new(RateLimiter::keyed(connection_quota)),
            message_limiter: Arc::new(RateLimiter::keyed(message_quota)),
            global_limiter: Arc::new(RateLimiter::direct(global_quota)),
        })
    }

    /// Check if a new connection from `ip` is allowed.
    pub fn check_connection(&self, ip: IpAddr) -> Result<(), RateLimitError> {
        self.connection_limiter
            .check_key(&ip)
            .map_err(|_| RateLimitError::ConnectionLimitExceeded)
    }

    /// Check if `device` may send another frame.
    ///
    /// Consults the global bucket, then the device's own.
    pub fn check_message(&self, device: &DeviceId) -> Result<(), RateLimitError> {
        self.global_limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)?;
        self.message_limiter
            .check_key(device)
            .map_err(|_| RateLimitError::MessageLimitExceeded)
    }

    /// Number of tracked connection keys.
    pub fn connection_keys_count(&self) -> usize {
        self.connection_limiter.len()
    }

    /// Number of tracked device keys.
    pub fn message_keys_count(&self) -> usize {
        self.message_limiter.len()
    }

    /// Evict keys whose buckets have fully recharged.
    pub fn shrink(&self) {
        self.connection_limiter.retain_recent();
        self.message_limiter.retain_recent();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    /// Too many connection attempts from this address.
    ConnectionLimitExceeded,
    /// Too many frames from this device.
    MessageLimitExceeded,
    /// Too many frames across all devices.
    GlobalLimitExceeded,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLimitExceeded => write!(f, "connection rate limit exceeded"),
            Self::MessageLimitExceeded => write!(f, "message rate limit exceeded"),
            Self::GlobalLimitExceeded => write!(f, "global rate limit exceeded"),
        }
    }
}

impl std::error::Error for RateLimitError {}
