//! Status endpoint: who is connected and what the relay has done.

use crate::server::{ConnectedDevice, MetricsSnapshot, RelayServer};
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;

/// Status response.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    /// Registered devices, sorted by id.
    pub devices: Vec<ConnectedDevice>,
    /// Counters since startup.
    pub counters: MetricsSnapshot,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

/// Status handler.
pub async fn status_handler(Extension(relay): Extension<Arc<RelayServer>>) -> Json<RelayStatus> {
    Json(RelayStatus {
        devices: relay.connected_devices(),
        counters: relay.metrics().snapshot(),
        uptime_seconds: relay.uptime_secs(),
    })
}
