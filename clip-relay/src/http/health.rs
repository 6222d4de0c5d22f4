//! Health check endpoint.

use crate::server::RelayServer;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Overall status.
    pub status: &'static str,
    /// Server version.
    pub version: &'static str,
    /// Number of registered devices.
    pub connections: usize,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

/// Health check handler.
pub async fn health_handler(Extension(relay): Extension<Arc<RelayServer>>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: relay.session_count(),
        uptime_seconds: relay.uptime_secs(),
    })
}
