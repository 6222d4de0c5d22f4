//! Prometheus metrics endpoint.

use crate::server::RelayServer;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Gauges describe current state; counters are monotonic since startup.
pub async fn metrics_handler(Extension(relay): Extension<Arc<RelayServer>>) -> impl IntoResponse {
    let m = relay.metrics().snapshot();
    let connections = relay.session_count();
    let limiter_keys =
        relay.rate_limits().connection_keys_count() + relay.rate_limits().message_keys_count();

    let body = format!(
        r#"# HELP clipsync_relay_connections_active Number of registered devices
# TYPE clipsync_relay_connections_active gauge
clipsync_relay_connections_active {connections}

# HELP clipsync_relay_limiter_keys Number of tracked rate limiter keys
# TYPE clipsync_relay_limiter_keys gauge
clipsync_relay_limiter_keys {limiter_keys}

# HELP clipsync_relay_info Server information
# TYPE clipsync_relay_info gauge
clipsync_relay_info{{version="{version}"}} 1

# HELP clipsync_relay_connections_total Total connections accepted
# TYPE clipsync_relay_connections_total counter
clipsync_relay_connections_total {conns_total}

# HELP clipsync_relay_frames_routed_total Total frame deliveries
# TYPE clipsync_relay_frames_routed_total counter
clipsync_relay_frames_routed_total {frames}

# HELP clipsync_relay_bytes_relayed_total Total payload bytes relayed
# TYPE clipsync_relay_bytes_relayed_total counter
clipsync_relay_bytes_relayed_total {bytes}

# HELP clipsync_relay_rate_limit_hits_total Total rate limit rejections
# TYPE clipsync_relay_rate_limit_hits_total counter
clipsync_relay_rate_limit_hits_total {rate_limits}

# HELP clipsync_relay_protocol_errors_total Total protocol errors
# TYPE clipsync_relay_protocol_errors_total counter
clipsync_relay_protocol_errors_total {errors}
"#,
        version = env!("CARGO_PKG_VERSION"),
        conns_total = m.connections_total,
        frames = m.frames_routed,
        bytes = m.bytes_relayed,
        rate_limits = m.rate_limit_hits,
        errors = m.protocol_errors,
    );

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
