//! HTTP endpoints for clipsync-relay.
//!
//! Provides health, status and metrics endpoints.

pub mod health;
mod metrics;
pub mod status;

use crate::server::RelayServer;
use axum::{routing::get, Extension, Router};
use std::sync::Arc;

pub use health::HealthStatus;
pub use status::RelayStatus;

/// Build the HTTP router with all endpoints.
///
/// `/metrics` is only mounted when `http.metrics_enabled` is set.
pub fn build_router(relay: Arc<RelayServer>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health::health_handler))
        .route("/status", get(status::status_handler));
    if relay.config().http.metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }
    router.layer(Extension(relay))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use clipsync_types::DeviceId;
    use tokio::sync::mpsc;
    use tower::util::ServiceExt;

    fn test_relay(config: Config) -> Arc<RelayServer> {
        Arc::new(RelayServer::new(config).unwrap())
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn health_endpoint_reports_connections() {
        let relay = test_relay(Config::default());
        let (tx, _rx) = mpsc::channel(1);
        relay.register(DeviceId::new("mac").unwrap(), None, tx, false).unwrap();

        let (status, body) = get_body(build_router(relay), "/health").await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"], 1);
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn status_endpoint_lists_devices() {
        let relay = test_relay(Config::default());
        let (a, _ra) = mpsc::channel(1);
        let (b, _rb) = mpsc::channel(1);
        relay.register(DeviceId::new("pixel").unwrap(), Some("Pixel 8".into()), a, false).unwrap();
        relay.register(DeviceId::new("mac").unwrap(), None, b, false).unwrap();

        let (status, body) = get_body(build_router(relay), "/status").await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["devices"][0]["device_id"], "mac");
        assert_eq!(json["devices"][1]["device_name"], "Pixel 8");
        assert_eq!(json["counters"]["frames_routed"], 0);
    }

    #[tokio::test]
    async fn metrics_endpoint_is_prometheus_text() {
        let relay = test_relay(Config::default());

        let (status, body) = get_body(build_router(relay), "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("# TYPE clipsync_relay_connections_active gauge"));
        assert!(body.contains("clipsync_relay_frames_routed_total 0"));
        assert!(body.contains("clipsync_relay_rate_limit_hits_total 0"));
    }

    #[tokio::test]
    async fn metrics_can_be_disabled() {
        let mut config = Config::default();
        config.http.metrics_enabled = false;

        let (status, _) = get_body(build_router(test_relay(config)), "/metrics").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
