//! Background cleanup task for idle rate-limiter state.
//!
//! Every device and source address that ever sent a frame leaves a bucket in
//! the keyed limiters. This task periodically evicts buckets that have fully
//! recharged.

use crate::config::CleanupConfig;
use crate::server::RelayServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

/// Spawn a background cleanup task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_task(
    relay: Arc<RelayServer>,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("cleanup task disabled");
            return;
        }

        let interval_secs = config.interval_secs.max(1);
        tracing::info!("cleanup task started (interval: {}s)", interval_secs);

        let mut timer = interval(Duration::from_secs(interval_secs));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        timer.tick().await;

        loop {
            timer.tick().await;
            run_cleanup(&relay);
        }
    })
}

/// One cleanup pass.
pub fn run_cleanup(relay: &RelayServer) {
    let limits = relay.rate_limits();
    let before = limits.connection_keys_count() + limits.message_keys_count();
    limits.shrink();
    let after = limits.connection_keys_count() + limits.message_keys_count();

    if before > after {
        tracing::info!(
            evicted = before - after,
            remaining = after,
            "cleanup: evicted idle limiter keys"
        );
    } else {
        tracing::debug!(remaining = after, "cleanup: nothing to evict");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, LimitsConfig};
    use clipsync_types::DeviceId;

    #[test]
    fn recharged_keys_are_evicted() {
        let config = Config {
            limits: LimitsConfig {
                // One token per millisecond refills any bucket almost instantly.
                messages_per_minute: 60_000,
                burst: 1,
                ..LimitsConfig::default()
            },
            ..Config::default()
        };
        let relay = RelayServer::new(config).unwrap();
        relay
            .rate_limits()
            .check_message(&DeviceId::new("mac").unwrap())
            .unwrap();
        assert_eq!(relay.rate_limits().message_keys_count(), 1);

        std::thread::sleep(Duration::from_millis(20));
        run_cleanup(&relay);

        assert_eq!(relay.rate_limits().message_keys_count(), 0);
    }

    #[tokio::test]
    async fn cleanup_task_disabled() {
        let relay = Arc::new(RelayServer::new(Config::default()).unwrap());
        let config = CleanupConfig {
            interval_secs: 1,
            enabled: false,
        };

        let handle = spawn_cleanup_task(relay, config);

        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("task should complete when disabled")
            .expect("task should not panic");
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_task_keeps_running() {
        let relay = Arc::new(RelayServer::new(Config::default()).unwrap());
        let handle = spawn_cleanup_task(
            relay,
            CleanupConfig {
                interval_secs: 5,
                enabled: true,
            },
        );

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }
}
