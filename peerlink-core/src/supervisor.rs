//! Keep-alive timer: close silent connections, announce log positions.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::replay;
use crate::service::ApiService;
use crate::LOG_TARGET;

/// How often the keep-alive timer fires.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Seconds an anonymous connection may stay silent.
pub const ANONYMOUS_TIMEOUT: f64 = 60.0;

pub struct LivenessSupervisor {
    service: Arc<ApiService>,
}

impl LivenessSupervisor {
    pub fn new(service: Arc<ApiService>) -> Self {
        Self { service }
    }

    /// Fire every `interval` until the task is aborted.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                self.tick().await;
            }
        })
    }

    /// One timer expiry: liveness sweep, then log position announcements.
    pub async fn tick(&self) {
        self.sweep().await;
        replay::announce_log_positions(&self.service);
    }

    /// Disconnect every connection that has been silent past its timeout.
    /// Returns the number of connections closed.
    pub async fn sweep(&self) -> usize {
        let now = self.service.clock().now();
        let topology = self.service.topology();
        let mut closed = 0;

        for endpoint in topology.endpoints() {
            if topology.is_local_zone(endpoint.zone_name()) {
                continue;
            }
            if endpoint.syncing() || endpoint.keep_alive() <= 0.0 {
                continue;
            }
            let cutoff = now - endpoint.keep_alive();
            for client in endpoint.clients() {
                if client.last_seen() < cutoff {
                    info!(
                        target: LOG_TARGET,
                        endpoint = endpoint.name(),
                        "Closing connection with inactive endpoint '{}'",
                        endpoint.name()
                    );
                    client.disconnect().await;
                    closed += 1;
                }
            }
        }

        let cutoff = now - ANONYMOUS_TIMEOUT;
        for client in self.service.directory().anonymous_clients() {
            if client.last_seen() < cutoff {
                info!(
                    target: LOG_TARGET,
                    identity = client.identity(),
                    "Closing connection with inactive anonymous endpoint '{}'",
                    client.identity()
                );
                client.disconnect().await;
                closed += 1;
            }
        }

        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;

    #[tokio::test]
    async fn closes_silent_foreign_endpoint() {
        let harness = Harness::new();
        let supervisor = LivenessSupervisor::new(harness.service.clone());
        let (conn, _peer) = harness.connection("sat1");

        harness.clock.advance(29.0);
        assert_eq!(supervisor.sweep().await, 0);
        assert!(!conn.is_disconnected());

        harness.clock.advance(2.0);
        assert_eq!(supervisor.sweep().await, 1);
        assert!(conn.is_disconnected());
        assert!(!harness.endpoint("sat1").is_connected());
    }

    #[tokio::test]
    async fn exemptions_local_syncing_and_disabled() {
        let harness = Harness::new();
        let supervisor = LivenessSupervisor::new(harness.service.clone());
        let (local, _p1) = harness.connection("master2");
        let (no_timeout, _p2) = harness.connection("sat2");
        let (syncing, _p3) = harness.connection("sat1");
        harness.endpoint("sat1").set_syncing(true);

        harness.clock.advance(59.0);
        assert_eq!(supervisor.sweep().await, 0);
        assert!(!local.is_disconnected());
        assert!(!no_timeout.is_disconnected());
        assert!(!syncing.is_disconnected());

        harness.endpoint("sat1").set_syncing(false);
        assert_eq!(supervisor.sweep().await, 1);
        assert!(syncing.is_disconnected());
    }

    #[tokio::test]
    async fn recent_traffic_keeps_connection_open() {
        use crate::protocol::Message;
        let harness = Harness::new();
        let supervisor = LivenessSupervisor::new(harness.service.clone());
        let (conn, _peer) = harness.connection("sat1");

        harness.clock.advance(25.0);
        conn.send_message(&Message::notification("event::Heartbeat", serde_json::json!({})))
            .await
            .unwrap();
        harness.clock.advance(25.0);
        assert_eq!(supervisor.sweep().await, 0);
        assert!(!conn.is_disconnected());
    }

    #[tokio::test]
    async fn anonymous_timeout_is_sixty_seconds() {
        let harness = Harness::new();
        let supervisor = LivenessSupervisor::new(harness.service.clone());
        let (anon, _peer) = harness.connection("stranger");

        harness.clock.advance(60.0);
        assert_eq!(supervisor.sweep().await, 0);
        assert!(!anon.is_disconnected());

        harness.clock.advance(0.5);
        assert_eq!(supervisor.sweep().await, 1);
        assert!(anon.is_disconnected());
        assert_eq!(harness.service.directory().anonymous_count(), 0);
    }

    #[tokio::test]
    async fn sweep_continues_past_already_closed_connections() {
        let harness = Harness::new();
        let supervisor = LivenessSupervisor::new(harness.service.clone());
        let (a, pa) = harness.connection("sat1");
        let (b, _pb) = harness.connection("sat1");
        drop(pa);

        harness.clock.advance(31.0);
        assert_eq!(supervisor.sweep().await, 2);
        assert!(a.is_disconnected());
        assert!(b.is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_timer_sweeps_periodically() {
        let harness = Harness::new();
        let (conn, _peer) = harness.connection("stranger");
        let handle = LivenessSupervisor::new(harness.service.clone()).spawn(SWEEP_INTERVAL);

        harness.clock.advance(61.0);
        tokio::time::sleep(SWEEP_INTERVAL * 2).await;
        assert!(conn.is_disconnected());
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_announcement_does_not_stall_sweeps() {
        use crate::protocol::Message;
        let harness = Harness::new();
        let (stuck, _stuck_peer) = harness.connection("sat2");
        harness.endpoint("sat2").advance_remote_log_position(10.0);
        let bulk = Message::notification(
            "event::Bulk",
            serde_json::json!({"body": "x".repeat(200_000)}),
        );
        tokio::spawn(async move { stuck.send_message(&bulk).await });
        tokio::time::sleep(Duration::from_millis(1)).await;

        let (anon, _anon_peer) = harness.connection("stranger");
        let handle = LivenessSupervisor::new(harness.service.clone()).spawn(SWEEP_INTERVAL);
        tokio::time::sleep(SWEEP_INTERVAL).await;

        harness.clock.advance(61.0);
        tokio::time::sleep(SWEEP_INTERVAL * 2).await;
        assert!(anon.is_disconnected());
        handle.abort();
    }
}
