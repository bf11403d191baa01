//! Periodic liveness supervision of agent sessions

use crate::bridge::Bridge;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

impl Bridge {
    pub fn spawn_liveness(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move { bridge.run_liveness(shutdown).await })
    }

    /// Run a liveness pass every `liveness_interval` until `shutdown` fires
    pub async fn run_liveness(&self, shutdown: CancellationToken) {
        let period = self.config.liveness_interval.max(Duration::from_millis(100));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Liveness supervisor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.liveness_tick().await;
                }
            }
        }
    }

    /// One pass: count failures, evict clients that reached the retry limit
    /// and drop lapsed IP registrations. Returns the evicted ids.
    pub async fn liveness_tick(&self) -> Vec<i64> {
        let max_retries = self.config.max_liveness_retries;
        let mut evicted = Vec::new();
        for (id, signal_serial) in self.sessions.tick(max_retries) {
            // Skipped if the agent reconnected since the pass above
            let Some(session) = self.sessions.remove_expired(id, signal_serial, max_retries) else {
                debug!(client_id = id, "Client recovered before eviction");
                continue;
            };
            warn!(client_id = id, "Client failed liveness checks, evicting");
            self.teardown_detached(id, session);
            evicted.push(id);
        }

        let purged = self.ip_registry.purge_expired();
        if purged > 0 {
            debug!(purged, "Purged expired IP registrations");
        }
        evicted
    }
}
