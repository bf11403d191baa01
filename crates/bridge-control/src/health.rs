//! Target health reports from agents

use crate::bridge::Bridge;
use crate::session::SignalConn;
use crate::store::{Store, TaskMode};
use bridge_proto::{BridgeConn, HealthReport};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Apply one report to every task and host `client_id` owns.
///
/// Only tcp tasks take part in task health. Each record is updated under its
/// own pool lock; no registry lock is held here.
pub fn apply_health_report(store: &dyn Store, client_id: i64, report: &HealthReport) {
    let target = report.target.as_str();
    let mut touched = 0usize;

    let tasks = store
        .tasks_of(client_id)
        .into_iter()
        .filter(|t| t.mode == TaskMode::Tcp)
        .map(|t| t.target);
    let hosts = store.hosts_of(client_id).into_iter().map(|h| h.target);

    for record in tasks.chain(hosts) {
        if report.healthy {
            if record.pool.removed_targets().iter().any(|t| t == target) {
                record.pool.mark_healthy(target);
                touched += 1;
            }
        } else if record.target_str.contains(target) {
            record.pool.mark_unhealthy(&record.target_str, target);
            touched += 1;
        }
    }

    if report.healthy {
        debug!(client_id, target = %target, touched, "Target healthy");
    } else {
        info!(client_id, target = %target, touched, "Target unhealthy, removed from rotation");
    }
}

impl Bridge {
    /// Read health reports off a signal connection until it fails or is
    /// closed, then evict the client if that signal is still its current one
    pub(crate) fn spawn_health_monitor<R>(
        &self,
        client_id: i64,
        signal: Arc<SignalConn>,
        mut reader: BridgeConn<R>,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let bridge = self.clone();
        tokio::spawn(async move {
            let closed = signal.closed_token();
            loop {
                let report = tokio::select! {
                    _ = closed.cancelled() => break,
                    report = reader.read_health_report() => report,
                };
                match report {
                    Ok(report) => apply_health_report(bridge.store.as_ref(), client_id, &report),
                    Err(e) => {
                        debug!(client_id, "Signal connection read ended: {}", e);
                        break;
                    }
                }
            }

            if let Some(session) = bridge.sessions.remove_if_signal(client_id, signal.serial()) {
                info!(client_id, "Signal connection lost, evicting client");
                bridge.teardown(client_id, session).await;
            }
        })
    }
}
