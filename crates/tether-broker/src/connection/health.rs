//! Connection health monitoring
//!
//! Sends heartbeats on an interval and tears down tunnels whose last
//! acknowledgment is older than the timeout. Tunnel loss detected here
//! goes through the same unregister path as an explicit close, so
//! in-flight operations fail with a connectivity error and their
//! concurrency slots are released.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::connection::{AgentCommand, ConnectionManager, ConnectionPool};

/// Monitors tunnel health via heartbeats
pub struct HealthMonitor {
    pool: Arc<ConnectionPool>,
    manager: Arc<ConnectionManager>,
    /// Heartbeat interval
    interval: Duration,
    /// Age after which a silent tunnel is considered dead
    timeout: Duration,
}

impl HealthMonitor {
    /// Create a new health monitor
    pub fn new(
        pool: Arc<ConnectionPool>,
        manager: Arc<ConnectionManager>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            pool,
            manager,
            interval,
            timeout,
        }
    }

    /// Run the monitor until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        tracing::info!(
            "Health monitor started (interval: {:?}, timeout: {:?})",
            self.interval,
            self.timeout
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Health monitor shutting down");
                    break;
                }
            }
        }
    }

    /// One heartbeat round: ping every tunnel, reap the silent ones
    async fn sweep(&self) {
        let timeout_ms = self.timeout.as_millis() as u64;

        for handle in self.pool.list() {
            if handle.heartbeat_age_millis() > timeout_ms {
                tracing::warn!(
                    "Machine {} missed heartbeats for {}ms, dropping tunnel",
                    handle.machine_id,
                    handle.heartbeat_age_millis()
                );
                self.manager.unregister(&handle.machine_id);
                continue;
            }

            let ping = AgentCommand::Heartbeat {
                timestamp: tether_core::time::current_time_millis(),
            };
            if handle.command_tx.try_send(ping).is_err() {
                tracing::warn!(
                    "Machine {} command channel unavailable, dropping tunnel",
                    handle.machine_id
                );
                self.manager.unregister(&handle.machine_id);
            }
        }
    }
}
