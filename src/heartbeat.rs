//! # Liveness Monitor
//!
//! Two-strike heartbeat over every tracked connection. Each tick, a connection that
//! did not answer the previous probe is terminated; every other connection is marked
//! unanswered and probed again. Any liveness response (protocol pong, or an
//! application-level `ping`/`pong` message) marks it alive.
//!
//! A connection that stops answering is therefore reaped within two intervals.

use crate::hub::{ClientCommand, ConnectionId, Hub, SharedHub};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl Hub {
    /// Record a liveness response from `id`.
    pub fn mark_alive(&mut self, id: ConnectionId) {
        if let Some(entry) = self.connections.get_mut(&id) {
            entry.alive = true;
            entry.probe_sent = None;
        }
    }

    pub fn is_alive(&self, id: ConnectionId) -> bool {
        self.connections.get(&id).is_some_and(|entry| entry.alive)
    }

    /// One heartbeat pass. Returns the connections that were reaped.
    pub fn sweep_liveness(&mut self) -> Vec<ConnectionId> {
        let now = Instant::now();
        let mut dead = Vec::new();
        for (id, entry) in self.connections.iter_mut() {
            if !entry.alive {
                dead.push(*id);
                continue;
            }
            entry.alive = false;
            entry.probe_sent = Some(now);
            if let Err(e) = entry.sink.push(ClientCommand::Probe) {
                debug!(conn_id = %id, error = %e, "Probe undeliverable");
                dead.push(*id);
            }
        }

        for id in &dead {
            warn!(conn_id = %id, "Connection missed heartbeat, terminating");
            self.push(*id, ClientCommand::Terminate);
            self.disconnect(*id);
        }
        dead
    }
}

/// Drive `sweep_liveness` every `interval` until cancelled.
pub async fn run_heartbeat(hub: SharedHub, interval: Duration, cancel_token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    info!(interval_secs = interval.as_secs(), "Heartbeat started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reaped = hub.lock().sweep_liveness();
                if !reaped.is_empty() {
                    info!(reaped = reaped.len(), "Heartbeat reaped dead connections");
                }
            }
            _ = cancel_token.cancelled() => {
                info!("Heartbeat received shutdown signal, exiting");
                break;
            }
        }
    }
}
