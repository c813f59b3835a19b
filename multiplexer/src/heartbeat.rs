use crate::envelope::StreamCommand;
use crate::metrics_defs::HEARTBEAT_ENQUEUE_FAILED;
use crate::registry::NodeRegistry;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Pushes a keepalive onto every known node's queue once per `interval` until
/// shutdown is signalled.
pub async fn run_heartbeat(
    registry: Arc<NodeRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; nobody needs a keepalive at start-up.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => beat(&registry),
            _ = shutdown.wait_for(|stopping| *stopping) => {
                tracing::debug!("heartbeat stopped");
                return;
            }
        }
    }
}

fn beat(registry: &NodeRegistry) {
    for (node_id, queue) in registry.all_queues() {
        match queue.try_enqueue(StreamCommand::keepalive()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                counter!(HEARTBEAT_ENQUEUE_FAILED).increment(1);
                tracing::debug!(node_id = %node_id, "queue full, skipping keepalive");
            }
            // Deregistered between the snapshot and now.
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
