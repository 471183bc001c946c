use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::audit::{self, SharedAudit};
use crate::engine::Engine;

/// Spawn the fault detector: a periodic sweep that evicts workers with
/// stale heartbeats and re-enqueues their work units. The audit counter
/// writes happen here, after the engine has released its lock.
pub fn spawn(engine: Arc<Engine>, audit: SharedAudit, sweep_interval: Duration) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(sweep_interval);
    // The first tick fires immediately; skip it so a fresh server does not
    // sweep before any heartbeat could exist.
    ticker.tick().await;
    loop {
      ticker.tick().await;
      for event in engine.sweep_stale().await {
        warn!(
          customer_id = %event.customer_id,
          worker_id = %event.worker_id,
          "worker heartbeat stalled, work unit re-enqueued"
        );
        audit::task_stalled(&audit, event.worker_id);
      }
    }
  })
}
