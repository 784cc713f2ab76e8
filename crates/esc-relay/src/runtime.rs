//! Timer-driven loop around [`DeliveryWorker`].

use crate::metrics;
use crate::worker::DeliveryWorker;
use crate::RelayConfig;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

pub struct RelayRuntimeHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayRuntimeHandle {
    /// Stops scheduling passes and waits up to `grace` for an in-flight pass.
    /// Returns `false` if the pass had to be abandoned.
    pub async fn shutdown(self, grace: Duration) -> bool {
        let _ = self.shutdown.send(true);
        let abort = self.task.abort_handle();
        match tokio::time::timeout(grace, self.task).await {
            Ok(_) => {
                info!(event = "relay_runtime_stopped");
                true
            }
            Err(_) => {
                warn!(event = "relay_runtime_grace_expired", grace_ms = grace.as_millis() as u64);
                abort.abort();
                false
            }
        }
    }
}

/// Spawns the polling loop. Passes run inline in the loop, so a slow pass
/// delays the next tick instead of stacking up behind it.
pub fn spawn_relay_runtime(worker: Arc<DeliveryWorker>, config: &RelayConfig) -> RelayRuntimeHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let poll_every = Duration::from_millis(config.poll_interval_ms.max(1));
    let compact_every = Duration::from_millis(config.compaction_interval_ms.max(1));
    let retention_days = config.retention_days;

    let task = tokio::spawn(async move {
        let mut poll = tokio::time::interval(poll_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut compaction = tokio::time::interval(compact_every);
        compaction.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            event = "relay_runtime_started",
            poll_ms = poll_every.as_millis() as u64,
            compaction_ms = compact_every.as_millis() as u64
        );

        loop {
            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = poll.tick() => {
                    if let Some(Err(err)) = worker.try_run_pass(Utc::now()).await {
                        error!(event = "pass_failed", error = %err);
                    }
                }
                _ = compaction.tick() => {
                    metrics::compact(worker.store(), Utc::now(), retention_days);
                }
            }
        }
    });

    RelayRuntimeHandle { shutdown, task }
}
