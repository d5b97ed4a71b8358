use crate::store::TaskStore;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Keeps `heartbeat_at` fresh while an agent runs. Stops on drop.
pub(super) struct HeartbeatGuard {
    handle: JoinHandle<()>,
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub(super) fn spawn_heartbeat(
    store: TaskStore,
    task_id: String,
    worker_id: String,
    every: Duration,
) -> HeartbeatGuard {
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The claim itself stamped the first heartbeat.
        interval.tick().await;
        loop {
            interval.tick().await;
            match store.heartbeat(&task_id, &worker_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(task_id = %task_id, worker_id = %worker_id, "task.ownership_lost");
                    break;
                }
                Err(e) => tracing::warn!(task_id = %task_id, error = %e, "heartbeat failed"),
            }
        }
    });
    HeartbeatGuard { handle }
}
