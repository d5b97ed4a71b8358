use super::traits::{Observer, WorkerEvent};
use tracing::{info, warn};

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Observer that writes each event as a structured tracing record
pub struct LogObserver;

impl LogObserver {
    pub fn new() -> Self {
        Self
    }
}

impl Observer for LogObserver {
    fn record_event(&self, event: &WorkerEvent) {
        match event {
            WorkerEvent::TaskClaimed {
                task_id,
                attempt,
                agent,
                model,
            } => {
                info!(task_id = %task_id, attempt, agent = %agent, model = %model, "task.claimed");
            }
            WorkerEvent::AttemptFinished {
                task_id,
                attempt,
                exit_code,
                timed_out,
                failure_class,
                duration,
            } => {
                let class = failure_class.map(|c| c.as_db());
                info!(
                    task_id = %task_id,
                    attempt,
                    exit_code,
                    timed_out,
                    failure_class = ?class,
                    duration_ms = millis(*duration),
                    "attempt.finished"
                );
            }
            WorkerEvent::TaskCommitted {
                task_id,
                attempt,
                blocks,
            } => {
                info!(task_id = %task_id, attempt, blocks, "task.committed");
            }
            WorkerEvent::TaskFailed {
                task_id,
                attempt,
                failure_class,
                reason_code,
            } => {
                warn!(
                    task_id = %task_id,
                    attempt,
                    failure_class = %failure_class.as_db(),
                    reason_code = %reason_code,
                    "task.failed"
                );
            }
            WorkerEvent::RetryScheduled {
                task_id,
                next_attempt,
                delay,
            } => {
                info!(task_id = %task_id, next_attempt, delay_ms = millis(*delay), "task.retry_scheduled");
            }
            WorkerEvent::StaleRecovered { task_id, requeued } => {
                warn!(task_id = %task_id, requeued, "task.stale_recovered");
            }
            WorkerEvent::ShutdownRequested { worker_id } => {
                info!(worker_id = %worker_id, "worker.shutdown_requested");
            }
            WorkerEvent::ShutdownCompleted {
                worker_id,
                processed,
            } => {
                info!(worker_id = %worker_id, processed, "worker.shutdown_completed");
            }
            WorkerEvent::Error { component, message } => {
                warn!(component = %component, error = %message, "error");
            }
        }
    }

    fn name(&self) -> &str {
        "log"
    }
}
