use crate::failure::FailureClass;
use std::time::Duration;

/// Worker lifecycle events an observer can record
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    TaskClaimed {
        task_id: String,
        attempt: u32,
        agent: String,
        model: String,
    },
    AttemptFinished {
        task_id: String,
        attempt: u32,
        exit_code: i32,
        timed_out: bool,
        failure_class: Option<FailureClass>,
        duration: Duration,
    },
    TaskCommitted {
        task_id: String,
        attempt: u32,
        blocks: usize,
    },
    TaskFailed {
        task_id: String,
        attempt: u32,
        failure_class: FailureClass,
        reason_code: String,
    },
    RetryScheduled {
        task_id: String,
        next_attempt: u32,
        delay: Duration,
    },
    StaleRecovered {
        task_id: String,
        requeued: bool,
    },
    ShutdownRequested {
        worker_id: String,
    },
    ShutdownCompleted {
        worker_id: String,
        processed: u64,
    },
    Error {
        component: String,
        message: String,
    },
}

/// Observability seam for the worker. Implement for any backend.
pub trait Observer: Send + Sync {
    /// Record a discrete event
    fn record_event(&self, event: &WorkerEvent);

    /// Flush any buffered data (no-op for most backends)
    fn flush(&self) {}

    /// Human-readable name of this observer
    fn name(&self) -> &str;
}
