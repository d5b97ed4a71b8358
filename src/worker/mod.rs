//! Claim → execute → validate → commit loop.
//!
//! One worker processes one task at a time. Several worker processes may
//! share a store; they coordinate only through the store's conditional
//! updates and heartbeats.

mod attempt;
mod heartbeat;
mod outcome;
pub mod routing;

pub use outcome::{Disposition, TaskOutcome, WorkerRunSummary};
pub use routing::{RoutingOverrides, resolve_for_enqueue, resolve_for_execution};

use crate::backend::{AgentBackend, CliAgentBackend};
use crate::config::Config;
use crate::contract::WorkdirManager;
use crate::failure::FailureClassifier;
use crate::observability::{Observer, WorkerEvent, create_observer};
use crate::policy::RetryPolicy;
use crate::store::TaskStore;
use crate::usage::PriceTable;
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct Worker {
    config: Arc<Config>,
    store: TaskStore,
    default_backend: Arc<dyn AgentBackend>,
    /// Agent name -> backend; agents not listed use `default_backend`.
    backends: HashMap<String, Arc<dyn AgentBackend>>,
    classifier: FailureClassifier,
    prices: PriceTable,
    retry: RetryPolicy,
    workdirs: WorkdirManager,
    observer: Arc<dyn Observer>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(config: Arc<Config>, store: TaskStore, shutdown: CancellationToken) -> Result<Self> {
        let prices = config.pricing.price_table()?;
        let classifier =
            FailureClassifier::with_model_unavailable_phrases(&config.classifier.extra_model_unavailable);
        let observer: Arc<dyn Observer> = Arc::from(create_observer(&config.observability));
        Ok(Self {
            retry: RetryPolicy::from_config(&config.worker),
            workdirs: WorkdirManager::new(config.worker.workdir_root.clone()),
            default_backend: Arc::new(CliAgentBackend::new()),
            backends: HashMap::new(),
            classifier,
            prices,
            observer,
            store,
            shutdown,
            config,
        })
    }

    /// Route one agent name to a specific backend.
    pub fn with_backend(mut self, agent: &str, backend: Arc<dyn AgentBackend>) -> Self {
        self.backends.insert(agent.trim().to_lowercase(), backend);
        self
    }

    pub fn with_default_backend(mut self, backend: Arc<dyn AgentBackend>) -> Self {
        self.default_backend = backend;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker.worker_id
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    fn backend_for(&self, agent: &str) -> Arc<dyn AgentBackend> {
        self.backends
            .get(agent)
            .map_or_else(|| Arc::clone(&self.default_backend), Arc::clone)
    }

    /// Process at most one task. `None` when nothing was due or shutdown
    /// was requested.
    pub async fn run_once(&self) -> Result<Option<TaskOutcome>> {
        Ok(self.poll().await?.1)
    }

    /// Poll until `max_tasks` tasks were processed, `max_idle_polls`
    /// consecutive polls found nothing, or shutdown was requested.
    pub async fn run_loop(
        &self,
        max_tasks: Option<u64>,
        max_idle_polls: Option<u64>,
    ) -> Result<WorkerRunSummary> {
        let mut summary = WorkerRunSummary::default();
        let mut consecutive_idle = 0_u64;
        let poll_interval = Duration::from_secs(self.config.worker.poll_interval_seconds);

        tracing::info!(worker_id = %self.worker_id(), "worker.started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if let Some(max) = max_tasks
                && summary.processed >= max
            {
                break;
            }

            let outcome = match self.poll().await {
                Ok((stale, outcome)) => {
                    summary.stale_recovered += stale;
                    outcome
                }
                Err(e) => {
                    tracing::error!(worker_id = %self.worker_id(), error = %format!("{e:#}"), "worker poll failed");
                    self.observer.record_event(&WorkerEvent::Error {
                        component: "worker".into(),
                        message: format!("{e:#}"),
                    });
                    None
                }
            };

            if let Some(outcome) = outcome {
                summary.absorb(&outcome);
                consecutive_idle = 0;
                continue;
            }

            summary.idle_polls += 1;
            consecutive_idle += 1;
            if let Some(max) = max_idle_polls
                && consecutive_idle >= max
            {
                break;
            }
            self.sleep_unless_shutdown(poll_interval).await;
        }

        if self.shutdown.is_cancelled() {
            self.observer.record_event(&WorkerEvent::ShutdownRequested {
                worker_id: self.worker_id().to_string(),
            });
            self.observer.record_event(&WorkerEvent::ShutdownCompleted {
                worker_id: self.worker_id().to_string(),
                processed: summary.processed,
            });
        }
        self.observer.flush();
        tracing::info!(
            worker_id = %self.worker_id(),
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            retried = summary.retried,
            "worker.stopped"
        );
        Ok(summary)
    }

    /// Stale recovery, then at most one claim. Returns the number of
    /// recovered tasks alongside the outcome.
    async fn poll(&self) -> Result<(u64, Option<TaskOutcome>)> {
        if self.shutdown.is_cancelled() {
            return Ok((0, None));
        }
        let stale = self.recover_stale().await?;
        if self.shutdown.is_cancelled() {
            return Ok((stale, None));
        }
        let Some(task) = self.store.claim_next(self.worker_id(), Utc::now()).await? else {
            return Ok((stale, None));
        };
        let outcome = self.process(task).await?;
        Ok((stale, Some(outcome)))
    }

    async fn recover_stale(&self) -> Result<u64> {
        let stale_after = Duration::from_secs(self.config.worker.stale_after_seconds);
        let recovered = self.store.recover_stale(Utc::now(), stale_after).await?;
        for task in &recovered {
            self.observer.record_event(&WorkerEvent::StaleRecovered {
                task_id: task.task_id.clone(),
                requeued: task.requeued,
            });
        }
        Ok(u64::try_from(recovered.len()).unwrap_or(u64::MAX))
    }

    async fn sleep_unless_shutdown(&self, duration: Duration) {
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            () = self.shutdown.cancelled() => {}
        }
    }
}
