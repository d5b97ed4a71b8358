use super::Worker;
use super::heartbeat::spawn_heartbeat;
use super::outcome::{Disposition, TaskOutcome, Verdict};
use super::routing::resolve_for_execution;
use crate::backend::{AgentBackend, BackendRunRequest, BackendRunResult, template_fingerprint};
use crate::contract::{AgentOutput, MaterializedTask, TaskInput, write_json};
use crate::error::StoreError;
use crate::failure::FailureClass;
use crate::observability::WorkerEvent;
use crate::output::{STDOUT_PARSER_VERSION, ValidationFailure, recover_from_stdout, validate_output_file};
use crate::policy::{RetryVerdict, decide_repair};
use crate::security::sanitize_preview;
use crate::store::{AttemptRecord, FailureCommit, FailurePlan, Routing, Task};
use crate::usage::extract_usage;
use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Bytes kept from the end of each captured stream for classification and
/// usage parsing.
const CAPTURE_TAIL_BYTES: usize = 256 * 1024;

const REPAIR_NOT_NEEDED: &str = "not_needed";
const REPAIR_RECOVERED: &str = "recovered";
const REPAIR_REPAIRED: &str = "repaired";
const REPAIR_FAILED: &str = "repair_failed";
const REPAIR_SKIPPED: &str = "skipped";

struct AttemptContext {
    task: Task,
    routing: Routing,
    started_at: DateTime<Utc>,
}

/// What the agent left behind, as seen by the worker.
#[derive(Debug, Default)]
struct Capture {
    exit_code: Option<i32>,
    timed_out: bool,
    interrupted: bool,
    stdout: String,
    stderr: String,
    duration: Duration,
    output_recovery: Option<String>,
    repair_outcome: Option<&'static str>,
}

impl Capture {
    async fn read(execution: &BackendRunResult) -> Self {
        Self {
            exit_code: Some(execution.exit_code),
            timed_out: execution.timed_out,
            interrupted: execution.interrupted_by_shutdown,
            stdout: read_tail(&execution.stdout_path).await,
            stderr: read_tail(&execution.stderr_path).await,
            duration: execution.duration,
            output_recovery: None,
            repair_outcome: None,
        }
    }
}

async fn read_tail(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let start = bytes.len().saturating_sub(CAPTURE_TAIL_BYTES);
            String::from_utf8_lossy(&bytes[start..]).into_owned()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read agent capture");
            String::new()
        }
    }
}

fn lost_ownership(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<StoreError>(),
        Some(StoreError::InvalidState { .. })
    )
}

fn merge(base: Value, extra: Value) -> Value {
    match (base, extra) {
        (Value::Object(mut base), Value::Object(extra)) => {
            base.extend(extra);
            Value::Object(base)
        }
        (base, _) => base,
    }
}

impl Worker {
    pub(super) async fn process(&self, task: Task) -> Result<TaskOutcome> {
        let started_at = Utc::now();
        let (routing, fallback_reason) =
            resolve_for_execution(&self.config.routing, &task.task_type, task.routing.as_ref())?;
        if let Some(reason) = fallback_reason {
            tracing::warn!(task_id = %task.task_id, reason, agent = %routing.agent, "routing fallback applied");
            self.store
                .append_event(
                    &task.task_id,
                    "routing_fallback_applied",
                    &json!({
                        "reason": reason,
                        "agent": routing.agent,
                        "profile": routing.profile,
                        "model": routing.model,
                    }),
                )
                .await?;
        }

        self.observer.record_event(&WorkerEvent::TaskClaimed {
            task_id: task.task_id.clone(),
            attempt: task.attempt,
            agent: routing.agent.clone(),
            model: routing.model.clone(),
        });

        let ctx = AttemptContext {
            task,
            routing,
            started_at,
        };
        let input = TaskInput {
            task_type: ctx.task.task_type.clone(),
            prompt: ctx.task.prompt.clone(),
            metadata: ctx.task.metadata.clone(),
        };
        let materialized = match self
            .workdirs
            .materialize(&ctx.task.task_id, ctx.task.attempt, &input, &ctx.task.articles)
            .await
        {
            Ok(materialized) => materialized,
            Err(e) => {
                let verdict = Verdict::local(
                    &ctx.routing.agent,
                    FailureClass::BackendTransient,
                    "workdir_unavailable",
                    format!("{e:#}"),
                );
                return self.finish_failure(&ctx, verdict, Capture::default()).await;
            }
        };

        let _heartbeat = spawn_heartbeat(
            self.store.clone(),
            ctx.task.task_id.clone(),
            self.worker_id().to_string(),
            Duration::from_secs(self.config.worker.heartbeat_interval_seconds),
        );

        let backend = self.backend_for(&ctx.routing.agent);
        let request = BackendRunRequest {
            manifest_path: materialized.manifest_path.clone(),
            timeout_seconds: ctx.task.timeout_seconds,
            agent: ctx.routing.agent.clone(),
            profile: ctx.routing.profile.clone(),
            model: ctx.routing.model.clone(),
            command_template: ctx.routing.command_template.clone(),
            repair_mode: false,
            shutdown: self.shutdown.clone(),
            graceful_shutdown_seconds: self.config.worker.graceful_shutdown_seconds,
        };

        let execution = match backend.run(&request).await {
            Ok(execution) => execution,
            Err(e) => {
                tracing::warn!(task_id = %ctx.task.task_id, error = %e, "agent could not be run");
                let verdict = Verdict::backend_error(&ctx.routing.agent, &e);
                return self.finish_failure(&ctx, verdict, Capture::default()).await;
            }
        };
        let capture = Capture::read(&execution).await;

        if let Some(verdict) = self.execution_failure(&ctx, &execution, &capture).await? {
            return self.finish_failure(&ctx, verdict, capture).await;
        }

        let allowed = ctx.task.allowed_source_ids();
        let failure = match validate_output_file(&materialized.manifest.output_result_path, &allowed).await {
            Ok(output) => {
                let capture = Capture {
                    repair_outcome: Some(REPAIR_NOT_NEEDED),
                    ..capture
                };
                return self.finish_success(&ctx, output, capture).await;
            }
            Err(failure) => failure,
        };

        self.store
            .append_event(
                &ctx.task.task_id,
                "first_pass_validation_failed",
                &json!({
                    "failure_class": failure.failure_class.as_db(),
                    "code": failure.code,
                    "summary": failure.summary,
                }),
            )
            .await?;
        self.salvage(&ctx, backend.as_ref(), &request, &materialized, failure, capture)
            .await
    }

    /// Resolve a run that did not exit cleanly into a verdict.
    async fn execution_failure(
        &self,
        ctx: &AttemptContext,
        execution: &BackendRunResult,
        capture: &Capture,
    ) -> Result<Option<Verdict>> {
        let agent = ctx.routing.agent.as_str();
        if execution.interrupted_by_shutdown {
            self.store
                .append_event(
                    &ctx.task.task_id,
                    "shutdown_interrupted",
                    &json!({
                        "graceful_shutdown_seconds": self.config.worker.graceful_shutdown_seconds,
                    }),
                )
                .await?;
            return Ok(Some(Verdict::local(
                agent,
                FailureClass::BackendTransient,
                "shutdown_interrupted",
                "Agent was stopped by a worker shutdown.".into(),
            )));
        }

        let classification = if execution.timed_out {
            self.classifier
                .classify_timeout(agent, &capture.stdout, &capture.stderr)
        } else if execution.exit_code != 0 {
            self.classifier.classify(
                agent,
                execution.exit_code,
                &capture.stdout,
                &capture.stderr,
                &self.config.worker.transient_exit_codes,
            )
        } else {
            return Ok(None);
        };

        let summary = if execution.timed_out {
            format!(
                "{}: agent timed out after {}s.",
                classification.reason_code, ctx.task.timeout_seconds
            )
        } else {
            format!(
                "{}: backend exited with code {}.",
                classification.reason_code, execution.exit_code
            )
        };
        let details = merge(
            classification.to_event_details(agent, &ctx.routing.model),
            json!({ "resolved_profile": ctx.routing.profile }),
        );
        Ok(Some(Verdict::classified(classification, summary, details)))
    }

    /// Output recovery from stdout first, then the one-shot repair re-run.
    async fn salvage(
        &self,
        ctx: &AttemptContext,
        backend: &dyn AgentBackend,
        request: &BackendRunRequest,
        materialized: &MaterializedTask,
        failure: ValidationFailure,
        mut capture: Capture,
    ) -> Result<TaskOutcome> {
        let task_id = ctx.task.task_id.as_str();
        let allowed = ctx.task.allowed_source_ids();
        let result_path = &materialized.manifest.output_result_path;

        if failure.failure_class.is_repairable()
            && let Some(recovered) = recover_from_stdout(&capture.stdout, &allowed)
        {
            if let Err(e) = write_json(result_path, &recovered.output).await {
                tracing::warn!(task_id, error = %e, "failed to persist recovered output");
            }
            self.store
                .append_event(
                    task_id,
                    "stdout_parser_recovered",
                    &json!({
                        "parser_version": STDOUT_PARSER_VERSION,
                        "extraction": recovered.extraction.to_string(),
                        "dropped_source_ids": recovered.dropped_source_ids,
                    }),
                )
                .await?;
            capture.output_recovery = Some(format!(
                "stdout_parser_{STDOUT_PARSER_VERSION}_{}",
                recovered.extraction
            ));
            capture.repair_outcome = Some(REPAIR_RECOVERED);
            return self.finish_success(ctx, recovered.output, capture).await;
        }

        let decision = decide_repair(failure.failure_class, ctx.task.repair_attempted_at);
        if !decision.should_repair {
            tracing::info!(task_id, reason = decision.reason, "repair skipped");
            capture.repair_outcome = Some(REPAIR_SKIPPED);
            return self
                .finish_failure(ctx, Verdict::validation(failure), capture)
                .await;
        }
        if !self
            .store
            .mark_repair_attempted(task_id, self.worker_id(), Utc::now())
            .await?
        {
            capture.repair_outcome = Some(REPAIR_SKIPPED);
            return self
                .finish_failure(ctx, Verdict::validation(failure), capture)
                .await;
        }

        if let Some(lifecycle) = backend.lifecycle()
            && let Err(e) = lifecycle.prepare_repair(&materialized.manifest).await
        {
            tracing::warn!(task_id, error = %format!("{e:#}"), "repair preparation failed");
        }

        let repair_request = BackendRunRequest {
            repair_mode: true,
            ..request.clone()
        };
        let mut failure = failure;
        match backend.run(&repair_request).await {
            Ok(repair) => {
                capture = Capture::read(&repair).await;
                // A repair run that did not exit cleanly is judged on its own exit.
                if let Some(verdict) = self.execution_failure(ctx, &repair, &capture).await? {
                    capture.repair_outcome = Some(REPAIR_FAILED);
                    return self.finish_failure(ctx, verdict, capture).await;
                }
                match validate_output_file(result_path, &allowed).await {
                    Ok(output) => {
                        capture.repair_outcome = Some(REPAIR_REPAIRED);
                        return self.finish_success(ctx, output, capture).await;
                    }
                    Err(second) => failure = second,
                }
            }
            Err(e) => tracing::warn!(task_id, error = %e, "repair run could not be started"),
        }

        capture.repair_outcome = Some(REPAIR_FAILED);
        self.finish_failure(ctx, Verdict::validation(failure), capture)
            .await
    }

    async fn finish_success(
        &self,
        ctx: &AttemptContext,
        output: AgentOutput,
        capture: Capture,
    ) -> Result<TaskOutcome> {
        let record = self.attempt_record(ctx, &capture, None);
        self.store.record_attempt(&record).await?;
        self.report_attempt(ctx, &capture, None);

        let task_id = ctx.task.task_id.clone();
        let attempt = ctx.task.attempt;
        match self
            .store
            .commit_success(&task_id, self.worker_id(), attempt, &output)
            .await
        {
            Ok(_) => {}
            Err(e) if lost_ownership(&e) => {
                tracing::warn!(task_id = %task_id, attempt, error = %e, "task.commit_rejected");
                return Ok(self.lost(ctx, &capture));
            }
            Err(e) => return Err(e),
        }

        self.observer.record_event(&WorkerEvent::TaskCommitted {
            task_id: task_id.clone(),
            attempt,
            blocks: output.blocks.len(),
        });
        Ok(TaskOutcome {
            task_id,
            attempt,
            timed_out: capture.timed_out,
            disposition: Disposition::Succeeded {
                blocks: output.blocks.len(),
            },
        })
    }

    async fn finish_failure(
        &self,
        ctx: &AttemptContext,
        verdict: Verdict,
        capture: Capture,
    ) -> Result<TaskOutcome> {
        let task = &ctx.task;
        let stretch = capture.timed_out && !capture.interrupted;
        let decision = self.retry.decide(
            verdict.failure_class,
            task.attempt,
            task.max_attempts,
            stretch,
            task.timeout_seconds,
        );

        let preview_chars = self.config.worker.preview_chars;
        let summary = sanitize_preview(&verdict.summary, preview_chars);
        let mut details = merge(
            verdict.details.clone(),
            json!({
                "error_summary": summary,
                "stdout_preview": sanitize_preview(&capture.stdout, preview_chars),
                "stderr_preview": sanitize_preview(&capture.stderr, preview_chars),
            }),
        );
        let (plan, retry_delay) = match decision {
            RetryVerdict::Retry {
                delay,
                timeout_seconds,
            } => {
                let run_after = Utc::now() + TimeDelta::from_std(delay).unwrap_or(TimeDelta::zero());
                (
                    FailurePlan::Retry {
                        run_after,
                        timeout_seconds,
                    },
                    Some(delay),
                )
            }
            RetryVerdict::Terminal { reason } => {
                details = merge(details, json!({ "terminal_reason": reason }));
                (FailurePlan::Terminal, None)
            }
        };

        let record = self.attempt_record(ctx, &capture, Some(&verdict));
        self.store.record_attempt(&record).await?;
        self.report_attempt(ctx, &capture, Some(verdict.failure_class));

        let commit = FailureCommit {
            failure_class: verdict.failure_class,
            reason_code: verdict.reason_code.clone(),
            error_summary: summary,
            exit_code: capture.exit_code,
            plan: plan.clone(),
            details,
        };
        if let Err(e) = self
            .store
            .commit_failure(&task.task_id, self.worker_id(), task.attempt, &commit)
            .await
        {
            if lost_ownership(&e) {
                tracing::warn!(task_id = %task.task_id, attempt = task.attempt, error = %e, "task.commit_rejected");
                return Ok(self.lost(ctx, &capture));
            }
            return Err(e);
        }

        let disposition = match plan {
            FailurePlan::Retry { run_after, .. } => {
                self.observer.record_event(&WorkerEvent::RetryScheduled {
                    task_id: task.task_id.clone(),
                    next_attempt: task.attempt + 1,
                    delay: retry_delay.unwrap_or_default(),
                });
                Disposition::Retried {
                    failure_class: verdict.failure_class,
                    run_after,
                }
            }
            FailurePlan::Terminal => {
                self.observer.record_event(&WorkerEvent::TaskFailed {
                    task_id: task.task_id.clone(),
                    attempt: task.attempt,
                    failure_class: verdict.failure_class,
                    reason_code: verdict.reason_code.clone(),
                });
                Disposition::Failed {
                    failure_class: verdict.failure_class,
                    reason_code: verdict.reason_code,
                }
            }
        };
        Ok(TaskOutcome {
            task_id: task.task_id.clone(),
            attempt: task.attempt,
            timed_out: capture.timed_out,
            disposition,
        })
    }

    fn report_attempt(&self, ctx: &AttemptContext, capture: &Capture, failure_class: Option<FailureClass>) {
        self.observer.record_event(&WorkerEvent::AttemptFinished {
            task_id: ctx.task.task_id.clone(),
            attempt: ctx.task.attempt,
            exit_code: capture.exit_code.unwrap_or(-1),
            timed_out: capture.timed_out,
            failure_class,
            duration: capture.duration,
        });
    }

    fn lost(&self, ctx: &AttemptContext, capture: &Capture) -> TaskOutcome {
        self.observer.record_event(&WorkerEvent::Error {
            component: "worker".into(),
            message: format!("lost ownership of task {}", ctx.task.task_id),
        });
        TaskOutcome {
            task_id: ctx.task.task_id.clone(),
            attempt: ctx.task.attempt,
            timed_out: capture.timed_out,
            disposition: Disposition::Lost,
        }
    }

    fn attempt_record(
        &self,
        ctx: &AttemptContext,
        capture: &Capture,
        verdict: Option<&Verdict>,
    ) -> AttemptRecord {
        let finished_at = Utc::now();
        let preview_chars = self.config.worker.preview_chars;
        let usage = extract_usage(&capture.stdout, &capture.stderr);
        let estimated_cost_usd = self
            .prices
            .estimate_cost(&ctx.routing.agent, &ctx.routing.model, &usage);
        let duration_ms = (finished_at - ctx.started_at).num_milliseconds();

        AttemptRecord {
            attempt_id: Uuid::new_v4().to_string(),
            task_id: ctx.task.task_id.clone(),
            attempt_no: ctx.task.attempt,
            worker_id: Some(self.worker_id().to_string()),
            agent: ctx.routing.agent.clone(),
            profile: ctx.routing.profile.clone(),
            model: ctx.routing.model.clone(),
            started_at: ctx.started_at,
            finished_at,
            duration_ms: u64::try_from(duration_ms).unwrap_or_default(),
            exit_code: capture.exit_code,
            timed_out: capture.timed_out,
            failure_class: verdict.map(|v| v.failure_class),
            reason_code: verdict.map(|v| v.reason_code.clone()),
            error_summary: verdict.map(|v| sanitize_preview(&v.summary, preview_chars)),
            classifier_version: verdict.and_then(|v| v.classifier_version),
            matched_rule: verdict.and_then(|v| v.matched_rule.clone()),
            matched_pattern: verdict.and_then(|v| v.matched_pattern.clone()),
            command_template_hash: Some(template_fingerprint(&ctx.routing.command_template)),
            stdout_preview: sanitize_preview(&capture.stdout, preview_chars),
            stderr_preview: sanitize_preview(&capture.stderr, preview_chars),
            usage,
            estimated_cost_usd,
            output_recovery: capture.output_recovery.clone(),
            repair_outcome: capture.repair_outcome.map(str::to_string),
        }
    }
}
