use super::TaskStore;
use super::codec::{TASK_COLUMNS, from_u64, row_to_task, ts};
use super::types::{
    AttemptRecord, CommitOutcome, FailureCommit, FailureOutcome, FailurePlan, NewTask,
    RecoveredTask, Task, TaskStatus,
};
use crate::contract::AgentOutput;
use crate::error::StoreError;
use crate::failure::FailureClass;
use anyhow::{Context, Result};
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde_json::{Value, json};
use sqlx::{Row, SqliteConnection};
use std::time::Duration;
use uuid::Uuid;

pub(super) const STALE_REQUEUED_REASON: &str = "stale_attempt";
pub(super) const STALE_EXHAUSTED_REASON: &str = "stale_attempt_exhausted";

async fn insert_event(
    conn: &mut SqliteConnection,
    task_id: &str,
    event_type: &str,
    status_from: Option<TaskStatus>,
    status_to: Option<TaskStatus>,
    details: &Value,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO events (event_id, task_id, event_type, status_from, status_to, details, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(task_id)
    .bind(event_type)
    .bind(status_from.map(TaskStatus::as_db))
    .bind(status_to.map(TaskStatus::as_db))
    .bind(details.to_string())
    .bind(ts(at))
    .execute(conn)
    .await
    .with_context(|| format!("Failed to write {event_type} event for task {task_id}"))?;
    Ok(())
}

/// Object details with `extra` merged in; non-object details are nested.
fn merge_details(base: &Value, extra: Value) -> Value {
    let mut merged = match base {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("details".into(), other.clone());
            map
        }
    };
    if let Value::Object(extra) = extra {
        merged.extend(extra);
    }
    Value::Object(merged)
}

impl TaskStore {
    pub async fn enqueue(&self, task: NewTask) -> Result<Task> {
        // Rows store microsecond precision.
        let now = Utc::now().trunc_subsecs(6);
        let task_id = task.task_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let max_attempts = task.max_attempts.max(1);
        let timeout_seconds = task.timeout_seconds.max(1);
        let run_after = task.run_after.map_or(now, |t| t.trunc_subsecs(6));
        let routing = task
            .routing
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode routing")?;

        let mut tx = self.pool.begin().await.context("Failed to begin enqueue")?;
        sqlx::query(
            "INSERT INTO tasks (
                task_id, task_type, prompt, metadata, articles, routing, status, priority,
                attempt, max_attempts, timeout_seconds, run_after, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?)",
        )
        .bind(&task_id)
        .bind(&task.task_type)
        .bind(&task.prompt)
        .bind(Value::Object(task.metadata.clone()).to_string())
        .bind(serde_json::to_string(&task.articles).context("Failed to encode articles")?)
        .bind(routing)
        .bind(TaskStatus::Pending.as_db())
        .bind(task.priority)
        .bind(i64::from(max_attempts))
        .bind(i64::from(timeout_seconds))
        .bind(ts(run_after))
        .bind(ts(now))
        .bind(ts(now))
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to insert task {task_id}"))?;

        let details = json!({
            "task_type": task.task_type,
            "priority": task.priority,
            "max_attempts": max_attempts,
            "routing": task.routing,
        });
        insert_event(&mut tx, &task_id, "enqueued", None, Some(TaskStatus::Pending), &details, now).await?;
        tx.commit().await.context("Failed to commit enqueue")?;

        Ok(Task {
            task_id,
            task_type: task.task_type,
            prompt: task.prompt,
            metadata: task.metadata,
            articles: task.articles,
            routing: task.routing,
            status: TaskStatus::Pending,
            priority: task.priority,
            attempt: 0,
            max_attempts,
            timeout_seconds,
            run_after,
            created_at: now,
            updated_at: now,
            started_at: None,
            heartbeat_at: None,
            finished_at: None,
            worker_id: None,
            repair_attempted_at: None,
            failure_class: None,
            reason_code: None,
            error_summary: None,
            last_exit_code: None,
        })
    }

    /// Atomically move the next due pending task to running and return it.
    ///
    /// Due tasks are ordered by priority (lower first), then `run_after`, then
    /// creation time. Selection and transition are one statement, so two
    /// workers can never claim the same task.
    pub async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Task>> {
        let mut tx = self.pool.begin().await.context("Failed to begin claim")?;
        let sql = format!(
            "UPDATE tasks
             SET status = 'running', attempt = attempt + 1, worker_id = ?,
                 started_at = ?, heartbeat_at = ?, finished_at = NULL, updated_at = ?
             WHERE task_id = (
                 SELECT task_id FROM tasks
                 WHERE status = 'pending' AND run_after <= ?
                 ORDER BY priority ASC, run_after ASC, created_at ASC
                 LIMIT 1
             ) AND status = 'pending'
             RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(worker_id)
            .bind(ts(now))
            .bind(ts(now))
            .bind(ts(now))
            .bind(ts(now))
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to claim task")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let task = row_to_task(&row)?;
        let details = json!({ "worker_id": worker_id, "attempt": task.attempt });
        insert_event(
            &mut tx,
            &task.task_id,
            "claimed",
            Some(TaskStatus::Pending),
            Some(TaskStatus::Running),
            &details,
            now,
        )
        .await?;
        tx.commit().await.context("Failed to commit claim")?;
        Ok(Some(task))
    }

    /// Refresh the heartbeat. Returns `false` once the worker no longer owns
    /// the task (recovered as stale, or already committed).
    pub async fn heartbeat(&self, task_id: &str, worker_id: &str) -> Result<bool> {
        let now = ts(Utc::now());
        let result = sqlx::query(
            "UPDATE tasks SET heartbeat_at = ?, updated_at = ?
             WHERE task_id = ? AND status = 'running' AND worker_id = ?",
        )
        .bind(&now)
        .bind(&now)
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .context("Failed to write heartbeat")?;
        Ok(result.rows_affected() == 1)
    }

    /// Stamp the one-shot repair. Returns `false` if a repair was already
    /// attempted or the worker lost the task.
    pub async fn mark_repair_attempted(
        &self,
        task_id: &str,
        worker_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to begin repair mark")?;
        let result = sqlx::query(
            "UPDATE tasks SET repair_attempted_at = ?, updated_at = ?
             WHERE task_id = ? AND status = 'running' AND worker_id = ?
               AND repair_attempted_at IS NULL",
        )
        .bind(ts(at))
        .bind(ts(at))
        .bind(task_id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await
        .context("Failed to mark repair attempted")?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        let details = json!({ "worker_id": worker_id });
        insert_event(
            &mut tx,
            task_id,
            "repair_attempted",
            Some(TaskStatus::Running),
            Some(TaskStatus::Running),
            &details,
            at,
        )
        .await?;
        tx.commit().await.context("Failed to commit repair mark")?;
        Ok(true)
    }

    /// Append attempt history. Called before the commit decision.
    pub async fn record_attempt(&self, attempt: &AttemptRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO attempts ({cols}) VALUES ({marks})",
            cols = super::codec::ATTEMPT_COLUMNS,
            marks = vec!["?"; 30].join(", ")
        );
        sqlx::query(&sql)
            .bind(&attempt.attempt_id)
            .bind(&attempt.task_id)
            .bind(i64::from(attempt.attempt_no))
            .bind(attempt.worker_id.as_deref())
            .bind(&attempt.agent)
            .bind(&attempt.profile)
            .bind(&attempt.model)
            .bind(ts(attempt.started_at))
            .bind(ts(attempt.finished_at))
            .bind(i64::try_from(attempt.duration_ms).unwrap_or(i64::MAX))
            .bind(attempt.exit_code)
            .bind(attempt.timed_out)
            .bind(attempt.failure_class.map(FailureClass::as_db))
            .bind(attempt.reason_code.as_deref())
            .bind(attempt.error_summary.as_deref())
            .bind(attempt.classifier_version.map(i64::from))
            .bind(attempt.matched_rule.as_deref())
            .bind(attempt.matched_pattern.as_deref())
            .bind(attempt.command_template_hash.as_deref())
            .bind(&attempt.stdout_preview)
            .bind(&attempt.stderr_preview)
            .bind(from_u64(attempt.usage.prompt_tokens))
            .bind(from_u64(attempt.usage.completion_tokens))
            .bind(from_u64(attempt.usage.total_tokens))
            .bind(attempt.usage.status.to_string())
            .bind(attempt.usage.source.to_string())
            .bind(&attempt.usage.parser_version)
            .bind(attempt.estimated_cost_usd)
            .bind(attempt.output_recovery.as_deref())
            .bind(attempt.repair_outcome.as_deref())
            .execute(&self.pool)
            .await
            .with_context(|| {
                format!("Failed to record attempt {} of task {}", attempt.attempt_no, attempt.task_id)
            })?;
        Ok(())
    }

    /// Store the artifact and mark the task succeeded.
    ///
    /// Repeating the call for an attempt that already committed returns
    /// [`CommitOutcome::AlreadyCommitted`] without touching anything.
    pub async fn commit_success(
        &self,
        task_id: &str,
        worker_id: &str,
        attempt_no: u32,
        output: &AgentOutput,
    ) -> Result<CommitOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.context("Failed to begin success commit")?;
        let result = sqlx::query(
            "UPDATE tasks
             SET status = 'succeeded', finished_at = ?, updated_at = ?, heartbeat_at = NULL,
                 failure_class = NULL, reason_code = NULL, error_summary = NULL,
                 last_exit_code = COALESCE(
                     (SELECT exit_code FROM attempts WHERE task_id = ? AND attempt_no = ?),
                     last_exit_code)
             WHERE task_id = ? AND status = 'running' AND worker_id = ? AND attempt = ?",
        )
        .bind(ts(now))
        .bind(ts(now))
        .bind(task_id)
        .bind(i64::from(attempt_no))
        .bind(task_id)
        .bind(worker_id)
        .bind(i64::from(attempt_no))
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to mark task {task_id} succeeded"))?;

        if result.rows_affected() == 0 {
            tx.rollback().await.context("Failed to roll back success commit")?;
            let task = self.require_task(task_id).await?;
            if task.status == TaskStatus::Succeeded
                && self.artifact_attempt(task_id).await? == Some(attempt_no)
            {
                return Ok(CommitOutcome::AlreadyCommitted);
            }
            return Err(invalid_state(&task, "running").into());
        }

        sqlx::query(
            "INSERT INTO artifacts (task_id, attempt_no, blocks, metadata, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(i64::from(attempt_no))
        .bind(serde_json::to_string(&output.blocks).context("Failed to encode blocks")?)
        .bind(Value::Object(output.metadata.clone()).to_string())
        .bind(ts(now))
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to store artifact for task {task_id}"))?;

        let details = json!({
            "attempt": attempt_no,
            "worker_id": worker_id,
            "blocks": output.blocks.len(),
        });
        insert_event(
            &mut tx,
            task_id,
            "succeeded",
            Some(TaskStatus::Running),
            Some(TaskStatus::Succeeded),
            &details,
            now,
        )
        .await?;
        tx.commit().await.context("Failed to commit success")?;
        Ok(CommitOutcome::Committed)
    }

    /// Requeue or fail a running task according to `commit.plan`.
    pub async fn commit_failure(
        &self,
        task_id: &str,
        worker_id: &str,
        attempt_no: u32,
        commit: &FailureCommit,
    ) -> Result<FailureOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.context("Failed to begin failure commit")?;

        let (result, outcome, event_type, status_to, extra) = match &commit.plan {
            FailurePlan::Retry {
                run_after,
                timeout_seconds,
            } => {
                let result = sqlx::query(
                    "UPDATE tasks
                     SET status = 'pending', run_after = ?, timeout_seconds = ?, worker_id = NULL,
                         started_at = NULL, heartbeat_at = NULL, failure_class = ?,
                         reason_code = ?, error_summary = ?, last_exit_code = ?, updated_at = ?
                     WHERE task_id = ? AND status = 'running' AND worker_id = ? AND attempt = ?",
                )
                .bind(ts(*run_after))
                .bind(i64::from(*timeout_seconds))
                .bind(commit.failure_class.as_db())
                .bind(&commit.reason_code)
                .bind(&commit.error_summary)
                .bind(commit.exit_code)
                .bind(ts(now))
                .bind(task_id)
                .bind(worker_id)
                .bind(i64::from(attempt_no))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to requeue task {task_id}"))?;
                let extra = json!({
                    "run_after": ts(*run_after),
                    "timeout_seconds": timeout_seconds,
                });
                (result, FailureOutcome::Requeued, "retry_scheduled", TaskStatus::Pending, extra)
            }
            FailurePlan::Terminal => {
                let result = sqlx::query(
                    "UPDATE tasks
                     SET status = 'failed', finished_at = ?, heartbeat_at = NULL,
                         failure_class = ?, reason_code = ?, error_summary = ?,
                         last_exit_code = ?, updated_at = ?
                     WHERE task_id = ? AND status = 'running' AND worker_id = ? AND attempt = ?",
                )
                .bind(ts(now))
                .bind(commit.failure_class.as_db())
                .bind(&commit.reason_code)
                .bind(&commit.error_summary)
                .bind(commit.exit_code)
                .bind(ts(now))
                .bind(task_id)
                .bind(worker_id)
                .bind(i64::from(attempt_no))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to fail task {task_id}"))?;
                (result, FailureOutcome::Failed, "failed", TaskStatus::Failed, json!({}))
            }
        };

        if result.rows_affected() == 0 {
            tx.rollback().await.context("Failed to roll back failure commit")?;
            let task = self.require_task(task_id).await?;
            let already = task.attempt == attempt_no
                && task.failure_class == Some(commit.failure_class)
                && match outcome {
                    FailureOutcome::Requeued => task.status == TaskStatus::Pending,
                    FailureOutcome::Failed => task.status == TaskStatus::Failed,
                };
            if already {
                return Ok(outcome);
            }
            return Err(invalid_state(&task, "running").into());
        }

        let details = merge_details(
            &commit.details,
            merge_details(
                &json!({
                    "attempt": attempt_no,
                    "worker_id": worker_id,
                    "failure_class": commit.failure_class.as_db(),
                    "reason_code": commit.reason_code,
                }),
                extra,
            ),
        );
        insert_event(
            &mut tx,
            task_id,
            event_type,
            Some(TaskStatus::Running),
            Some(status_to),
            &details,
            now,
        )
        .await?;
        tx.commit().await.context("Failed to commit failure")?;
        Ok(outcome)
    }

    /// Reclaim running tasks whose heartbeat is older than `stale_after`.
    ///
    /// Each abandoned run consumes its attempt: the task goes back to pending
    /// while attempts remain and fails otherwise. A task whose heartbeat moved
    /// since it was observed is left alone.
    pub async fn recover_stale(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Vec<RecoveredTask>> {
        let stale_after = TimeDelta::from_std(stale_after).context("stale_after out of range")?;
        let cutoff = now - stale_after;
        let candidates = sqlx::query(
            "SELECT task_id, worker_id, heartbeat_at, attempt, max_attempts FROM tasks
             WHERE status = 'running' AND COALESCE(heartbeat_at, started_at, updated_at) < ?",
        )
        .bind(ts(cutoff))
        .fetch_all(&self.pool)
        .await
        .context("Failed to scan for stale tasks")?;

        let mut recovered = Vec::new();
        for row in candidates {
            let task_id: String = row.get("task_id");
            let observed_worker_id: Option<String> = row.get("worker_id");
            let heartbeat_at: Option<String> = row.get("heartbeat_at");
            let attempt: i64 = row.get("attempt");
            let max_attempts: i64 = row.get("max_attempts");
            let requeue = attempt < max_attempts;
            let summary = format!(
                "worker {} stopped heartbeating during attempt {attempt}",
                observed_worker_id.as_deref().unwrap_or("<unknown>")
            );

            let mut tx = self.pool.begin().await.context("Failed to begin stale recovery")?;
            let sql = if requeue {
                "UPDATE tasks
                 SET status = 'pending', run_after = ?, worker_id = NULL, started_at = NULL,
                     heartbeat_at = NULL, failure_class = ?, reason_code = ?, error_summary = ?,
                     updated_at = ?
                 WHERE task_id = ? AND status = 'running' AND worker_id IS ?
                   AND heartbeat_at IS ? AND attempt = ?"
            } else {
                "UPDATE tasks
                 SET status = 'failed', finished_at = ?, heartbeat_at = NULL, failure_class = ?,
                     reason_code = ?, error_summary = ?, updated_at = ?
                 WHERE task_id = ? AND status = 'running' AND worker_id IS ?
                   AND heartbeat_at IS ? AND attempt = ?"
            };
            let reason = if requeue {
                STALE_REQUEUED_REASON
            } else {
                STALE_EXHAUSTED_REASON
            };
            let result = sqlx::query(sql)
                .bind(ts(now))
                .bind(FailureClass::BackendTransient.as_db())
                .bind(reason)
                .bind(&summary)
                .bind(ts(now))
                .bind(&task_id)
                .bind(observed_worker_id.as_deref())
                .bind(heartbeat_at.as_deref())
                .bind(attempt)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to recover stale task {task_id}"))?;
            if result.rows_affected() == 0 {
                continue;
            }

            let status_to = if requeue {
                TaskStatus::Pending
            } else {
                TaskStatus::Failed
            };
            let details = json!({
                "observed_worker_id": observed_worker_id,
                "observed_heartbeat_at": heartbeat_at,
                "attempt": attempt,
                "requeued": requeue,
                "reason_code": reason,
            });
            insert_event(
                &mut tx,
                &task_id,
                "stale_recovered",
                Some(TaskStatus::Running),
                Some(status_to),
                &details,
                now,
            )
            .await?;
            tx.commit().await.context("Failed to commit stale recovery")?;

            tracing::warn!(task_id = %task_id, attempt, requeued = requeue, "task.stale_recovered");
            recovered.push(RecoveredTask {
                task_id,
                observed_worker_id,
                attempt: u32::try_from(attempt).unwrap_or_default(),
                requeued: requeue,
            });
        }
        Ok(recovered)
    }

    /// Operator retry of a failed task. Grants one more attempt when the
    /// budget is spent and clears the repair stamp.
    pub async fn retry_task(&self, task_id: &str) -> Result<Task> {
        let previous = self.require_task(task_id).await?;
        if previous.status != TaskStatus::Failed {
            return Err(invalid_state(&previous, "failed").into());
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await.context("Failed to begin manual retry")?;
        let sql = format!(
            "UPDATE tasks
             SET status = 'pending', max_attempts = MAX(max_attempts, attempt + 1),
                 run_after = ?, worker_id = NULL, started_at = NULL, heartbeat_at = NULL,
                 finished_at = NULL, failure_class = NULL, reason_code = NULL,
                 error_summary = NULL, repair_attempted_at = NULL, updated_at = ?
             WHERE task_id = ? AND status = 'failed'
             RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(ts(now))
            .bind(ts(now))
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await
            .with_context(|| format!("Failed to retry task {task_id}"))?;
        let Some(row) = row else {
            tx.rollback().await.context("Failed to roll back manual retry")?;
            let current = self.require_task(task_id).await?;
            return Err(invalid_state(&current, "failed").into());
        };
        let task = row_to_task(&row)?;

        let details = json!({
            "previous_failure_class": previous.failure_class.map(FailureClass::as_db),
            "previous_reason_code": previous.reason_code,
            "attempt": task.attempt,
            "max_attempts": task.max_attempts,
        });
        insert_event(
            &mut tx,
            task_id,
            "manual_retry",
            Some(TaskStatus::Failed),
            Some(TaskStatus::Pending),
            &details,
            now,
        )
        .await?;
        tx.commit().await.context("Failed to commit manual retry")?;
        Ok(task)
    }

    /// Log a worker-side event against the task's current status.
    pub async fn append_event(&self, task_id: &str, event_type: &str, details: &Value) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO events (event_id, task_id, event_type, status_from, status_to, details, created_at)
             SELECT ?, task_id, ?, status, status, ?, ? FROM tasks WHERE task_id = ?",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(event_type)
        .bind(details.to_string())
        .bind(ts(Utc::now()))
        .bind(task_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to append {event_type} event"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id.to_string()).into());
        }
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?");
        let row = sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to load task {task_id}"))?;
        row.as_ref().map(row_to_task).transpose()
    }

    /// Newest first.
    pub async fn list_tasks(&self, status: Option<TaskStatus>, limit: u32) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE (? IS NULL OR status = ?)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?"
        );
        let status = status.map(TaskStatus::as_db);
        let rows = sqlx::query(&sql)
            .bind(status)
            .bind(status)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .context("Failed to list tasks")?;
        rows.iter().map(row_to_task).collect()
    }

    pub(super) async fn require_task(&self, task_id: &str) -> Result<Task> {
        self.get_task(task_id)
            .await?
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()).into())
    }

    async fn artifact_attempt(&self, task_id: &str) -> Result<Option<u32>> {
        let attempt: Option<i64> = sqlx::query_scalar("SELECT attempt_no FROM artifacts WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load artifact")?;
        Ok(attempt.and_then(|a| u32::try_from(a).ok()))
    }
}

fn invalid_state(task: &Task, expected: &str) -> StoreError {
    StoreError::InvalidState {
        task_id: task.task_id.clone(),
        status: task.status.to_string(),
        expected: expected.to_string(),
    }
}
