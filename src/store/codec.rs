use super::types::{Artifact, AttemptRecord, Routing, Task, TaskEvent, TaskStatus};
use crate::contract::{AgentOutput, ArticleIndexEntry, OutputBlock};
use crate::error::StoreError;
use crate::failure::FailureClass;
use crate::usage::{TokenUsage, UsageSource, UsageStatus};
use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

pub(super) const TASK_COLUMNS: &str = "task_id, task_type, prompt, metadata, articles, routing, \
     status, priority, attempt, max_attempts, timeout_seconds, run_after, created_at, updated_at, \
     started_at, heartbeat_at, finished_at, worker_id, repair_attempted_at, failure_class, \
     reason_code, error_summary, last_exit_code";

pub(super) const ATTEMPT_COLUMNS: &str = "attempt_id, task_id, attempt_no, worker_id, agent, \
     profile, model, started_at, finished_at, duration_ms, exit_code, timed_out, failure_class, \
     reason_code, error_summary, classifier_version, matched_rule, matched_pattern, \
     command_template_hash, stdout_preview, stderr_preview, prompt_tokens, completion_tokens, \
     total_tokens, usage_status, usage_source, usage_parser_version, estimated_cost_usd, \
     output_recovery, repair_outcome";

/// Fixed-width UTC timestamps, so stored values order lexically.
pub(super) fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(super) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {raw:?}: {e}")).into())
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_json<T: DeserializeOwned>(column: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(format!("{column}: {e}")).into())
}

fn to_u32(column: &str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} out of range: {value}")).into())
}

fn to_u64(value: Option<i64>) -> Option<u64> {
    value.and_then(|v| u64::try_from(v).ok())
}

pub(super) fn from_u64(value: Option<u64>) -> Option<i64> {
    value.and_then(|v| i64::try_from(v).ok())
}

fn parse_class(raw: Option<String>) -> Result<Option<FailureClass>> {
    raw.map(|value| {
        FailureClass::from_db(&value)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown failure class {value:?}")).into())
    })
    .transpose()
}

fn parse_status(raw: &str) -> Result<TaskStatus> {
    TaskStatus::from_db(raw).ok_or_else(|| StoreError::Corrupt(format!("unknown task status {raw:?}")).into())
}

pub(super) fn row_to_task(row: &SqliteRow) -> Result<Task> {
    let metadata_raw: String = row.get("metadata");
    let articles_raw: String = row.get("articles");
    let routing_raw: Option<String> = row.get("routing");
    let status_raw: String = row.get("status");
    let run_after_raw: String = row.get("run_after");
    let created_at_raw: String = row.get("created_at");
    let updated_at_raw: String = row.get("updated_at");
    let last_exit_code: Option<i64> = row.get("last_exit_code");

    let routing: Option<Routing> = match routing_raw {
        Some(raw) => Some(parse_json("routing", &raw)?),
        None => None,
    };
    let metadata: Map<String, Value> = parse_json("metadata", &metadata_raw)?;
    let articles: Vec<ArticleIndexEntry> = parse_json("articles", &articles_raw)?;

    Ok(Task {
        task_id: row.get("task_id"),
        task_type: row.get("task_type"),
        prompt: row.get("prompt"),
        metadata,
        articles,
        routing,
        status: parse_status(&status_raw)?,
        priority: row.get("priority"),
        attempt: to_u32("attempt", row.get("attempt"))?,
        max_attempts: to_u32("max_attempts", row.get("max_attempts"))?,
        timeout_seconds: to_u32("timeout_seconds", row.get("timeout_seconds"))?,
        run_after: parse_ts(&run_after_raw)?,
        created_at: parse_ts(&created_at_raw)?,
        updated_at: parse_ts(&updated_at_raw)?,
        started_at: parse_opt_ts(row.get("started_at"))?,
        heartbeat_at: parse_opt_ts(row.get("heartbeat_at"))?,
        finished_at: parse_opt_ts(row.get("finished_at"))?,
        worker_id: row.get("worker_id"),
        repair_attempted_at: parse_opt_ts(row.get("repair_attempted_at"))?,
        failure_class: parse_class(row.get("failure_class"))?,
        reason_code: row.get("reason_code"),
        error_summary: row.get("error_summary"),
        last_exit_code: last_exit_code.and_then(|c| i32::try_from(c).ok()),
    })
}

pub(super) fn row_to_attempt(row: &SqliteRow) -> Result<AttemptRecord> {
    let started_at_raw: String = row.get("started_at");
    let finished_at_raw: String = row.get("finished_at");
    let duration_ms: i64 = row.get("duration_ms");
    let exit_code: Option<i64> = row.get("exit_code");
    let classifier_version: Option<i64> = row.get("classifier_version");
    let usage_status_raw: String = row.get("usage_status");
    let usage_source_raw: String = row.get("usage_source");

    let usage = TokenUsage {
        prompt_tokens: to_u64(row.get("prompt_tokens")),
        completion_tokens: to_u64(row.get("completion_tokens")),
        total_tokens: to_u64(row.get("total_tokens")),
        status: usage_status_raw.parse().unwrap_or(UsageStatus::Unknown),
        source: usage_source_raw.parse().unwrap_or(UsageSource::None),
        parser_version: row.get("usage_parser_version"),
    };

    Ok(AttemptRecord {
        attempt_id: row.get("attempt_id"),
        task_id: row.get("task_id"),
        attempt_no: to_u32("attempt_no", row.get("attempt_no"))?,
        worker_id: row.get("worker_id"),
        agent: row.get("agent"),
        profile: row.get("profile"),
        model: row.get("model"),
        started_at: parse_ts(&started_at_raw)?,
        finished_at: parse_ts(&finished_at_raw)?,
        duration_ms: u64::try_from(duration_ms).unwrap_or_default(),
        exit_code: exit_code.and_then(|c| i32::try_from(c).ok()),
        timed_out: row.get("timed_out"),
        failure_class: parse_class(row.get("failure_class"))?,
        reason_code: row.get("reason_code"),
        error_summary: row.get("error_summary"),
        classifier_version: classifier_version.and_then(|v| u32::try_from(v).ok()),
        matched_rule: row.get("matched_rule"),
        matched_pattern: row.get("matched_pattern"),
        command_template_hash: row.get("command_template_hash"),
        stdout_preview: row.get("stdout_preview"),
        stderr_preview: row.get("stderr_preview"),
        usage,
        estimated_cost_usd: row.get("estimated_cost_usd"),
        output_recovery: row.get("output_recovery"),
        repair_outcome: row.get("repair_outcome"),
    })
}

pub(super) fn row_to_event(row: &SqliteRow) -> Result<TaskEvent> {
    let status_from: Option<String> = row.get("status_from");
    let status_to: Option<String> = row.get("status_to");
    let details_raw: String = row.get("details");
    let created_at_raw: String = row.get("created_at");

    Ok(TaskEvent {
        event_id: row.get("event_id"),
        task_id: row.get("task_id"),
        event_type: row.get("event_type"),
        status_from: status_from.as_deref().map(parse_status).transpose()?,
        status_to: status_to.as_deref().map(parse_status).transpose()?,
        details: parse_json("details", &details_raw)?,
        created_at: parse_ts(&created_at_raw)?,
    })
}

pub(super) fn row_to_artifact(row: &SqliteRow) -> Result<Artifact> {
    let blocks_raw: String = row.get("blocks");
    let metadata_raw: String = row.get("metadata");
    let created_at_raw: String = row.get("created_at");
    let blocks: Vec<OutputBlock> = parse_json("blocks", &blocks_raw)?;
    let metadata: Map<String, Value> = parse_json("metadata", &metadata_raw)?;

    Ok(Artifact {
        task_id: row.get("task_id"),
        attempt_no: to_u32("attempt_no", row.get("attempt_no"))?,
        output: AgentOutput { blocks, metadata },
        created_at: parse_ts(&created_at_raw)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_are_fixed_width_and_sortable() {
        let a = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let b = a + chrono::Duration::microseconds(1);
        assert_eq!(ts(a), "2026-01-02T03:04:05.000000Z");
        assert!(ts(a) < ts(b));
        assert_eq!(parse_ts(&ts(b)).unwrap(), b);
    }

    #[test]
    fn bad_timestamp_is_corrupt() {
        let err = parse_ts("yesterday").unwrap_err();
        assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::Corrupt(_))));
    }
}
