use anyhow::{Context, Result};
use sqlx::SqlitePool;

const STATEMENTS: &[(&str, &str)] = &[
    (
        "tasks table",
        "CREATE TABLE IF NOT EXISTS tasks (
            task_id             TEXT PRIMARY KEY,
            task_type           TEXT NOT NULL,
            prompt              TEXT NOT NULL,
            metadata            TEXT NOT NULL DEFAULT '{}',
            articles            TEXT NOT NULL DEFAULT '[]',
            routing             TEXT,
            status              TEXT NOT NULL,
            priority            INTEGER NOT NULL DEFAULT 100,
            attempt             INTEGER NOT NULL DEFAULT 0,
            max_attempts        INTEGER NOT NULL DEFAULT 3,
            timeout_seconds     INTEGER NOT NULL DEFAULT 600,
            run_after           TEXT NOT NULL,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL,
            started_at          TEXT,
            heartbeat_at        TEXT,
            finished_at         TEXT,
            worker_id           TEXT,
            repair_attempted_at TEXT,
            failure_class       TEXT,
            reason_code         TEXT,
            error_summary       TEXT,
            last_exit_code      INTEGER
        )",
    ),
    (
        "tasks claim index",
        "CREATE INDEX IF NOT EXISTS idx_tasks_claim
            ON tasks(status, priority, run_after, created_at)",
    ),
    (
        "attempts table",
        "CREATE TABLE IF NOT EXISTS attempts (
            attempt_id            TEXT PRIMARY KEY,
            task_id               TEXT NOT NULL REFERENCES tasks(task_id),
            attempt_no            INTEGER NOT NULL,
            worker_id             TEXT,
            agent                 TEXT NOT NULL,
            profile               TEXT NOT NULL,
            model                 TEXT NOT NULL,
            started_at            TEXT NOT NULL,
            finished_at           TEXT NOT NULL,
            duration_ms           INTEGER NOT NULL DEFAULT 0,
            exit_code             INTEGER,
            timed_out             INTEGER NOT NULL DEFAULT 0,
            failure_class         TEXT,
            reason_code           TEXT,
            error_summary         TEXT,
            classifier_version    INTEGER,
            matched_rule          TEXT,
            matched_pattern       TEXT,
            command_template_hash TEXT,
            stdout_preview        TEXT NOT NULL DEFAULT '',
            stderr_preview        TEXT NOT NULL DEFAULT '',
            prompt_tokens         INTEGER,
            completion_tokens     INTEGER,
            total_tokens          INTEGER,
            usage_status          TEXT NOT NULL DEFAULT 'unknown',
            usage_source          TEXT NOT NULL DEFAULT 'none',
            usage_parser_version  TEXT NOT NULL DEFAULT '',
            estimated_cost_usd    REAL,
            output_recovery       TEXT,
            repair_outcome        TEXT,
            UNIQUE(task_id, attempt_no)
        )",
    ),
    (
        "events table",
        "CREATE TABLE IF NOT EXISTS events (
            event_id    TEXT PRIMARY KEY,
            task_id     TEXT NOT NULL REFERENCES tasks(task_id),
            event_type  TEXT NOT NULL,
            status_from TEXT,
            status_to   TEXT,
            details     TEXT NOT NULL DEFAULT '{}',
            created_at  TEXT NOT NULL
        )",
    ),
    (
        "events index",
        "CREATE INDEX IF NOT EXISTS idx_events_task ON events(task_id, created_at)",
    ),
    (
        "artifacts table",
        "CREATE TABLE IF NOT EXISTS artifacts (
            task_id    TEXT PRIMARY KEY REFERENCES tasks(task_id),
            attempt_no INTEGER NOT NULL,
            blocks     TEXT NOT NULL,
            metadata   TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        )",
    ),
];

pub(super) async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    for (label, sql) in STATEMENTS {
        sqlx::query(sql)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to create {label}"))?;
    }
    Ok(())
}
