use super::TaskStore;
use super::codec::{ATTEMPT_COLUMNS, row_to_artifact, row_to_attempt, row_to_event};
use super::types::{Artifact, AttemptRecord, CostSummaryRow, TaskEvent};
use anyhow::{Context, Result};
use sqlx::Row;

impl TaskStore {
    pub async fn list_attempts(&self, task_id: &str) -> Result<Vec<AttemptRecord>> {
        let sql = format!("SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE task_id = ? ORDER BY attempt_no ASC");
        let rows = sqlx::query(&sql)
            .bind(task_id)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to list attempts of task {task_id}"))?;
        rows.iter().map(row_to_attempt).collect()
    }

    /// Oldest first, in write order.
    pub async fn list_events(&self, task_id: &str) -> Result<Vec<TaskEvent>> {
        let rows = sqlx::query(
            "SELECT event_id, task_id, event_type, status_from, status_to, details, created_at
             FROM events WHERE task_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to list events of task {task_id}"))?;
        rows.iter().map(row_to_event).collect()
    }

    pub async fn get_artifact(&self, task_id: &str) -> Result<Option<Artifact>> {
        let row = sqlx::query(
            "SELECT task_id, attempt_no, blocks, metadata, created_at FROM artifacts WHERE task_id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to load artifact of task {task_id}"))?;
        row.as_ref().map(row_to_artifact).transpose()
    }

    /// Estimated spend per agent and model across all recorded attempts.
    /// Attempts without an estimate are counted but add nothing to the total.
    pub async fn cost_summary(&self) -> Result<Vec<CostSummaryRow>> {
        let rows = sqlx::query(
            "SELECT agent, model,
                    COUNT(*) AS attempts,
                    SUM(CASE WHEN estimated_cost_usd IS NULL THEN 1 ELSE 0 END) AS unknown_cost_attempts,
                    COALESCE(SUM(estimated_cost_usd), 0.0) AS total_cost_usd,
                    COALESCE(SUM(prompt_tokens), 0) AS prompt_tokens,
                    COALESCE(SUM(completion_tokens), 0) AS completion_tokens,
                    COALESCE(SUM(total_tokens), 0) AS total_tokens
             FROM attempts
             GROUP BY agent, model
             ORDER BY agent ASC, model ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to summarize costs")?;

        let count = |row: &sqlx::sqlite::SqliteRow, column: &str| -> u64 {
            u64::try_from(row.get::<i64, _>(column)).unwrap_or_default()
        };
        Ok(rows
            .iter()
            .map(|row| CostSummaryRow {
                agent: row.get("agent"),
                model: row.get("model"),
                attempts: count(row, "attempts"),
                unknown_cost_attempts: count(row, "unknown_cost_attempts"),
                total_cost_usd: row.get("total_cost_usd"),
                prompt_tokens: count(row, "prompt_tokens"),
                completion_tokens: count(row, "completion_tokens"),
                total_tokens: count(row, "total_tokens"),
            })
            .collect())
    }
}
