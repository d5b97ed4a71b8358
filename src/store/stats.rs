use super::TaskStore;
use super::codec::{parse_ts, ts};
use super::types::{
    AttemptStats, FirstPassStats, PRIORITY_BANDS, Percentiles, QueueStats, RepairStats,
    RetryClassStats,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::collections::BTreeMap;

fn count(row: &SqliteRow, column: &str) -> u64 {
    u64::try_from(row.get::<i64, _>(column)).unwrap_or_default()
}

impl TaskStore {
    /// Queue health: current backlog plus what happened since `since`.
    pub async fn stats(&self, since: DateTime<Utc>) -> Result<QueueStats> {
        let since_ts = ts(since);

        let rows = sqlx::query(
            "SELECT task_type, status, COUNT(*) AS n FROM tasks
             WHERE status IN ('pending', 'running')
             GROUP BY task_type, status",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to count active tasks")?;
        let mut active: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for row in &rows {
            active
                .entry(row.get("task_type"))
                .or_default()
                .insert(row.get("status"), count(row, "n"));
        }

        let rows = sqlx::query(
            "SELECT CASE WHEN priority <= 49 THEN 0
                         WHEN priority <= 99 THEN 1
                         WHEN priority <= 199 THEN 2
                         ELSE 3 END AS band,
                    COUNT(*) AS n
             FROM tasks WHERE status = 'pending'
             GROUP BY band ORDER BY band",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to band queued tasks")?;
        let queued_priority_bands = rows
            .iter()
            .filter_map(|row| {
                let band = usize::try_from(row.get::<i64, _>("band")).ok()?;
                Some((*PRIORITY_BANDS.get(band)?, count(row, "n")))
            })
            .collect();

        let rows = sqlx::query(
            "SELECT task_type, status, failure_class, created_at, finished_at
             FROM tasks WHERE created_at >= ?",
        )
        .bind(&since_ts)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load window tasks")?;
        let window_tasks = u64::try_from(rows.len()).unwrap_or(u64::MAX);
        let mut terminal_status: BTreeMap<String, u64> = BTreeMap::new();
        let mut failure_classes: BTreeMap<String, u64> = BTreeMap::new();
        let mut latencies: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for row in &rows {
            let status: String = row.get("status");
            if status != "succeeded" && status != "failed" {
                continue;
            }
            *terminal_status.entry(status.clone()).or_default() += 1;
            if status == "failed"
                && let Some(class) = row.get::<Option<String>, _>("failure_class")
            {
                *failure_classes.entry(class).or_default() += 1;
            }
            if let Some(finished_raw) = row.get::<Option<String>, _>("finished_at") {
                let created_at = parse_ts(row.get::<&str, _>("created_at"))?;
                let finished_at = parse_ts(&finished_raw)?;
                let millis = (finished_at - created_at).num_milliseconds().max(0);
                #[allow(clippy::cast_precision_loss)]
                let seconds = millis as f64 / 1_000.0;
                latencies.entry(row.get("task_type")).or_default().push(seconds);
            }
        }
        let latency = latencies
            .into_iter()
            .map(|(task_type, values)| (task_type, Percentiles::from_samples(values)))
            .collect();

        let rows = sqlx::query(
            "SELECT COALESCE(json_extract(e.details, '$.failure_class'), 'unknown') AS failure_class,
                    COUNT(*) AS scheduled,
                    SUM(CASE WHEN t.status = 'succeeded' THEN 1 ELSE 0 END) AS succeeded
             FROM events e JOIN tasks t ON t.task_id = e.task_id
             WHERE e.event_type = 'retry_scheduled' AND e.created_at >= ?
             GROUP BY 1 ORDER BY 1",
        )
        .bind(&since_ts)
        .fetch_all(&self.pool)
        .await
        .context("Failed to summarize retries")?;
        let retries = rows
            .iter()
            .map(|row| RetryClassStats {
                failure_class: row.get("failure_class"),
                scheduled: count(row, "scheduled"),
                succeeded_after_retry: count(row, "succeeded"),
            })
            .collect();

        let rows = sqlx::query(
            "SELECT COALESCE(json_extract(details, '$.failure_class'), 'unknown') AS failure_class,
                    COUNT(*) AS n
             FROM events
             WHERE event_type = 'first_pass_validation_failed' AND created_at >= ?
             GROUP BY 1",
        )
        .bind(&since_ts)
        .fetch_all(&self.pool)
        .await
        .context("Failed to count validation failures")?;
        let mut first_pass = FirstPassStats {
            failures: rows
                .iter()
                .map(|row| (row.get("failure_class"), count(row, "n")))
                .collect(),
            ..FirstPassStats::default()
        };

        let rows = sqlx::query(
            "SELECT failure_class, reason_code, repair_outcome, duration_ms
             FROM attempts WHERE started_at >= ?",
        )
        .bind(&since_ts)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load window attempts")?;
        let mut attempts = AttemptStats::default();
        let mut repair = RepairStats::default();
        let mut durations = Vec::with_capacity(rows.len());
        for row in &rows {
            attempts.total += 1;
            if let Some(class) = row.get::<Option<String>, _>("failure_class") {
                attempts.failed += 1;
                *attempts.failure_classes.entry(class).or_default() += 1;
            }
            if let Some(code) = row.get::<Option<String>, _>("reason_code") {
                *attempts.reason_codes.entry(code).or_default() += 1;
            }
            match row.get::<Option<&str>, _>("repair_outcome") {
                // Attempts that never produced output to validate carry no outcome.
                None => {}
                Some("not_needed") => {
                    first_pass.checked += 1;
                    first_pass.passed += 1;
                }
                Some(outcome) => {
                    first_pass.checked += 1;
                    if outcome == "repaired" || outcome == "repair_failed" {
                        repair.attempted += 1;
                        repair.succeeded += u64::from(outcome == "repaired");
                    }
                }
            }
            #[allow(clippy::cast_precision_loss)]
            let duration_ms = row.get::<i64, _>("duration_ms").max(0) as f64;
            durations.push(duration_ms);
        }
        attempts.duration_ms = Percentiles::from_samples(durations);

        Ok(QueueStats {
            since,
            active,
            queued_priority_bands,
            window_tasks,
            terminal_status,
            failure_classes,
            first_pass,
            repair,
            retries,
            latency,
            attempts,
        })
    }
}
