//! Durable task queue backed by SQLite.
//!
//! Every state transition is a single conditional `UPDATE` guarded by the
//! expected status (and, for running tasks, the owning worker and attempt
//! number), so concurrent workers sharing one database file never observe or
//! produce a half-applied transition. Lifecycle events are written in the
//! same transaction as the transition they describe.

mod codec;
mod history;
mod schema;
mod stats;
mod tasks;
pub mod types;


pub use types::{
    Artifact, AttemptRecord, AttemptStats, CommitOutcome, CostSummaryRow, FailureCommit,
    FailureOutcome, FailurePlan, FirstPassStats, NewTask, PRIORITY_BANDS, Percentiles,
    QueueStats, ROUTING_SCHEMA_VERSION, RecoveredTask, RepairStats, RetryClassStats, Routing,
    Task, TaskEvent, TaskStatus,
};

use crate::config::StoreConfig;
use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let db_path = config.db_path.as_path();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create store directory: {}", parent.display()))?;
        }

        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let options = SqliteConnectOptions::from_str(&url)
            .with_context(|| format!("Invalid store path: {}", db_path.display()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open task store: {}", db_path.display()))?;

        schema::ensure_schema(&pool).await?;
        tracing::debug!(path = %db_path.display(), "store.opened");
        Ok(Self { pool })
    }

    /// Open with default pool settings; used by tools and tests.
    pub async fn open_path(db_path: &Path) -> Result<Self> {
        Self::open(&StoreConfig {
            db_path: db_path.to_path_buf(),
            ..StoreConfig::default()
        })
        .await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
