use crate::contract::{AgentOutput, ArticleIndexEntry};
use crate::failure::FailureClass;
use crate::usage::TokenUsage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_db(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        value.parse().ok()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

pub const ROUTING_SCHEMA_VERSION: u32 = 1;

/// Agent invocation resolved once and frozen on the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    #[serde(default = "default_routing_schema")]
    pub schema_version: u32,
    pub agent: String,
    pub profile: String,
    pub model: String,
    pub command_template: String,
    /// "enqueue" or "worker_fallback"
    pub resolved_by: String,
}

fn default_routing_schema() -> u32 {
    ROUTING_SCHEMA_VERSION
}

/// Request to enqueue a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Generated when absent.
    pub task_id: Option<String>,
    pub task_type: String,
    pub prompt: String,
    pub metadata: Map<String, Value>,
    pub articles: Vec<ArticleIndexEntry>,
    pub routing: Option<Routing>,
    /// Lower runs first.
    pub priority: i64,
    pub max_attempts: u32,
    pub timeout_seconds: u32,
    pub run_after: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            task_id: None,
            task_type: task_type.into(),
            prompt: prompt.into(),
            metadata: Map::new(),
            articles: Vec::new(),
            routing: None,
            priority: 100,
            max_attempts: 3,
            timeout_seconds: 600,
            run_after: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub task_id: String,
    pub task_type: String,
    pub prompt: String,
    pub metadata: Map<String, Value>,
    pub articles: Vec<ArticleIndexEntry>,
    pub routing: Option<Routing>,
    pub status: TaskStatus,
    pub priority: i64,
    /// Number of the current (or last) attempt; 0 before the first claim.
    pub attempt: u32,
    pub max_attempts: u32,
    pub timeout_seconds: u32,
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub repair_attempted_at: Option<DateTime<Utc>>,
    pub failure_class: Option<FailureClass>,
    pub reason_code: Option<String>,
    pub error_summary: Option<String>,
    pub last_exit_code: Option<i32>,
}

impl Task {
    pub fn allowed_source_ids(&self) -> BTreeSet<String> {
        self.articles.iter().map(|a| a.source_id.clone()).collect()
    }
}

/// One finished execution of a task. Written once; never updated.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub attempt_id: String,
    pub task_id: String,
    pub attempt_no: u32,
    pub worker_id: Option<String>,
    pub agent: String,
    pub profile: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// `None` means the attempt succeeded.
    pub failure_class: Option<FailureClass>,
    pub reason_code: Option<String>,
    pub error_summary: Option<String>,
    pub classifier_version: Option<u32>,
    pub matched_rule: Option<String>,
    pub matched_pattern: Option<String>,
    pub command_template_hash: Option<String>,
    pub stdout_preview: String,
    pub stderr_preview: String,
    pub usage: TokenUsage,
    pub estimated_cost_usd: Option<f64>,
    /// Parser tag when the result was salvaged from stdout.
    pub output_recovery: Option<String>,
    /// "not_needed", "recovered", "repaired", "repair_failed", "skipped"
    pub repair_outcome: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub event_id: String,
    pub task_id: String,
    pub event_type: String,
    pub status_from: Option<TaskStatus>,
    pub status_to: Option<TaskStatus>,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

/// Output committed with a succeeded task.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub task_id: String,
    pub attempt_no: u32,
    pub output: AgentOutput,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The same attempt was committed before; nothing changed.
    AlreadyCommitted,
}

/// Next state of a task whose attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub enum FailurePlan {
    Retry {
        run_after: DateTime<Utc>,
        timeout_seconds: u32,
    },
    Terminal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureCommit {
    pub failure_class: FailureClass,
    pub reason_code: String,
    pub error_summary: String,
    pub exit_code: Option<i32>,
    pub plan: FailurePlan,
    pub details: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Requeued,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredTask {
    pub task_id: String,
    pub observed_worker_id: Option<String>,
    pub attempt: u32,
    /// `false` when the retry budget was exhausted and the task failed.
    pub requeued: bool,
}

/// Aggregated attempt cost per agent and model.
#[derive(Debug, Clone, PartialEq)]
pub struct CostSummaryRow {
    pub agent: String,
    pub model: String,
    pub attempts: u64,
    pub unknown_cost_attempts: u64,
    pub total_cost_usd: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Pending tasks are bucketed by priority in this order.
pub const PRIORITY_BANDS: [&str; 4] = ["0-49", "50-99", "100-199", "200+"];

/// Queue health over a time window.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStats {
    pub since: DateTime<Utc>,
    /// task type -> status -> count, pending and running tasks only
    pub active: BTreeMap<String, BTreeMap<String, u64>>,
    /// Non-empty bands of [`PRIORITY_BANDS`], in band order.
    pub queued_priority_bands: Vec<(&'static str, u64)>,
    /// Tasks created inside the window.
    pub window_tasks: u64,
    pub terminal_status: BTreeMap<String, u64>,
    /// Failure class of window tasks that ended failed.
    pub failure_classes: BTreeMap<String, u64>,
    pub first_pass: FirstPassStats,
    pub repair: RepairStats,
    pub retries: Vec<RetryClassStats>,
    /// task type -> created-to-finished latency in seconds
    pub latency: BTreeMap<String, Percentiles>,
    pub attempts: AttemptStats,
}

/// Output validation of each attempt's first agent run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirstPassStats {
    pub checked: u64,
    pub passed: u64,
    /// failure class -> count
    pub failures: BTreeMap<String, u64>,
}

impl FirstPassStats {
    /// Source-mapping failures still produced schema-valid output.
    pub fn schema_valid_rate(&self) -> Option<f64> {
        let mapping = self.failures.get("source_mapping_failed").copied().unwrap_or(0);
        ratio(self.passed + mapping, self.checked)
    }

    pub fn pass_rate(&self) -> Option<f64> {
        ratio(self.passed, self.checked)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairStats {
    pub attempted: u64,
    pub succeeded: u64,
}

impl RepairStats {
    pub fn success_rate(&self) -> Option<f64> {
        ratio(self.succeeded, self.attempted)
    }
}

/// Retries scheduled for one failure class and how many of those tasks
/// have since succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryClassStats {
    pub failure_class: String,
    pub scheduled: u64,
    pub succeeded_after_retry: u64,
}

impl RetryClassStats {
    pub fn success_ratio(&self) -> Option<f64> {
        ratio(self.succeeded_after_retry, self.scheduled)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Percentiles {
    pub samples: u64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl Percentiles {
    pub fn from_samples(mut values: Vec<f64>) -> Self {
        values.sort_by(f64::total_cmp);
        Self {
            samples: u64::try_from(values.len()).unwrap_or(u64::MAX),
            p50: percentile(&values, 0.50),
            p90: percentile(&values, 0.90),
            p95: percentile(&values, 0.95),
            p99: percentile(&values, 0.99),
        }
    }
}

/// Attempts started inside the window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptStats {
    pub total: u64,
    pub failed: u64,
    pub failure_classes: BTreeMap<String, u64>,
    pub reason_codes: BTreeMap<String, u64>,
    /// Agent run time in milliseconds.
    pub duration_ms: Percentiles,
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

/// Linear interpolation between the closest ranks of `sorted`.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted {
        [] => 0.0,
        [only] => *only,
        _ => {
            #[allow(clippy::cast_precision_loss)]
            let rank = (sorted.len() - 1) as f64 * q.clamp(0.0, 1.0);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let lower = rank.floor() as usize;
            let upper = (lower + 1).min(sorted.len() - 1);
            let weight = rank - rank.floor();
            sorted[lower] * (1.0 - weight) + sorted[upper] * weight
        }
    }
}
