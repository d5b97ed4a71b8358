use super::commands::{Cli, Commands};
use super::report::{smoke_line, stats_lines};
use crate::config::Config;
use crate::contract::{ArticleIndexEntry, ArticlesIndex};
use crate::smoke::{SmokeOptions, run_smoke_checks};
use crate::store::{NewTask, Task, TaskStatus, TaskStore};
use crate::worker::{Disposition, RoutingOverrides, TaskOutcome, Worker, resolve_for_enqueue};
use anyhow::{Context, Result, anyhow};
use chrono::{TimeDelta, Utc};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Load, override and validate configuration for one invocation.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = match explicit {
        Some(path) => Config::load_from(path)?,
        None => Config::load_or_init()?,
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

pub async fn dispatch(cli: Cli) -> Result<()> {
    let config = Arc::new(load_config(cli.config.as_deref())?);
    let store = TaskStore::open(&config.store).await?;

    let result = match cli.command {
        Commands::Enqueue {
            task_type,
            prompt,
            sources,
            agent,
            profile,
            model,
            priority,
            max_attempts,
            timeout,
        } => {
            let overrides = RoutingOverrides {
                agent,
                profile,
                model,
            };
            let routing = resolve_for_enqueue(&config.routing, &task_type, &overrides)?;
            let mut task = NewTask::new(task_type, prompt);
            task.articles = read_sources(&sources)?;
            task.routing = Some(routing);
            task.priority = priority;
            task.max_attempts = max_attempts.unwrap_or(config.worker.default_max_attempts);
            task.timeout_seconds = timeout.unwrap_or(config.worker.default_timeout_seconds);

            let task = store.enqueue(task).await?;
            info!(task_id = %task.task_id, "task.enqueued");
            println!("{}", task.task_id);
            Ok(())
        }
        Commands::Worker {
            once,
            max_tasks,
            max_idle_polls,
        } => run_worker(Arc::clone(&config), store.clone(), once, max_tasks, max_idle_polls).await,
        Commands::List { status, limit } => {
            let status = status
                .as_deref()
                .map(|raw| {
                    TaskStatus::from_db(raw.trim()).ok_or_else(|| {
                        anyhow!("unknown status {raw:?}; use pending, running, succeeded or failed")
                    })
                })
                .transpose()?;
            for task in store.list_tasks(status, limit).await? {
                println!("{}", task_line(&task));
            }
            Ok(())
        }
        Commands::Show { task_id } => show_task(&store, &task_id).await,
        Commands::Retry { task_id } => {
            let task = store.retry_task(&task_id).await?;
            println!(
                "{} requeued (attempt {}/{})",
                task.task_id, task.attempt, task.max_attempts
            );
            Ok(())
        }
        Commands::Costs => {
            let rows = store.cost_summary().await?;
            if rows.is_empty() {
                println!("No attempts recorded.");
            }
            for row in rows {
                println!(
                    "{:<8} {:<24} attempts={:<5} unknown_cost={:<5} tokens={:<10} cost=${:.4}",
                    row.agent,
                    row.model,
                    row.attempts,
                    row.unknown_cost_attempts,
                    row.total_tokens,
                    row.total_cost_usd
                );
            }
            Ok(())
        }
        Commands::Stats { hours } => {
            let since = Utc::now() - TimeDelta::hours(i64::from(hours));
            let stats = store.stats(since).await?;
            for line in stats_lines(&stats, hours) {
                println!("{line}");
            }
            Ok(())
        }
        Commands::Smoke {
            agents,
            skip_run,
            timeout,
        } => {
            let options = SmokeOptions {
                agents,
                skip_run,
                timeout_seconds: timeout.max(1),
            };
            let results = run_smoke_checks(&config, &options).await?;
            for result in &results {
                println!("{}", smoke_line(result));
            }
            let failed = results.iter().filter(|r| !r.passed()).count();
            if failed > 0 {
                Err(anyhow!("{failed} of {} agent smoke check(s) failed", results.len()))
            } else {
                Ok(())
            }
        }
    };

    store.close().await;
    result
}

/// Accepts either `{"articles": [...]}` or a bare array of entries.
fn read_sources(path: &Path) -> Result<Vec<ArticleIndexEntry>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read sources file {}", path.display()))?;
    if let Ok(index) = serde_json::from_str::<ArticlesIndex>(&raw) {
        return Ok(index.articles);
    }
    serde_json::from_str::<Vec<ArticleIndexEntry>>(&raw)
        .with_context(|| format!("Sources file {} is not an article list", path.display()))
}

async fn run_worker(
    config: Arc<Config>,
    store: TaskStore,
    once: bool,
    max_tasks: Option<u64>,
    max_idle_polls: Option<u64>,
) -> Result<()> {
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal.cancel();
        }
    });

    let worker = Worker::new(config, store, shutdown)?;
    let result = if once {
        match worker.run_once().await? {
            Some(outcome) => println!("{}", outcome_line(&outcome)),
            None => println!("No task was due."),
        }
        Ok(())
    } else {
        let summary = worker.run_loop(max_tasks, max_idle_polls).await?;
        println!(
            "processed={} succeeded={} failed={} retried={} timeouts={} stale_recovered={}",
            summary.processed,
            summary.succeeded,
            summary.failed,
            summary.retried,
            summary.timeouts,
            summary.stale_recovered
        );
        Ok(())
    };
    ctrl_c.abort();
    result
}

async fn show_task(store: &TaskStore, task_id: &str) -> Result<()> {
    let task = store
        .get_task(task_id)
        .await?
        .ok_or_else(|| anyhow!("task {task_id} not found"))?;
    println!("{}", task_line(&task));
    if let Some(routing) = &task.routing {
        println!(
            "  routing: {}/{}/{} ({})",
            routing.agent, routing.profile, routing.model, routing.resolved_by
        );
    }
    if let Some(summary) = &task.error_summary {
        println!("  error: {summary}");
    }

    println!("attempts:");
    for attempt in store.list_attempts(task_id).await? {
        let class = attempt.failure_class.map_or("ok", |c| c.as_db());
        let cost = attempt
            .estimated_cost_usd
            .map_or_else(|| "unknown".to_string(), |c| format!("${c:.4}"));
        println!(
            "  #{} {} {}/{} exit={} {}ms cost={} repair={}",
            attempt.attempt_no,
            class,
            attempt.agent,
            attempt.model,
            attempt
                .exit_code
                .map_or_else(|| "-".to_string(), |c| c.to_string()),
            attempt.duration_ms,
            cost,
            attempt.repair_outcome.as_deref().unwrap_or("-"),
        );
    }

    println!("events:");
    for event in store.list_events(task_id).await? {
        println!(
            "  {} {} {}",
            event.created_at.to_rfc3339(),
            event.event_type,
            event.details
        );
    }

    if let Some(artifact) = store.get_artifact(task_id).await? {
        println!("artifact (attempt {}):", artifact.attempt_no);
        println!("{}", serde_json::to_string_pretty(&artifact.output)?);
    }
    Ok(())
}

fn task_line(task: &Task) -> String {
    let class = task.failure_class.map_or("", |c| c.as_db());
    format!(
        "{:<36} {:<10} {:<10} attempt {}/{} {}",
        task.task_id,
        task.task_type,
        task.status.as_db(),
        task.attempt,
        task.max_attempts,
        class
    )
}

fn outcome_line(outcome: &TaskOutcome) -> String {
    let what = match &outcome.disposition {
        Disposition::Succeeded { blocks } => format!("succeeded with {blocks} block(s)"),
        Disposition::Retried {
            failure_class,
            run_after,
        } => format!("retry after {} ({})", run_after.to_rfc3339(), failure_class.as_db()),
        Disposition::Failed {
            failure_class,
            reason_code,
        } => format!("failed: {} ({reason_code})", failure_class.as_db()),
        Disposition::Lost => "lost ownership".to_string(),
    };
    format!("{} attempt {}: {what}", outcome.task_id, outcome.attempt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sources_accept_index_or_array() {
        let tmp = TempDir::new().unwrap();
        let index = tmp.path().join("index.json");
        std::fs::write(
            &index,
            r#"{"articles":[{"source_id":"a1","title":"T","url":"https://e.com"}]}"#,
        )
        .unwrap();
        assert_eq!(read_sources(&index).unwrap()[0].source_id, "a1");

        let array = tmp.path().join("array.json");
        std::fs::write(&array, r#"[{"source_id":"b2","title":"T","url":"https://e.com"}]"#).unwrap();
        assert_eq!(read_sources(&array).unwrap()[0].source_id, "b2");

        let broken = tmp.path().join("broken.json");
        std::fs::write(&broken, "{").unwrap();
        assert!(read_sources(&broken).is_err());
    }

    #[test]
    fn outcome_lines_name_the_disposition() {
        let outcome = TaskOutcome {
            task_id: "t-1".into(),
            attempt: 2,
            timed_out: false,
            disposition: Disposition::Failed {
                failure_class: crate::failure::FailureClass::BillingOrQuota,
                reason_code: "codex_billing_or_quota".into(),
            },
        };
        assert_eq!(
            outcome_line(&outcome),
            "t-1 attempt 2: failed: billing_or_quota (codex_billing_or_quota)"
        );
    }
}
