//! Preflight checks for configured agents: the command template renders,
//! its executable is on `PATH`, and one synthetic task makes it through the
//! worker end to end.

#[cfg(test)]
mod tests;

use crate::backend::{OsFamily, TemplateValues, render_command};
use crate::config::Config;
use crate::contract::ArticleIndexEntry;
use crate::observability::NoopObserver;
use crate::store::{NewTask, TaskStore};
use crate::worker::{Disposition, RoutingOverrides, Worker, resolve_for_enqueue};
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const SMOKE_TASK_TYPE: &str = "smoke";
pub const SMOKE_SOURCE_ID: &str = "smoke-1";
const SMOKE_PROMPT: &str = "Write exactly one block that restates the title of the single \
     listed source in one sentence, citing that source.";

#[derive(Debug, Clone)]
pub struct SmokeOptions {
    /// Agents to check; empty checks every configured agent.
    pub agents: Vec<String>,
    /// Stop after the template and executable checks.
    pub skip_run: bool,
    pub timeout_seconds: u32,
}

impl Default for SmokeOptions {
    fn default() -> Self {
        Self {
            agents: Vec::new(),
            skip_run: false,
            timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmokeRun {
    Skipped,
    Passed { blocks: usize },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSmokeResult {
    pub agent: String,
    /// Executable token of the rendered template; empty when it did not render.
    pub executable: String,
    pub resolved: Option<PathBuf>,
    pub run: SmokeRun,
    pub error: Option<String>,
}

impl AgentSmokeResult {
    pub fn passed(&self) -> bool {
        self.error.is_none() && !matches!(self.run, SmokeRun::Failed { .. })
    }
}

pub async fn run_smoke_checks(config: &Config, options: &SmokeOptions) -> Result<Vec<AgentSmokeResult>> {
    let wanted: Vec<String> = options.agents.iter().map(|a| a.trim().to_lowercase()).collect();
    let mut results = Vec::new();
    for (agent, route) in &config.routing.agents {
        if !wanted.is_empty() && !wanted.contains(agent) {
            continue;
        }
        let mut result = AgentSmokeResult {
            agent: agent.clone(),
            executable: String::new(),
            resolved: None,
            run: SmokeRun::Skipped,
            error: None,
        };

        let placeholders = TemplateValues {
            model: "smoke-model",
            prompt: SMOKE_PROMPT,
            prompt_file: "prompt.txt",
            task_manifest: "task_manifest.json",
        };
        let rendered = match render_command(&route.command_template, &placeholders, OsFamily::current()) {
            Ok(rendered) => rendered,
            Err(e) => {
                result.error = Some(format!("command template: {e}"));
                results.push(result);
                continue;
            }
        };
        result.executable.clone_from(&rendered.head);
        result.resolved = resolve_executable(&rendered.head);
        if result.resolved.is_none() {
            result.error = Some(format!("executable not found: {}", rendered.head));
        } else if !options.skip_run {
            result.run = run_synthetic_task(config, agent, options.timeout_seconds).await;
        }
        tracing::info!(agent = %agent, passed = result.passed(), "smoke.checked");
        results.push(result);
    }
    for agent in wanted {
        if !config.routing.agents.contains_key(&agent) {
            results.push(AgentSmokeResult {
                error: Some(format!("no routing entry for agent {agent:?}")),
                agent,
                executable: String::new(),
                resolved: None,
                run: SmokeRun::Skipped,
            });
        }
    }
    Ok(results)
}

/// Enqueue one task into a throwaway store and let a worker run it.
async fn run_synthetic_task(config: &Config, agent: &str, timeout_seconds: u32) -> SmokeRun {
    let root = std::env::temp_dir().join(format!("agentq-smoke-{}", Uuid::new_v4()));
    let run = match synthetic_task(config, agent, timeout_seconds, &root).await {
        Ok(run) => run,
        Err(e) => SmokeRun::Failed {
            reason: format!("{e:#}"),
        },
    };
    if let Err(e) = tokio::fs::remove_dir_all(&root).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %root.display(), error = %e, "failed to remove smoke directory");
    }
    run
}

async fn synthetic_task(config: &Config, agent: &str, timeout_seconds: u32, root: &Path) -> Result<SmokeRun> {
    let mut config = config.clone();
    config.store.db_path = root.join("smoke.db");
    config.worker.workdir_root = root.join("workdir");
    config.worker.worker_id = format!("smoke-{agent}");

    let store = TaskStore::open(&config.store).await?;
    let overrides = RoutingOverrides {
        agent: Some(agent.to_string()),
        ..RoutingOverrides::default()
    };
    let mut task = NewTask::new(SMOKE_TASK_TYPE, SMOKE_PROMPT);
    task.routing = Some(resolve_for_enqueue(&config.routing, SMOKE_TASK_TYPE, &overrides)?);
    task.max_attempts = 1;
    task.timeout_seconds = timeout_seconds;
    task.articles = vec![ArticleIndexEntry::new(
        SMOKE_SOURCE_ID,
        "Agent queue smoke check",
        "https://example.invalid/agentq-smoke",
    )];
    store.enqueue(task).await?;

    let worker = Worker::new(Arc::new(config), store.clone(), CancellationToken::new())?
        .with_observer(Arc::new(NoopObserver));
    let outcome = worker.run_once().await;
    store.close().await;

    Ok(match outcome?.map(|o| o.disposition) {
        Some(Disposition::Succeeded { blocks }) => SmokeRun::Passed { blocks },
        Some(Disposition::Failed { reason_code, .. }) => SmokeRun::Failed { reason: reason_code },
        Some(Disposition::Retried { failure_class, .. }) => SmokeRun::Failed {
            reason: failure_class.as_db().to_string(),
        },
        Some(Disposition::Lost) => SmokeRun::Failed {
            reason: "task ownership lost".into(),
        },
        None => SmokeRun::Failed {
            reason: "synthetic task was not claimed".into(),
        },
    })
}

/// Locate `head` the way a shell would: paths are checked directly, bare
/// names are searched on `PATH`.
pub fn resolve_executable(head: &str) -> Option<PathBuf> {
    let candidate = Path::new(head);
    if head.is_empty() {
        return None;
    }
    if candidate.is_absolute() || candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).find_map(|dir| executable_in(&dir, head))
}

fn executable_in(dir: &Path, name: &str) -> Option<PathBuf> {
    let path = dir.join(name);
    if is_executable(&path) {
        return Some(path);
    }
    if cfg!(windows) {
        for ext in ["exe", "cmd", "bat"] {
            let path = path.with_extension(ext);
            if is_executable(&path) {
                return Some(path);
            }
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
