use super::render::{Invocation, OsFamily, RenderedCommand, TemplateValues, render_command};
use super::{AgentBackend, BackendLifecycle, BackendRunRequest, BackendRunResult, TIMEOUT_EXIT_CODE};
use crate::contract::{TaskInput, TaskManifest, read_manifest, read_task_input};
use crate::error::BackendError;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How long a terminated agent gets to exit before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

const OUTPUT_SCHEMA_EXAMPLE: &str = r#"{
  "blocks": [
    {"text": "...", "source_ids": ["<source_id from articles_index.json>"]}
  ],
  "metadata": {}
}"#;

/// Runs agents as local subprocesses built from a command template.
///
/// stdout and stderr go straight to the files named in the manifest; the
/// agent inherits the worker's environment plus the `AGENTQ_*` variables.
#[derive(Debug, Default, Clone)]
pub struct CliAgentBackend;

impl CliAgentBackend {
    pub fn new() -> Self {
        Self
    }

    async fn run_agent(&self, request: &BackendRunRequest) -> Result<BackendRunResult, BackendError> {
        let manifest = read_manifest(&request.manifest_path)
            .await
            .map_err(|e| BackendError::Run {
                message: format!("invalid task manifest: {e}"),
                transient: false,
            })?;
        let input = read_task_input(&manifest.task_input_path)
            .await
            .map_err(|e| BackendError::Run {
                message: format!("invalid task input: {e}"),
                transient: false,
            })?;

        let prompt = build_prompt(&manifest, &request.manifest_path, &input, request.repair_mode);
        let prompt_path = manifest.prompt_file_path();
        write_file(&prompt_path, prompt.as_bytes()).await?;

        let manifest_arg = request.manifest_path.display().to_string();
        let prompt_file_arg = prompt_path.display().to_string();
        let values = TemplateValues {
            model: &request.model,
            prompt: &prompt,
            prompt_file: &prompt_file_arg,
            task_manifest: &manifest_arg,
        };
        let rendered = render_command(&request.command_template, &values, OsFamily::current())?;

        let stdout = create_capture(&manifest.output_stdout_path).await?;
        let stderr = create_capture(&manifest.output_stderr_path).await?;

        let mut command = build_command(&rendered)?;
        command
            .current_dir(&manifest.workdir)
            .env("AGENTQ_REPAIR_MODE", if request.repair_mode { "1" } else { "0" })
            .env("AGENTQ_AGENT", &request.agent)
            .env("AGENTQ_MODEL", &request.model)
            .env("AGENTQ_PROFILE", &request.profile)
            .env("AGENTQ_TASK_MANIFEST", &request.manifest_path)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::not_found(&rendered.head));
            }
            Err(e) => {
                return Err(BackendError::Run {
                    message: format!("CLI backend failed to start: {e}"),
                    transient: true,
                });
            }
        };
        tracing::debug!(
            task_id = %manifest.task_id,
            attempt = manifest.attempt,
            agent = %request.agent,
            pid = child.id().unwrap_or_default(),
            repair = request.repair_mode,
            "agent.spawned"
        );

        let deadline = started + Duration::from_secs(u64::from(request.timeout_seconds));
        let grace = Duration::from_secs(request.graceful_shutdown_seconds);
        let waited = wait_for_exit(&mut child, deadline, &request.shutdown, grace)
            .await
            .map_err(|e| BackendError::Run {
                message: format!("failed waiting for agent process: {e}"),
                transient: true,
            })?;

        let (exit_code, timed_out, interrupted_by_shutdown) = match waited {
            Waited::Exited(status) => (exit_code_of(status), false, false),
            Waited::Stopped { by_shutdown } => {
                tracing::warn!(
                    task_id = %manifest.task_id,
                    attempt = manifest.attempt,
                    timeout_seconds = request.timeout_seconds,
                    by_shutdown,
                    "agent stopped before exiting"
                );
                (TIMEOUT_EXIT_CODE, true, by_shutdown)
            }
        };

        Ok(BackendRunResult {
            exit_code,
            timed_out,
            interrupted_by_shutdown,
            stdout_path: manifest.output_stdout_path,
            stderr_path: manifest.output_stderr_path,
            duration: started.elapsed(),
        })
    }
}

impl AgentBackend for CliAgentBackend {
    fn name(&self) -> &str {
        "cli"
    }

    fn run<'a>(
        &'a self,
        request: &'a BackendRunRequest,
    ) -> Pin<Box<dyn Future<Output = Result<BackendRunResult, BackendError>> + Send + 'a>> {
        Box::pin(self.run_agent(request))
    }

    fn lifecycle(&self) -> Option<&dyn BackendLifecycle> {
        Some(self)
    }
}

impl BackendLifecycle for CliAgentBackend {
    /// Drop the previous run's result file so a repair run cannot be judged
    /// on stale output.
    fn prepare_repair<'a>(
        &'a self,
        manifest: &'a TaskManifest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            match tokio::fs::remove_file(&manifest.output_result_path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(anyhow::anyhow!(
                    "failed to clear {}: {e}",
                    manifest.output_result_path.display()
                )),
            }
        })
    }
}

/// The prompt handed to the agent, both inline (`{prompt}`) and as
/// `input/task_prompt.txt` (`{prompt_file}`).
pub fn build_prompt(
    manifest: &TaskManifest,
    manifest_path: &Path,
    input: &TaskInput,
    repair_mode: bool,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(input.prompt.trim());
    prompt.push_str("\n\n");
    prompt.push_str(&format!("Task manifest: {}\n", manifest_path.display()));
    prompt.push_str("Steps:\n");
    prompt.push_str(&format!(
        "1. Read the task input at {}.\n",
        manifest.task_input_path.display()
    ));
    prompt.push_str(&format!(
        "2. Read the citable sources at {}. Cite only their source_id values.\n",
        manifest.articles_index_path.display()
    ));
    prompt.push_str(&format!(
        "3. Write the result as JSON to {}.\n",
        manifest.output_result_path.display()
    ));
    prompt.push_str("Every block needs non-empty text and at least one source_id.\n");
    prompt.push_str("Do not search the web; use only the provided sources.\n\n");
    prompt.push_str("Output schema example:\n");
    prompt.push_str(OUTPUT_SCHEMA_EXAMPLE);
    prompt.push('\n');
    if repair_mode {
        prompt.push_str(
            "\nREPAIR MODE: the previous output was rejected. Rewrite the output file \
             so it is valid JSON matching the schema and cites only listed source_ids.\n",
        );
    }
    prompt
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<(), BackendError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_failure(parent, &e))?;
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| io_failure(path, &e))
}

async fn create_capture(path: &Path) -> Result<Stdio, BackendError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_failure(parent, &e))?;
    }
    let file = tokio::fs::File::create(path)
        .await
        .map_err(|e| io_failure(path, &e))?;
    Ok(Stdio::from(file.into_std().await))
}

fn io_failure(path: &Path, error: &std::io::Error) -> BackendError {
    BackendError::Run {
        message: format!("{}: {error}", path.display()),
        transient: true,
    }
}

fn build_command(rendered: &RenderedCommand) -> Result<Command, BackendError> {
    match &rendered.invocation {
        Invocation::Argv(argv) => {
            let Some((program, args)) = argv.split_first() else {
                return Err(crate::error::RenderError::EmptyTemplate.into());
            };
            let mut command = Command::new(program);
            command.args(args);
            Ok(command)
        }
        #[cfg(windows)]
        Invocation::CommandLine(line) => {
            let (_, rest) = split_command_line(line);
            let mut command = Command::new(&rendered.head);
            command.raw_arg(rest);
            Ok(command)
        }
        #[cfg(not(windows))]
        Invocation::CommandLine(_) => Err(BackendError::Run {
            message: "command-line invocations are only supported on Windows".into(),
            transient: false,
        }),
    }
}

/// Split a Windows command line into its program token and the raw remainder.
#[cfg_attr(not(windows), allow(dead_code))]
fn split_command_line(line: &str) -> (&str, &str) {
    let mut in_quotes = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => return (&line[..i], line[i..].trim_start()),
            _ => {}
        }
    }
    (line, "")
}

enum Waited {
    Exited(ExitStatus),
    Stopped { by_shutdown: bool },
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    Deadline,
    Shutdown,
}

async fn wait_for_exit(
    child: &mut Child,
    deadline: Instant,
    shutdown: &CancellationToken,
    grace: Duration,
) -> std::io::Result<Waited> {
    let wake = tokio::select! {
        status = child.wait() => Wake::Exited(status),
        () = tokio::time::sleep_until(deadline) => Wake::Deadline,
        () = shutdown.cancelled() => Wake::Shutdown,
    };

    match wake {
        Wake::Exited(status) => Ok(Waited::Exited(status?)),
        Wake::Deadline => {
            terminate(child).await;
            Ok(Waited::Stopped { by_shutdown: false })
        }
        Wake::Shutdown => {
            // The hard timeout still bounds the grace window.
            let grace_deadline = (Instant::now() + grace).min(deadline);
            if let Ok(status) = tokio::time::timeout_at(grace_deadline, child.wait()).await {
                return Ok(Waited::Exited(status?));
            }
            terminate(child).await;
            Ok(Waited::Stopped { by_shutdown: true })
        }
    }
}

/// SIGTERM first where available, then a hard kill.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id()
            && let Ok(pid) = libc::pid_t::try_from(pid)
            // SAFETY: `pid` belongs to a child we have not yet reaped.
            && unsafe { libc::kill(pid, libc::SIGTERM) } == 0
            && tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok()
        {
            return;
        }
    }
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "failed to kill agent process");
    }
}

/// Exit code as a shell would report it: `128 + signal` for signal deaths.
fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{ArticleIndexEntry, WorkdirManager};
    use serde_json::Map;
    use tempfile::TempDir;

    async fn materialize(tmp: &TempDir) -> crate::contract::MaterializedTask {
        let manager = WorkdirManager::new(tmp.path().join("work"));
        let input = TaskInput {
            task_type: "highlights".into(),
            prompt: "Summarize today's articles.".into(),
            metadata: Map::new(),
        };
        let articles = vec![ArticleIndexEntry::new("article:1", "Title", "https://example.com/1")];
        manager.materialize("task-1", 1, &input, &articles).await.unwrap()
    }

    fn request(manifest_path: &Path, template: &str, timeout_seconds: u32) -> BackendRunRequest {
        BackendRunRequest {
            manifest_path: manifest_path.to_path_buf(),
            timeout_seconds,
            agent: "codex".into(),
            profile: "fast".into(),
            model: "gpt-test".into(),
            command_template: template.into(),
            repair_mode: false,
            shutdown: CancellationToken::new(),
            graceful_shutdown_seconds: 1,
        }
    }

    #[test]
    fn prompt_names_paths_and_repair_mode() {
        let manifest = TaskManifest {
            contract_version: 2,
            task_id: "t".into(),
            task_type: "qa".into(),
            attempt: 1,
            workdir: "/w".into(),
            task_input_path: "/w/input/task_input.json".into(),
            articles_index_path: "/w/input/articles_index.json".into(),
            output_result_path: "/w/output/agent_result.json".into(),
            output_stdout_path: "/w/output/stdout.log".into(),
            output_stderr_path: "/w/output/stderr.log".into(),
            output_schema_hint: None,
        };
        let input = TaskInput {
            task_type: "qa".into(),
            prompt: "  Answer the question.  ".into(),
            metadata: Map::new(),
        };
        let normal = build_prompt(&manifest, Path::new("/w/meta/task_manifest.json"), &input, false);
        assert!(normal.starts_with("Answer the question.\n"));
        assert!(normal.contains("/w/meta/task_manifest.json"));
        assert!(normal.contains("/w/output/agent_result.json"));
        assert!(normal.contains("Do not search the web"));
        assert!(!normal.contains("REPAIR MODE"));

        let repair = build_prompt(&manifest, Path::new("/w/meta/task_manifest.json"), &input, true);
        assert!(repair.contains("REPAIR MODE"));
    }

    #[test]
    fn command_line_splits_after_quoted_program() {
        assert_eq!(
            split_command_line(r#""C:\Program Files\agent.exe" --flag "a b""#),
            (r#""C:\Program Files\agent.exe""#, r#"--flag "a b""#)
        );
        assert_eq!(split_command_line("agent"), ("agent", ""));
    }

    #[cfg(unix)]
    #[test]
    fn signal_deaths_map_to_shell_codes() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code_of(ExitStatus::from_raw(9)), 137);
        assert_eq!(exit_code_of(ExitStatus::from_raw(3 << 8)), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_code_and_output_files_are_reported() {
        let tmp = TempDir::new().unwrap();
        let task = materialize(&tmp).await;
        let backend = CliAgentBackend::new();
        let req = request(
            &task.manifest_path,
            "sh -c 'echo \"$AGENTQ_AGENT:$AGENTQ_MODEL:$AGENTQ_REPAIR_MODE\"; echo oops >&2; exit 3' {prompt}",
            30,
        );

        let result = backend.run(&req).await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(!result.timed_out);
        let stdout = std::fs::read_to_string(&result.stdout_path).unwrap();
        assert_eq!(stdout.trim(), "codex:gpt-test:0");
        let stderr = std::fs::read_to_string(&result.stderr_path).unwrap();
        assert_eq!(stderr.trim(), "oops");
        assert!(task.manifest.prompt_file_path().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn prompt_file_placeholder_points_at_written_prompt() {
        let tmp = TempDir::new().unwrap();
        let task = materialize(&tmp).await;
        let backend = CliAgentBackend::new();
        let req = request(
            &task.manifest_path,
            "sh -c 'head -n 1 \"$1\"' agent {prompt_file} {prompt}",
            30,
        );

        let result = backend.run(&req).await.unwrap();
        assert_eq!(result.exit_code, 0);
        let stdout = std::fs::read_to_string(&result.stdout_path).unwrap();
        assert_eq!(stdout.trim(), "Summarize today's articles.");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_agent_times_out_with_124() {
        let tmp = TempDir::new().unwrap();
        let task = materialize(&tmp).await;
        let backend = CliAgentBackend::new();
        let req = request(&task.manifest_path, "sh -c 'sleep 30' {prompt}", 1);

        let result = backend.run(&req).await.unwrap();
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.timed_out);
        assert!(!result.interrupted_by_shutdown);
        assert!(result.duration < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_stops_agent_after_grace() {
        let tmp = TempDir::new().unwrap();
        let task = materialize(&tmp).await;
        let backend = CliAgentBackend::new();
        let req = request(&task.manifest_path, "sh -c 'sleep 30' {prompt}", 60);
        req.shutdown.cancel();

        let result = backend.run(&req).await.unwrap();
        assert!(result.timed_out);
        assert!(result.interrupted_by_shutdown);
    }

    #[tokio::test]
    async fn missing_binary_is_not_transient() {
        let tmp = TempDir::new().unwrap();
        let task = materialize(&tmp).await;
        let backend = CliAgentBackend::new();
        let req = request(
            &task.manifest_path,
            "agentq-definitely-missing-binary {prompt}",
            5,
        );

        let err = backend.run(&req).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("agentq-definitely-missing-binary"));
    }

    #[tokio::test]
    async fn template_without_prompt_is_a_render_error() {
        let tmp = TempDir::new().unwrap();
        let task = materialize(&tmp).await;
        let backend = CliAgentBackend::new();
        let req = request(&task.manifest_path, "agent --model {model}", 5);

        let err = backend.run(&req).await.unwrap_err();
        assert!(matches!(err, BackendError::Render(_)));
    }

    #[tokio::test]
    async fn prepare_repair_clears_stale_result() {
        let tmp = TempDir::new().unwrap();
        let task = materialize(&tmp).await;
        std::fs::write(&task.manifest.output_result_path, "{}").unwrap();

        let backend = CliAgentBackend::new();
        let lifecycle = backend.lifecycle().unwrap();
        lifecycle.prepare_repair(&task.manifest).await.unwrap();
        assert!(!task.manifest.output_result_path.exists());
        // Clearing twice is fine.
        lifecycle.prepare_repair(&task.manifest).await.unwrap();
    }
}
