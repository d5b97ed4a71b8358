pub mod cli;
pub mod render;

pub use cli::CliAgentBackend;
pub use render::{
    Invocation, OsFamily, RenderedCommand, TemplateValues, render_command, template_fingerprint,
};

use crate::contract::TaskManifest;
use crate::error::BackendError;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exit code reported when the runner stops the agent itself.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Everything needed to launch one agent invocation.
#[derive(Debug, Clone)]
pub struct BackendRunRequest {
    pub manifest_path: PathBuf,
    pub timeout_seconds: u32,
    pub agent: String,
    pub profile: String,
    pub model: String,
    pub command_template: String,
    pub repair_mode: bool,
    /// Cooperative shutdown signal. Once cancelled the agent gets
    /// `graceful_shutdown_seconds` before it is stopped.
    pub shutdown: CancellationToken,
    pub graceful_shutdown_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRunResult {
    pub exit_code: i32,
    /// The runner stopped the agent: hard timeout or expired shutdown grace.
    pub timed_out: bool,
    /// Stopped because of a shutdown request rather than the hard timeout.
    pub interrupted_by_shutdown: bool,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub duration: Duration,
}

/// Launches and monitors agent processes. Implement for any runner.
///
/// The worker loop only depends on this capability; concrete runners are
/// selected by agent name at composition time.
pub trait AgentBackend: Send + Sync {
    /// Human-readable backend name (e.g. "cli")
    fn name(&self) -> &str;

    /// Run the agent described by the manifest at `request.manifest_path`.
    /// A non-zero exit is a normal result; `Err` means the agent could not
    /// be run at all.
    fn run<'a>(
        &'a self,
        request: &'a BackendRunRequest,
    ) -> Pin<Box<dyn Future<Output = Result<BackendRunResult, BackendError>> + Send + 'a>>;

    /// Optional lifecycle hooks, queried by the worker.
    fn lifecycle(&self) -> Option<&dyn BackendLifecycle> {
        None
    }
}

/// Optional hooks some backends expose around repair re-runs.
pub trait BackendLifecycle: Send + Sync {
    /// Reset per-attempt state before the agent is re-invoked in repair mode.
    fn prepare_repair<'a>(
        &'a self,
        manifest: &'a TaskManifest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;
}
