use crate::backend::render::{OsFamily, TemplateValues, render_command};
use crate::error::ConfigError;
use crate::usage::PriceTable;
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

pub const SUPPORTED_AGENTS: [&str; 3] = ["codex", "claude", "gemini"];
pub const SUPPORTED_PROFILES: [&str; 2] = ["fast", "quality"];

/// `~/.agentq`, or `.agentq` in the working directory when no home exists.
pub fn default_agentq_dir() -> PathBuf {
    UserDirs::new().map_or_else(
        || PathBuf::from(".agentq"),
        |u| u.home_dir().join(".agentq"),
    )
}

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to config.toml - computed, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub pricing: PricingConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub classifier: ClassifierConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: default_agentq_dir().join("config.toml"),
            store: StoreConfig::default(),
            worker: WorkerConfig::default(),
            routing: RoutingConfig::default(),
            pricing: PricingConfig::default(),
            observability: ObservabilityConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl Config {
    /// Reject configurations the worker could not run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()?;
        self.worker.validate()?;
        self.routing.validate()?;
        self.pricing.price_table()?;
        Ok(())
    }
}

// ── Store ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file (default: ~/.agentq/agentq.db)
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> PathBuf {
    default_agentq_dir().join("agentq.db")
}

fn default_max_connections() -> u32 {
    4
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StoreConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.db_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation("store.db_path must not be empty".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Validation("store.max_connections must be >= 1".into()));
        }
        Ok(())
    }
}

// ── Worker ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub poll_interval_seconds: u64,
    /// A running task whose heartbeat is older than this is reclaimed.
    pub stale_after_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub graceful_shutdown_seconds: u64,
    /// Non-zero exit codes treated as transient when no text rule matches.
    pub transient_exit_codes: Vec<i32>,
    pub retry_base_seconds: u64,
    pub retry_max_seconds: u64,
    pub timeout_retry_multiplier: f64,
    pub timeout_retry_cap_seconds: u32,
    pub preview_chars: usize,
    pub workdir_root: PathBuf,
    /// Defaults applied at enqueue when the caller does not set them.
    pub default_timeout_seconds: u32,
    pub default_max_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-default".into(),
            poll_interval_seconds: 2,
            stale_after_seconds: 1_800,
            heartbeat_interval_seconds: 30,
            graceful_shutdown_seconds: 30,
            transient_exit_codes: vec![137, 143],
            retry_base_seconds: 30,
            retry_max_seconds: 900,
            timeout_retry_multiplier: 1.5,
            timeout_retry_cap_seconds: 1_800,
            preview_chars: 1_200,
            workdir_root: default_agentq_dir().join("workdir"),
            default_timeout_seconds: 600,
            default_max_attempts: 3,
        }
    }
}

impl WorkerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_id.trim().is_empty() {
            return Err(ConfigError::Validation("worker.worker_id must not be empty".into()));
        }
        if self.heartbeat_interval_seconds == 0 {
            return Err(ConfigError::Validation(
                "worker.heartbeat_interval_seconds must be >= 1".into(),
            ));
        }
        if self.heartbeat_interval_seconds >= self.stale_after_seconds {
            return Err(ConfigError::Validation(
                "worker.heartbeat_interval_seconds must be < worker.stale_after_seconds".into(),
            ));
        }
        if !self.timeout_retry_multiplier.is_finite() || self.timeout_retry_multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "worker.timeout_retry_multiplier must be >= 1.0".into(),
            ));
        }
        if self.default_timeout_seconds == 0 || self.default_max_attempts == 0 {
            return Err(ConfigError::Validation(
                "worker.default_timeout_seconds and worker.default_max_attempts must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

// ── Routing ──────────────────────────────────────────────────────

/// How one agent is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRoute {
    /// Placeholders: `{model}`, `{prompt}`, `{prompt_file}`, `{task_manifest}`
    pub command_template: String,
    /// profile -> model id
    #[serde(default)]
    pub models: BTreeMap<String, String>,
}

impl AgentRoute {
    fn new(command_template: &str, fast: &str, quality: &str) -> Self {
        Self {
            command_template: command_template.into(),
            models: BTreeMap::from([
                ("fast".to_string(), fast.to_string()),
                ("quality".to_string(), quality.to_string()),
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub default_agent: String,
    /// task type -> profile; unknown task types run on "fast"
    pub task_type_profiles: BTreeMap<String, String>,
    pub agents: BTreeMap<String, AgentRoute>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let task_type_profiles = [("highlights", "fast"), ("story", "quality"), ("qa", "fast")]
            .into_iter()
            .map(|(t, p)| (t.to_string(), p.to_string()))
            .collect();

        let agents = BTreeMap::from([
            (
                "codex".to_string(),
                AgentRoute::new(
                    "codex exec --sandbox workspace-write --model {model} \
                     \"Read your task from {prompt_file} and execute it.\"",
                    "gpt-5.2",
                    "gpt-5.2",
                ),
            ),
            (
                "claude".to_string(),
                AgentRoute::new(
                    "claude -p --model {model} --permission-mode dontAsk \
                     --allowed-tools \"Read,Write,Edit\" \
                     -- \"Read your task from {prompt_file} and execute it.\"",
                    "sonnet",
                    "opus",
                ),
            ),
            (
                "gemini".to_string(),
                AgentRoute::new(
                    "gemini --model {model} --approval-mode auto_edit \
                     --prompt \"Read your task from {prompt_file} and execute it.\"",
                    "gemini-2.5-flash",
                    "gemini-2.5-pro",
                ),
            ),
        ]);

        Self {
            default_agent: "codex".into(),
            task_type_profiles,
            agents,
        }
    }
}

impl RoutingConfig {
    pub fn agent(&self, name: &str) -> Option<&AgentRoute> {
        self.agents.get(name)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let default_agent = self.default_agent.trim().to_lowercase();
        if !SUPPORTED_AGENTS.contains(&default_agent.as_str()) {
            return Err(ConfigError::Validation(format!(
                "routing.default_agent {:?} is not one of codex, claude, gemini",
                self.default_agent
            )));
        }
        if !self.agents.contains_key(&default_agent) {
            return Err(ConfigError::Validation(format!(
                "routing.agents has no entry for default agent {default_agent:?}"
            )));
        }
        for (task_type, profile) in &self.task_type_profiles {
            if !SUPPORTED_PROFILES.contains(&profile.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "routing.task_type_profiles.{task_type}: unsupported profile {profile:?}"
                )));
            }
        }

        let placeholders = TemplateValues {
            model: "m",
            prompt: "p",
            prompt_file: "f",
            task_manifest: "t",
        };
        for (agent, route) in &self.agents {
            if route.command_template.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "routing.agents.{agent}.command_template must not be empty"
                )));
            }
            render_command(&route.command_template, &placeholders, OsFamily::current()).map_err(|e| {
                ConfigError::Validation(format!("routing.agents.{agent}.command_template: {e}"))
            })?;
            for (profile, model) in &route.models {
                if model.trim().is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "routing.agents.{agent}.models.{profile} must not be empty"
                    )));
                }
            }
        }
        Ok(())
    }
}

// ── Pricing ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Comma-separated `agent:model:input_per_million:output_per_million`
    /// rows. `*` matches any agent or model.
    pub table: String,
}

impl PricingConfig {
    pub fn price_table(&self) -> Result<PriceTable, ConfigError> {
        PriceTable::parse(&self.table)
            .map_err(|e| ConfigError::Validation(format!("pricing.table: {e}")))
    }
}

// ── Observability ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// "none" | "log"
    pub backend: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            backend: "log".into(),
        }
    }
}

// ── Failure classifier ───────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// agent -> extra "model unavailable" phrases, checked before the
    /// generic model rule
    pub extra_model_unavailable: HashMap<String, Vec<String>>,
}
