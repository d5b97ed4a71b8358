use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for `agentq`.
///
/// Each subsystem defines its own error variant. Library callers can match on
/// these to decide recovery strategy; internal code continues to use
/// `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum AgentqError {
    // ── Config ───────────────────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── Store ───────────────────────────────────────────────────────────
    #[error("store: {0}")]
    Store(#[from] StoreError),

    // ── Backend / agent process ─────────────────────────────────────────
    #[error("backend: {0}")]
    Backend(#[from] BackendError),

    // ── Contract files ──────────────────────────────────────────────────
    #[error("contract: {0}")]
    Contract(#[from] ContractError),

    // ── Command templates ───────────────────────────────────────────────
    #[error("render: {0}")]
    Render(#[from] RenderError),

    // ── Price table ─────────────────────────────────────────────────────
    #[error("pricing: {0}")]
    Pricing(#[from] PricingError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Store errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("task {task_id} is {status}, expected {expected}")]
    InvalidState {
        task_id: String,
        status: String,
        expected: String,
    },

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

// ─── Backend errors ─────────────────────────────────────────────────────────

/// Failure to run the agent at all (as opposed to the agent exiting non-zero).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{message}")]
    Run { message: String, transient: bool },

    #[error("render: {0}")]
    Render(#[from] RenderError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackendError {
    pub fn not_found(head: &str) -> Self {
        Self::Run {
            message: format!("CLI backend command not found: {head}"),
            transient: false,
        }
    }

    /// Whether rerunning the same invocation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Run { transient, .. } => *transient,
            Self::Render(_) => false,
            Self::Other(_) => true,
        }
    }
}

// ─── Contract errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: invalid JSON: {message}")]
    Json { path: String, message: String },

    #[error("{path}: {message}")]
    Invalid { path: String, message: String },
}

// ─── Render errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("command template is empty")]
    EmptyTemplate,

    #[error("command template must contain {{prompt}} or {{prompt_file}}")]
    MissingPrompt,

    #[error("unknown placeholder {{{0}}} in command template")]
    UnknownPlaceholder(String),

    #[error("unterminated placeholder in command template")]
    UnterminatedPlaceholder,

    #[error("unbalanced quotes in command template")]
    UnbalancedQuotes,
}

// ─── Pricing errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq)]
pub enum PricingError {
    #[error("price row {row:?}: {reason}")]
    MalformedRow { row: String, reason: String },
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, AgentqError>;
