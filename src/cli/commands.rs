use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// `agentq` - durable task queue for CLI agents.
#[derive(Parser, Debug)]
#[command(name = "agentq")]
#[command(version)]
#[command(about = "Run CLI agents as durable, recoverable queue tasks.", long_about = None)]
pub struct Cli {
    /// Config file to use instead of ~/.agentq/config.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Add a task to the queue
    Enqueue {
        /// Task type (selects the routing profile)
        #[arg(long)]
        task_type: String,

        /// Instruction handed to the agent
        #[arg(long)]
        prompt: String,

        /// JSON file with the articles the agent may cite
        #[arg(long)]
        sources: PathBuf,

        /// Agent override (codex, claude, gemini)
        #[arg(long)]
        agent: Option<String>,

        /// Profile override (fast, quality)
        #[arg(long)]
        profile: Option<String>,

        /// Model override
        #[arg(long)]
        model: Option<String>,

        /// Lower runs first
        #[arg(long, default_value = "100")]
        priority: i64,

        #[arg(long)]
        max_attempts: Option<u32>,

        /// Per-attempt timeout in seconds
        #[arg(long)]
        timeout: Option<u32>,
    },

    /// Process queued tasks
    Worker {
        /// Process at most one task, then exit
        #[arg(long)]
        once: bool,

        /// Stop after this many tasks
        #[arg(long)]
        max_tasks: Option<u64>,

        /// Stop after this many consecutive empty polls
        #[arg(long)]
        max_idle_polls: Option<u64>,
    },

    /// List tasks, newest first
    List {
        /// pending, running, succeeded or failed
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show one task with its attempts, events and artifact
    Show { task_id: String },

    /// Send a failed task back to the queue
    Retry { task_id: String },

    /// Estimated spend per agent and model
    Costs,

    /// Queue health: backlog, retry and repair ratios, latency percentiles
    Stats {
        /// Look back this many hours
        #[arg(long, default_value = "24")]
        hours: u32,
    },

    /// Check that configured agents can be found and complete a synthetic task
    Smoke {
        /// Agent to check (repeatable); all configured agents when omitted
        #[arg(long = "agent")]
        agents: Vec<String>,

        /// Only check templates and executables
        #[arg(long)]
        skip_run: bool,

        /// Timeout for the synthetic task in seconds
        #[arg(long, default_value = "120")]
        timeout: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn enqueue_parses_overrides() {
        let cli = Cli::parse_from([
            "agentq",
            "enqueue",
            "--task-type",
            "story",
            "--prompt",
            "Write it up",
            "--sources",
            "articles.json",
            "--agent",
            "claude",
            "--timeout",
            "120",
        ]);
        let Commands::Enqueue {
            task_type,
            agent,
            timeout,
            priority,
            max_attempts,
            ..
        } = cli.command
        else {
            panic!("expected enqueue");
        };
        assert_eq!(task_type, "story");
        assert_eq!(agent.as_deref(), Some("claude"));
        assert_eq!(timeout, Some(120));
        assert_eq!(priority, 100);
        assert_eq!(max_attempts, None);
    }

    #[test]
    fn worker_flags_parse() {
        let cli = Cli::parse_from(["agentq", "worker", "--max-idle-polls", "3"]);
        let Commands::Worker {
            once,
            max_tasks,
            max_idle_polls,
        } = cli.command
        else {
            panic!("expected worker");
        };
        assert!(!once);
        assert_eq!(max_tasks, None);
        assert_eq!(max_idle_polls, Some(3));
    }

    #[test]
    fn stats_and_smoke_parse() {
        let cli = Cli::parse_from(["agentq", "stats", "--hours", "6"]);
        assert!(matches!(cli.command, Commands::Stats { hours: 6 }));

        let cli = Cli::parse_from([
            "agentq", "smoke", "--agent", "codex", "--agent", "claude", "--skip-run",
        ]);
        let Commands::Smoke {
            agents,
            skip_run,
            timeout,
        } = cli.command
        else {
            panic!("expected smoke");
        };
        assert_eq!(agents, vec!["codex", "claude"]);
        assert!(skip_run);
        assert_eq!(timeout, 120);
    }
}
