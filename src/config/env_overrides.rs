use super::Config;
use super::loader::expand_path;

impl Config {
    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("AGENTQ_DB_PATH")
            && !path.is_empty()
        {
            self.store.db_path = expand_path(&path);
        }

        if let Ok(worker_id) = std::env::var("AGENTQ_WORKER_ID")
            && !worker_id.trim().is_empty()
        {
            self.worker.worker_id = worker_id.trim().to_string();
        }

        if let Ok(agent) = std::env::var("AGENTQ_DEFAULT_AGENT")
            && !agent.trim().is_empty()
        {
            self.routing.default_agent = agent.trim().to_lowercase();
        }

        if let Ok(table) = std::env::var("AGENTQ_LLM_PRICING")
            && !table.is_empty()
        {
            self.pricing.table = table;
        }

        if let Ok(root) = std::env::var("AGENTQ_WORKDIR_ROOT")
            && !root.is_empty()
        {
            self.worker.workdir_root = expand_path(&root);
        }

        if let Ok(raw) = std::env::var("AGENTQ_POLL_INTERVAL")
            && let Ok(seconds) = raw.trim().parse::<u64>()
        {
            self.worker.poll_interval_seconds = seconds;
        }

        if let Ok(raw) = std::env::var("AGENTQ_STALE_AFTER")
            && let Ok(seconds) = raw.trim().parse::<u64>()
            && seconds > 0
        {
            self.worker.stale_after_seconds = seconds;
        }
    }
}
