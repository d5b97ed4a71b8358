mod env_overrides;
mod loader;
pub mod schema;
#[cfg(test)]
pub(crate) mod test_env;

pub use schema::{
    AgentRoute, ClassifierConfig, Config, ObservabilityConfig, PricingConfig, RoutingConfig,
    SUPPORTED_AGENTS, SUPPORTED_PROFILES, StoreConfig, WorkerConfig, default_agentq_dir,
};

#[cfg(test)]
mod tests {
    use super::test_env::{ENV_LOCK, EnvVarGuard};
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[test]
    fn defaults_are_valid() {
        let c = Config::default();
        c.validate().unwrap();
        assert_eq!(c.worker.worker_id, "worker-default");
        assert_eq!(c.worker.poll_interval_seconds, 2);
        assert_eq!(c.worker.stale_after_seconds, 1_800);
        assert_eq!(c.worker.transient_exit_codes, vec![137, 143]);
        assert_eq!(c.worker.preview_chars, 1_200);
        assert_eq!(c.routing.default_agent, "codex");
        assert_eq!(c.routing.task_type_profiles["story"], "quality");
        assert_eq!(c.routing.task_type_profiles["highlights"], "fast");
        assert_eq!(c.routing.agent("claude").unwrap().models["quality"], "opus");
        assert_eq!(c.observability.backend, "log");
        assert!(c.config_path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn sections_default_when_absent() {
        let c: Config = toml::from_str(
            r#"
            [worker]
            worker_id = "w-7"
            retry_base_seconds = 5
            "#,
        )
        .unwrap();
        assert_eq!(c.worker.worker_id, "w-7");
        assert_eq!(c.worker.retry_base_seconds, 5);
        assert_eq!(c.worker.retry_max_seconds, 900);
        assert_eq!(c.routing.default_agent, "codex");
        assert!(c.pricing.table.is_empty());
    }

    #[test]
    fn validate_rejects_template_without_prompt() {
        let mut c = Config::default();
        c.routing.agents.get_mut("gemini").unwrap().command_template = "gemini --model {model}".into();
        let err = c.validate().unwrap_err().to_string();
        assert!(err.contains("routing.agents.gemini.command_template"), "{err}");
    }

    #[test]
    fn validate_rejects_empty_template() {
        let mut c = Config::default();
        c.routing.agents.get_mut("codex").unwrap().command_template = "   ".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_default_agent() {
        let mut c = Config::default();
        c.routing.default_agent = "copilot".into();
        let err = c.validate().unwrap_err().to_string();
        assert!(err.contains("copilot"), "{err}");
    }

    #[test]
    fn validate_rejects_bad_price_table() {
        let mut c = Config::default();
        c.pricing.table = "codex:gpt-5:1.0".into();
        let err = c.validate().unwrap_err().to_string();
        assert!(err.contains("pricing.table"), "{err}");

        c.pricing.table = "codex:gpt-5:1.0:3.0,*:*:0.5:0.5".into();
        c.validate().unwrap();
        assert_eq!(c.pricing.price_table().unwrap().rows().len(), 2);
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = TempDir::new().unwrap();
        let mut c = Config::default();
        c.config_path = tmp.path().join("nested").join("config.toml");
        c.worker.worker_id = "w-save".into();
        c.pricing.table = "claude:*:3:15".into();
        c.classifier
            .extra_model_unavailable
            .insert("claude".into(), vec!["model retired".into()]);
        c.save().unwrap();

        let loaded = Config::load_from(&c.config_path).unwrap();
        assert_eq!(loaded.worker.worker_id, "w-save");
        assert_eq!(loaded.pricing.table, "claude:*:3:15");
        assert_eq!(loaded.classifier.extra_model_unavailable["claude"], vec!["model retired"]);
        assert_eq!(loaded.config_path, c.config_path);
    }

    #[test]
    fn load_from_rejects_invalid_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[routing]\ndefault_agent = \"nobody\"\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let _lock = env_lock();
        let _db = EnvVarGuard::set("AGENTQ_DB_PATH", "/tmp/agentq-test.db");
        let _worker = EnvVarGuard::set("AGENTQ_WORKER_ID", " w-env ");
        let _agent = EnvVarGuard::set("AGENTQ_DEFAULT_AGENT", "Claude");
        let _pricing = EnvVarGuard::set("AGENTQ_LLM_PRICING", "*:*:1:1");
        let _root = EnvVarGuard::set("AGENTQ_WORKDIR_ROOT", "/tmp/agentq-work");
        let _poll = EnvVarGuard::set("AGENTQ_POLL_INTERVAL", "7");
        let _stale = EnvVarGuard::set("AGENTQ_STALE_AFTER", "600");

        let mut c = Config::default();
        c.apply_env_overrides();
        assert_eq!(c.store.db_path, PathBuf::from("/tmp/agentq-test.db"));
        assert_eq!(c.worker.worker_id, "w-env");
        assert_eq!(c.routing.default_agent, "claude");
        assert_eq!(c.pricing.table, "*:*:1:1");
        assert_eq!(c.worker.workdir_root, PathBuf::from("/tmp/agentq-work"));
        assert_eq!(c.worker.poll_interval_seconds, 7);
        assert_eq!(c.worker.stale_after_seconds, 600);
        c.validate().unwrap();
    }

    #[test]
    fn env_overrides_ignore_empty_and_unparsable() {
        let _lock = env_lock();
        let _db = EnvVarGuard::set("AGENTQ_DB_PATH", "");
        let _worker = EnvVarGuard::unset("AGENTQ_WORKER_ID");
        let _agent = EnvVarGuard::unset("AGENTQ_DEFAULT_AGENT");
        let _pricing = EnvVarGuard::unset("AGENTQ_LLM_PRICING");
        let _root = EnvVarGuard::unset("AGENTQ_WORKDIR_ROOT");
        let _poll = EnvVarGuard::set("AGENTQ_POLL_INTERVAL", "soon");
        let _stale = EnvVarGuard::set("AGENTQ_STALE_AFTER", "0");

        let defaults = Config::default();
        let mut c = Config::default();
        c.apply_env_overrides();
        assert_eq!(c.store.db_path, defaults.store.db_path);
        assert_eq!(c.worker.worker_id, defaults.worker.worker_id);
        assert_eq!(c.worker.poll_interval_seconds, 2);
        assert_eq!(c.worker.stale_after_seconds, 1_800);
    }
}
