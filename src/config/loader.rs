use super::Config;
use super::schema::default_agentq_dir;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Expand a leading `~` so config files can use home-relative paths.
pub(super) fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).to_string())
}

impl Config {
    /// Load `~/.agentq/config.toml`, writing the defaults there on first run.
    pub fn load_or_init() -> Result<Self> {
        let agentq_dir = default_agentq_dir();
        let config_path = agentq_dir.join("config.toml");

        if !agentq_dir.exists() {
            fs::create_dir_all(&agentq_dir).context("Failed to create .agentq directory")?;
        }

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Self {
                config_path,
                ..Self::default()
            };
            config.validate()?;
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.config_path = path.to_path_buf();
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        fs::write(&self.config_path, toml_str).context("Failed to write config file")?;
        Ok(())
    }

    fn expand_paths(&mut self) {
        self.store.db_path = expand_path(&self.store.db_path.to_string_lossy());
        self.worker.workdir_root = expand_path(&self.worker.workdir_root.to_string_lossy());
    }
}
