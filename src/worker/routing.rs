use crate::config::{RoutingConfig, SUPPORTED_AGENTS, SUPPORTED_PROFILES};
use crate::error::ConfigError;
use crate::store::{ROUTING_SCHEMA_VERSION, Routing};

pub const RESOLVED_BY_ENQUEUE: &str = "enqueue";
pub const RESOLVED_BY_WORKER_FALLBACK: &str = "worker_fallback";

/// Profile used for task types with no configured mapping.
pub const DEFAULT_PROFILE: &str = "fast";

/// Explicit choices supplied at enqueue time.
#[derive(Debug, Clone, Default)]
pub struct RoutingOverrides {
    pub agent: Option<String>,
    pub profile: Option<String>,
    pub model: Option<String>,
}

/// Resolve and freeze the agent invocation for a new task.
pub fn resolve_for_enqueue(
    config: &RoutingConfig,
    task_type: &str,
    overrides: &RoutingOverrides,
) -> Result<Routing, ConfigError> {
    let agent = overrides
        .agent
        .as_deref()
        .map_or_else(|| normalize(&config.default_agent), normalize);
    if !SUPPORTED_AGENTS.contains(&agent.as_str()) {
        return Err(ConfigError::Validation(format!(
            "unsupported agent {agent:?}; use codex, claude or gemini"
        )));
    }
    let route = config
        .agent(&agent)
        .ok_or_else(|| ConfigError::Validation(format!("no routing entry for agent {agent:?}")))?;

    let profile = match overrides.profile.as_deref() {
        Some(profile) => normalize(profile),
        None => config
            .task_type_profiles
            .get(&normalize(task_type))
            .cloned()
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string()),
    };
    if !SUPPORTED_PROFILES.contains(&profile.as_str()) {
        return Err(ConfigError::Validation(format!(
            "unsupported profile {profile:?}; use fast or quality"
        )));
    }

    let model = match overrides.model.as_deref() {
        Some(model) => model.trim().to_string(),
        None => route.models.get(&profile).cloned().unwrap_or_default(),
    };
    if model.is_empty() {
        return Err(ConfigError::Validation(format!(
            "no model resolved for agent {agent:?}, profile {profile:?}"
        )));
    }

    let command_template = route.command_template.trim().to_string();
    if command_template.is_empty() {
        return Err(ConfigError::Validation(format!(
            "command template is empty for agent {agent:?}"
        )));
    }

    Ok(Routing {
        schema_version: ROUTING_SCHEMA_VERSION,
        agent,
        profile,
        model,
        command_template,
        resolved_by: RESOLVED_BY_ENQUEUE.into(),
    })
}

/// Routing to execute a claimed task with. Returns the frozen routing when it
/// is usable, otherwise the configured default plus the reason it was needed.
pub fn resolve_for_execution(
    config: &RoutingConfig,
    task_type: &str,
    frozen: Option<&Routing>,
) -> Result<(Routing, Option<&'static str>), ConfigError> {
    let reason = match frozen {
        Some(routing) if is_usable(routing) => return Ok((routing.clone(), None)),
        Some(_) => "frozen routing is invalid",
        None => "frozen routing is missing",
    };
    let mut fallback = resolve_for_enqueue(config, task_type, &RoutingOverrides::default())?;
    fallback.resolved_by = RESOLVED_BY_WORKER_FALLBACK.into();
    Ok((fallback, Some(reason)))
}

fn is_usable(routing: &Routing) -> bool {
    routing.schema_version == ROUTING_SCHEMA_VERSION
        && SUPPORTED_AGENTS.contains(&routing.agent.as_str())
        && SUPPORTED_PROFILES.contains(&routing.profile.as_str())
        && !routing.model.trim().is_empty()
        && !routing.command_template.trim().is_empty()
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_selects_profile_and_model() {
        let config = RoutingConfig::default();
        let routing = resolve_for_enqueue(&config, "Story", &RoutingOverrides::default()).unwrap();
        assert_eq!(routing.agent, "codex");
        assert_eq!(routing.profile, "quality");
        assert_eq!(routing.model, "gpt-5.2");
        assert_eq!(routing.resolved_by, "enqueue");
        assert!(routing.command_template.contains("{prompt_file}"));
    }

    #[test]
    fn unknown_task_type_runs_fast() {
        let config = RoutingConfig::default();
        let overrides = RoutingOverrides {
            agent: Some(" Claude ".into()),
            ..RoutingOverrides::default()
        };
        let routing = resolve_for_enqueue(&config, "digest", &overrides).unwrap();
        assert_eq!(routing.agent, "claude");
        assert_eq!(routing.profile, "fast");
        assert_eq!(routing.model, "sonnet");
    }

    #[test]
    fn overrides_win() {
        let config = RoutingConfig::default();
        let overrides = RoutingOverrides {
            agent: Some("gemini".into()),
            profile: Some("quality".into()),
            model: Some("gemini-exp".into()),
        };
        let routing = resolve_for_enqueue(&config, "highlights", &overrides).unwrap();
        assert_eq!((routing.agent.as_str(), routing.model.as_str()), ("gemini", "gemini-exp"));
        assert_eq!(routing.profile, "quality");
    }

    #[test]
    fn unsupported_choices_are_rejected() {
        let config = RoutingConfig::default();
        let agent = RoutingOverrides {
            agent: Some("copilot".into()),
            ..RoutingOverrides::default()
        };
        assert!(resolve_for_enqueue(&config, "qa", &agent).is_err());
        let profile = RoutingOverrides {
            profile: Some("turbo".into()),
            ..RoutingOverrides::default()
        };
        assert!(resolve_for_enqueue(&config, "qa", &profile).is_err());
        let model = RoutingOverrides {
            model: Some("  ".into()),
            ..RoutingOverrides::default()
        };
        assert!(resolve_for_enqueue(&config, "qa", &model).is_err());
    }

    #[test]
    fn execution_keeps_valid_frozen_routing() {
        let config = RoutingConfig::default();
        let mut frozen = resolve_for_enqueue(&config, "qa", &RoutingOverrides::default()).unwrap();
        frozen.command_template = "custom-agent {prompt}".into();
        let (routing, reason) = resolve_for_execution(&config, "qa", Some(&frozen)).unwrap();
        assert_eq!(routing, frozen);
        assert!(reason.is_none());
    }

    #[test]
    fn execution_falls_back_when_missing_or_invalid() {
        let config = RoutingConfig::default();
        let (routing, reason) = resolve_for_execution(&config, "story", None).unwrap();
        assert_eq!(routing.resolved_by, "worker_fallback");
        assert_eq!(routing.profile, "quality");
        assert_eq!(reason, Some("frozen routing is missing"));

        let mut stale = routing.clone();
        stale.schema_version = 99;
        let (_, reason) = resolve_for_execution(&config, "story", Some(&stale)).unwrap();
        assert_eq!(reason, Some("frozen routing is invalid"));
    }
}
