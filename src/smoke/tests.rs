use super::*;

fn config_with_codex(template: String) -> Config {
    let mut config = Config::default();
    config.routing.agents.get_mut("codex").unwrap().command_template = template;
    config
}

fn codex_only() -> SmokeOptions {
    SmokeOptions {
        agents: vec!["codex".into()],
        timeout_seconds: 30,
        ..SmokeOptions::default()
    }
}

#[tokio::test]
async fn missing_executable_skips_the_run() {
    let config = config_with_codex("agentq-no-such-agent-binary {prompt_file}".into());
    let results = run_smoke_checks(&config, &codex_only()).await.unwrap();

    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.executable, "agentq-no-such-agent-binary");
    assert!(result.resolved.is_none());
    assert_eq!(result.run, SmokeRun::Skipped);
    assert!(result.error.as_deref().unwrap().contains("not found"));
    assert!(!result.passed());
}

#[tokio::test]
async fn unknown_agent_is_reported() {
    let options = SmokeOptions {
        agents: vec!["Mistral".into()],
        ..SmokeOptions::default()
    };
    let results = run_smoke_checks(&Config::default(), &options).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].agent, "mistral");
    assert!(!results[0].passed());
}

#[cfg(unix)]
mod unix {
    use super::*;
    use tempfile::TempDir;

    fn write_agent(tmp: &TempDir, body: &str) -> String {
        let script = tmp.path().join("agent.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{body}")).unwrap();
        format!("sh {} {{prompt_file}}", script.display())
    }

    #[tokio::test]
    async fn skip_run_only_resolves_the_executable() {
        let tmp = TempDir::new().unwrap();
        let config = config_with_codex(write_agent(&tmp, "exit 1\n"));
        let options = SmokeOptions {
            skip_run: true,
            ..codex_only()
        };
        let results = run_smoke_checks(&config, &options).await.unwrap();
        assert_eq!(results[0].executable, "sh");
        assert!(results[0].resolved.is_some());
        assert_eq!(results[0].run, SmokeRun::Skipped);
        assert!(results[0].passed());
    }

    #[tokio::test]
    async fn synthetic_task_runs_through_the_worker() {
        let tmp = TempDir::new().unwrap();
        let config = config_with_codex(write_agent(
            &tmp,
            r#"test -s "$1" || exit 9
out="$(dirname "$(dirname "$AGENTQ_TASK_MANIFEST")")/output/agent_result.json"
echo '{"blocks":[{"text":"Smoke check.","source_ids":["smoke-1"]}]}' > "$out"
"#,
        ));
        let results = run_smoke_checks(&config, &codex_only()).await.unwrap();
        assert_eq!(results[0].run, SmokeRun::Passed { blocks: 1 });
        assert!(results[0].passed());
    }

    #[tokio::test]
    async fn failing_agent_fails_the_run() {
        let tmp = TempDir::new().unwrap();
        let config = config_with_codex(write_agent(&tmp, "echo 'unexpected argument' >&2\nexit 3\n"));
        let results = run_smoke_checks(&config, &codex_only()).await.unwrap();
        assert!(matches!(results[0].run, SmokeRun::Failed { .. }));
        assert!(!results[0].passed());
    }

    #[test]
    fn explicit_paths_need_the_executable_bit() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let tool = tmp.path().join("tool");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        let head = tool.display().to_string();

        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert_eq!(resolve_executable(&head), None);
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(resolve_executable(&head), Some(tool));
    }
}

#[test]
fn empty_head_never_resolves() {
    assert_eq!(resolve_executable(""), None);
}
