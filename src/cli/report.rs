use crate::smoke::{AgentSmokeResult, SmokeRun};
use crate::store::QueueStats;
use std::collections::BTreeMap;

fn ratio(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.2}%", v * 100.0))
}

fn key_values(values: &BTreeMap<String, u64>) -> String {
    if values.is_empty() {
        return "none".into();
    }
    values
        .iter()
        .map(|(key, n)| format!("{key}={n}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Operator-facing queue health for `agentq stats`.
pub fn stats_lines(stats: &QueueStats, hours: u32) -> Vec<String> {
    let active = stats
        .active
        .iter()
        .flat_map(|(task_type, statuses)| {
            statuses
                .iter()
                .map(move |(status, n)| format!("{task_type}/{status}={n}"))
        })
        .collect::<Vec<_>>();
    let bands = stats
        .queued_priority_bands
        .iter()
        .map(|(band, n)| format!("{band}={n}"))
        .collect::<Vec<_>>();

    let mut lines = vec![
        format!("Queue health (window={hours}h)"),
        format!(
            "Backlog: {}",
            if active.is_empty() { "empty".to_string() } else { active.join(" ") }
        ),
        format!(
            "Queued priority bands: {}",
            if bands.is_empty() { "none".to_string() } else { bands.join(" ") }
        ),
        format!("Window tasks: {}", stats.window_tasks),
        format!("Terminal status: {}", key_values(&stats.terminal_status)),
        format!("Failure classes: {}", key_values(&stats.failure_classes)),
        format!(
            "First-pass validation: checked={} pass_rate={} schema_valid_rate={} failures: {}",
            stats.first_pass.checked,
            ratio(stats.first_pass.pass_rate()),
            ratio(stats.first_pass.schema_valid_rate()),
            key_values(&stats.first_pass.failures)
        ),
        format!(
            "Repair: attempted={} succeeded={} rate={}",
            stats.repair.attempted,
            stats.repair.succeeded,
            ratio(stats.repair.success_rate())
        ),
    ];

    if stats.retries.is_empty() {
        lines.push("Retries: none".into());
    } else {
        lines.push("Retries:".into());
        for retry in &stats.retries {
            lines.push(format!(
                "  failure_class={} scheduled={} succeeded_after_retry={} success_ratio={}",
                retry.failure_class,
                retry.scheduled,
                retry.succeeded_after_retry,
                ratio(retry.success_ratio())
            ));
        }
    }

    if stats.latency.is_empty() {
        lines.push("Latency: none".into());
    } else {
        lines.push("Latency (created -> finished):".into());
        for (task_type, p) in &stats.latency {
            lines.push(format!(
                "  task_type={task_type} n={} p50={:.2}s p90={:.2}s p99={:.2}s",
                p.samples, p.p50, p.p90, p.p99
            ));
        }
    }

    let attempts = &stats.attempts;
    if attempts.total == 0 {
        lines.push("Attempts: none".into());
    } else {
        lines.push(format!(
            "Attempts: total={} failed={} duration p50={:.0}ms p95={:.0}ms",
            attempts.total, attempts.failed, attempts.duration_ms.p50, attempts.duration_ms.p95
        ));
        lines.push(format!("Attempt failure classes: {}", key_values(&attempts.failure_classes)));
        lines.push(format!("Attempt reason codes: {}", key_values(&attempts.reason_codes)));
    }
    lines
}

pub fn smoke_line(result: &AgentSmokeResult) -> String {
    let mark = if result.passed() { "✓" } else { "✗" };
    let resolved = result
        .resolved
        .as_ref()
        .map_or_else(|| "-".to_string(), |p| p.display().to_string());
    let run = match &result.run {
        SmokeRun::Skipped => "run skipped".to_string(),
        SmokeRun::Passed { blocks } => format!("run ok ({blocks} block(s))"),
        SmokeRun::Failed { reason } => format!("run failed: {reason}"),
    };
    match &result.error {
        Some(error) => format!("{mark} {}: {error}", result.agent),
        None => format!("{mark} {}: {} [{resolved}] {run}", result.agent, result.executable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        AttemptStats, FirstPassStats, Percentiles, RepairStats, RetryClassStats,
    };
    use chrono::Utc;
    use std::path::PathBuf;

    fn empty_stats() -> QueueStats {
        QueueStats {
            since: Utc::now(),
            active: BTreeMap::new(),
            queued_priority_bands: Vec::new(),
            window_tasks: 0,
            terminal_status: BTreeMap::new(),
            failure_classes: BTreeMap::new(),
            first_pass: FirstPassStats::default(),
            repair: RepairStats::default(),
            retries: Vec::new(),
            latency: BTreeMap::new(),
            attempts: AttemptStats::default(),
        }
    }

    #[test]
    fn empty_window_renders_placeholders() {
        let lines = stats_lines(&empty_stats(), 24);
        assert_eq!(lines[0], "Queue health (window=24h)");
        assert!(lines.contains(&"Backlog: empty".to_string()));
        assert!(lines.contains(&"Retries: none".to_string()));
        assert!(lines.contains(&"Attempts: none".to_string()));
        assert!(lines.iter().any(|l| l.contains("pass_rate=n/a")));
    }

    #[test]
    fn populated_stats_render_ratios_and_percentiles() {
        let mut stats = empty_stats();
        stats
            .active
            .entry("highlights".into())
            .or_default()
            .insert("pending".into(), 3);
        stats.queued_priority_bands = vec![("100-199", 3)];
        stats.retries = vec![RetryClassStats {
            failure_class: "backend_transient".into(),
            scheduled: 4,
            succeeded_after_retry: 3,
        }];
        stats
            .latency
            .insert("highlights".into(), Percentiles::from_samples(vec![1.0, 3.0]));
        stats.attempts = AttemptStats {
            total: 2,
            failed: 1,
            duration_ms: Percentiles::from_samples(vec![100.0, 300.0]),
            ..AttemptStats::default()
        };

        let lines = stats_lines(&stats, 6);
        assert!(lines.contains(&"Backlog: highlights/pending=3".to_string()));
        assert!(lines.contains(&"Queued priority bands: 100-199=3".to_string()));
        assert!(lines.contains(
            &"  failure_class=backend_transient scheduled=4 succeeded_after_retry=3 success_ratio=75.00%"
                .to_string()
        ));
        assert!(lines.contains(&"  task_type=highlights n=2 p50=2.00s p90=2.80s p99=2.98s".to_string()));
        assert!(lines.contains(&"Attempts: total=2 failed=1 duration p50=200ms p95=290ms".to_string()));
    }

    #[test]
    fn smoke_lines_show_errors_or_run_result() {
        let ok = AgentSmokeResult {
            agent: "codex".into(),
            executable: "codex".into(),
            resolved: Some(PathBuf::from("/usr/bin/codex")),
            run: SmokeRun::Passed { blocks: 1 },
            error: None,
        };
        assert_eq!(smoke_line(&ok), "✓ codex: codex [/usr/bin/codex] run ok (1 block(s))");

        let missing = AgentSmokeResult {
            resolved: None,
            run: SmokeRun::Skipped,
            error: Some("executable not found: codex".into()),
            ..ok
        };
        assert_eq!(smoke_line(&missing), "✗ codex: executable not found: codex");
    }
}
