use crate::error::BackendError;
use crate::failure::{Classification, FailureClass};
use crate::output::ValidationFailure;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

/// What happened to one claimed task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub task_id: String,
    pub attempt: u32,
    /// The runner had to stop the agent.
    pub timed_out: bool,
    pub disposition: Disposition,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Succeeded {
        blocks: usize,
    },
    Retried {
        failure_class: FailureClass,
        run_after: DateTime<Utc>,
    },
    Failed {
        failure_class: FailureClass,
        reason_code: String,
    },
    /// Another actor (stale recovery) took the task over mid-run; nothing
    /// was committed.
    Lost,
}

/// Totals over a `run_loop` invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerRunSummary {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub timeouts: u64,
    pub idle_polls: u64,
    pub stale_recovered: u64,
}

impl WorkerRunSummary {
    pub(super) fn absorb(&mut self, outcome: &TaskOutcome) {
        self.processed += 1;
        if outcome.timed_out {
            self.timeouts += 1;
        }
        match outcome.disposition {
            Disposition::Succeeded { .. } => self.succeeded += 1,
            Disposition::Retried { .. } => self.retried += 1,
            Disposition::Failed { .. } => self.failed += 1,
            Disposition::Lost => {}
        }
    }
}

/// A failed attempt resolved into one failure class, ready for the store.
#[derive(Debug, Clone)]
pub(super) struct Verdict {
    pub failure_class: FailureClass,
    pub reason_code: String,
    pub summary: String,
    pub matched_rule: Option<String>,
    pub matched_pattern: Option<String>,
    pub classifier_version: Option<u32>,
    pub details: Value,
}

impl Verdict {
    pub(super) fn classified(classification: Classification, summary: String, details: Value) -> Self {
        Self {
            failure_class: classification.failure_class,
            reason_code: classification.reason_code,
            summary,
            matched_rule: Some(classification.matched_rule),
            matched_pattern: classification.matched_pattern,
            classifier_version: Some(classification.classifier_version),
            details,
        }
    }

    /// Contract failures do not depend on the agent, so the validation code
    /// is the reason code as-is.
    pub(super) fn validation(failure: ValidationFailure) -> Self {
        Self {
            failure_class: failure.failure_class,
            reason_code: failure.code.to_string(),
            details: json!({ "validation_code": failure.code }),
            summary: failure.summary,
            matched_rule: None,
            matched_pattern: None,
            classifier_version: None,
        }
    }

    pub(super) fn backend_error(agent: &str, error: &BackendError) -> Self {
        let (failure_class, rule) = match error {
            BackendError::Render(_) => (FailureClass::BackendNonRetryable, "invalid_command_template"),
            e if e.is_transient() => (FailureClass::BackendTransient, "backend_start_failed"),
            _ => (FailureClass::BackendNonRetryable, "backend_start_failed"),
        };
        Self::local(agent, failure_class, rule, error.to_string())
    }

    /// A failure decided by the worker itself rather than the classifier.
    pub(super) fn local(agent: &str, failure_class: FailureClass, rule: &str, summary: String) -> Self {
        Self {
            failure_class,
            reason_code: format!("{agent}_{rule}"),
            details: json!({ "rule": rule, "resolved_agent": agent }),
            summary,
            matched_rule: Some(rule.to_string()),
            matched_pattern: None,
            classifier_version: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(disposition: Disposition, timed_out: bool) -> TaskOutcome {
        TaskOutcome {
            task_id: "t".into(),
            attempt: 1,
            timed_out,
            disposition,
        }
    }

    #[test]
    fn summary_counts_dispositions() {
        let mut summary = WorkerRunSummary::default();
        summary.absorb(&outcome(Disposition::Succeeded { blocks: 1 }, false));
        summary.absorb(&outcome(
            Disposition::Retried {
                failure_class: FailureClass::BackendTransient,
                run_after: Utc::now(),
            },
            true,
        ));
        summary.absorb(&outcome(
            Disposition::Failed {
                failure_class: FailureClass::BillingOrQuota,
                reason_code: "codex_billing".into(),
            },
            false,
        ));
        summary.absorb(&outcome(Disposition::Lost, false));
        assert_eq!(summary.processed, 4);
        assert_eq!((summary.succeeded, summary.retried, summary.failed), (1, 1, 1));
        assert_eq!(summary.timeouts, 1);
    }

    #[test]
    fn backend_errors_map_to_classes() {
        let missing = Verdict::backend_error("codex", &BackendError::not_found("codex"));
        assert_eq!(missing.failure_class, FailureClass::BackendNonRetryable);
        assert_eq!(missing.reason_code, "codex_backend_start_failed");

        let flaky = BackendError::Run {
            message: "EAGAIN".into(),
            transient: true,
        };
        let verdict = Verdict::backend_error("claude", &flaky);
        assert_eq!(verdict.failure_class, FailureClass::BackendTransient);
        assert_eq!(verdict.summary, "EAGAIN");
    }

    #[test]
    fn validation_verdicts_keep_bare_codes() {
        let verdict = Verdict::validation(ValidationFailure {
            failure_class: FailureClass::SourceMappingFailed,
            code: "source_mapping_violation",
            summary: "unknown source id".into(),
        });
        assert_eq!(verdict.reason_code, "source_mapping_violation");
        assert_eq!(verdict.details["validation_code"], "source_mapping_violation");
        assert!(verdict.matched_rule.is_none());
    }
}
