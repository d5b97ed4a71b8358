use super::FailureClass;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;

/// Bumped whenever rule order or patterns change, so stored attempts stay
/// interpretable against the ruleset that produced them.
pub const CLASSIFIER_VERSION: u32 = 1;

const RULE_TRANSIENT_EXIT_CODE: &str = "transient_exit_code";
const RULE_FALLBACK: &str = "fallback_non_retryable";
const RULE_PROCESS_TIMEOUT: &str = "process_timeout";

/// A compiled text pattern plus the label reported as `matched_pattern`.
#[derive(Debug, Clone)]
struct RulePattern {
    label: String,
    regex: Regex,
}

impl RulePattern {
    /// Case-insensitive phrase, anchored at a word start when it begins
    /// with a word character.
    fn phrase(label: &str) -> Self {
        let anchor = if label.starts_with(|c: char| c.is_alphanumeric() || c == '_') {
            r"\b"
        } else {
            ""
        };
        Self::compile(label, &format!(r"(?i){anchor}{}", regex::escape(label)))
    }

    /// Case-insensitive whole word.
    fn word(label: &str) -> Self {
        Self::compile(label, &format!(r"(?i)\b{}\b", regex::escape(label)))
    }

    fn compile(label: &str, pattern: &str) -> Self {
        Self {
            label: label.to_string(),
            regex: Regex::new(pattern)
                .unwrap_or_else(|e| panic!("invalid classifier pattern {pattern}: {e}")),
        }
    }
}

/// One row of the ordered rule table. First matching row wins.
#[derive(Debug, Clone)]
pub struct ClassifierRule {
    pub name: String,
    pub class: FailureClass,
    /// Restrict the rule to these agents; `None` applies to all.
    pub agents: Option<Vec<String>>,
    patterns: Vec<RulePattern>,
}

impl ClassifierRule {
    fn new(name: &str, class: FailureClass, patterns: Vec<RulePattern>) -> Self {
        Self {
            name: name.to_string(),
            class,
            agents: None,
            patterns,
        }
    }

    fn for_agent(mut self, agent: &str) -> Self {
        self.agents = Some(vec![agent.to_lowercase()]);
        self
    }

    fn applies_to(&self, agent: &str) -> bool {
        self.agents
            .as_ref()
            .is_none_or(|agents| agents.iter().any(|a| a == agent))
    }

    fn first_match(&self, haystack: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|p| p.regex.is_match(haystack))
            .map(|p| p.label.as_str())
    }
}

/// Classifier verdict for one failed invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub failure_class: FailureClass,
    pub matched_rule: String,
    pub matched_pattern: Option<String>,
    pub reason_code: String,
    pub classifier_version: u32,
}

impl Classification {
    fn new(agent: &str, class: FailureClass, rule: &str, pattern: Option<&str>) -> Self {
        Self {
            failure_class: class,
            matched_rule: rule.to_string(),
            matched_pattern: pattern.map(str::to_string),
            reason_code: format!("{agent}_{rule}"),
            classifier_version: CLASSIFIER_VERSION,
        }
    }

    /// Event payload carrying the classifier diagnostics.
    pub fn to_event_details(&self, agent: &str, model: &str) -> serde_json::Value {
        serde_json::json!({
            "classifier_version": self.classifier_version,
            "resolved_agent": agent,
            "resolved_model": model,
            "failure_class": self.failure_class.as_db(),
            "reason_code": self.reason_code,
            "matched_rule": self.matched_rule,
            "matched_pattern": self.matched_pattern,
        })
    }
}

/// Ordered, data-driven failure classifier.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    rules: Vec<ClassifierRule>,
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self {
            rules: builtin_rules(),
        }
    }
}

fn builtin_rules() -> Vec<ClassifierRule> {
    use FailureClass::{BackendNonRetryable, BackendTransient, BillingOrQuota, ModelNotAvailable};
    use RulePattern as P;

    vec![
        ClassifierRule::new(
            "billing_or_quota",
            BillingOrQuota,
            vec![
                P::phrase("quota"),
                P::phrase("resource_exhausted"),
                P::phrase("insufficient"),
                P::phrase("billing"),
                P::phrase("payment"),
                P::phrase("credits"),
                P::phrase("usage limit"),
                P::phrase("exceeded"),
            ],
        ),
        ClassifierRule::new(
            "model_not_available",
            ModelNotAvailable,
            vec![P::phrase("not_found_error")],
        )
        .for_agent("claude"),
        ClassifierRule::new(
            "model_not_available",
            ModelNotAvailable,
            vec![P::phrase("is not found for api version")],
        )
        .for_agent("gemini"),
        ClassifierRule::new(
            "model_not_available",
            ModelNotAvailable,
            vec![
                P::phrase("model is not supported"),
                P::phrase("does not exist or you do not have access"),
                P::word("model_not_found"),
            ],
        )
        .for_agent("codex"),
        ClassifierRule::new(
            "access_or_auth",
            BackendNonRetryable,
            vec![
                P::phrase("unauthorized"),
                P::phrase("forbidden"),
                P::phrase("permission denied"),
                P::phrase("invalid api key"),
                P::phrase("authentication"),
                P::word("auth"),
                P::phrase("restricted token"),
            ],
        ),
        ClassifierRule::new(
            "model_not_available",
            ModelNotAvailable,
            vec![
                P::phrase("model not found"),
                P::phrase("unknown model"),
                P::phrase("unsupported model"),
                P::phrase("invalid model"),
                P::phrase("model is not available"),
                P::phrase("not available in your region"),
                P::word("model_not_found"),
            ],
        ),
        ClassifierRule::new(
            "rate_limit_transient",
            BackendTransient,
            vec![
                P::phrase("too many requests"),
                P::phrase("rate limit"),
                P::phrase("rate_limit"),
                P::word("429"),
                P::phrase("please retry"),
                P::phrase("try again later"),
            ],
        ),
        ClassifierRule::new(
            "generic_transient",
            BackendTransient,
            vec![
                P::phrase("temporarily unavailable"),
                P::phrase("temporary failure"),
                P::phrase("connection reset"),
                P::phrase("network error"),
                P::phrase("could not resolve host"),
                P::word("dns"),
                P::word("503"),
                P::phrase("overloaded"),
            ],
        ),
    ]
}

impl FailureClassifier {
    /// Built-in table plus operator-supplied per-agent "model not available"
    /// phrases, evaluated right after the billing rule.
    pub fn with_model_unavailable_phrases(phrases: &HashMap<String, Vec<String>>) -> Self {
        let mut rules = builtin_rules();
        let mut extra: Vec<_> = phrases
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(agent, list)| {
                ClassifierRule::new(
                    "model_not_available",
                    FailureClass::ModelNotAvailable,
                    list.iter().map(|phrase| RulePattern::phrase(phrase)).collect(),
                )
                .for_agent(agent)
            })
            .collect();
        extra.sort_by(|a, b| a.agents.cmp(&b.agents));
        let billing_end = rules
            .iter()
            .position(|r| r.class != FailureClass::BillingOrQuota)
            .unwrap_or(rules.len());
        rules.splice(billing_end..billing_end, extra);
        Self { rules }
    }

    pub fn rules(&self) -> &[ClassifierRule] {
        &self.rules
    }

    /// Classify a non-zero exit. Text rules run over `stderr + "\n" + stdout`
    /// and take precedence over `transient_exit_codes`.
    pub fn classify(
        &self,
        agent: &str,
        exit_code: i32,
        stdout: &str,
        stderr: &str,
        transient_exit_codes: &[i32],
    ) -> Classification {
        let agent = agent.trim().to_lowercase();
        let haystack = format!("{stderr}\n{stdout}");

        for rule in self.rules.iter().filter(|r| r.applies_to(&agent)) {
            if let Some(pattern) = rule.first_match(&haystack) {
                return Classification::new(&agent, rule.class, &rule.name, Some(pattern));
            }
        }

        if transient_exit_codes.contains(&exit_code) {
            return Classification::new(
                &agent,
                FailureClass::BackendTransient,
                RULE_TRANSIENT_EXIT_CODE,
                None,
            );
        }

        Classification::new(&agent, FailureClass::BackendNonRetryable, RULE_FALLBACK, None)
    }

    /// Classify a hard timeout. A timeout is transient unless the captured
    /// text names a billing, auth or model cause.
    pub fn classify_timeout(&self, agent: &str, stdout: &str, stderr: &str) -> Classification {
        let text_verdict = self.classify(agent, 0, stdout, stderr, &[]);
        if text_verdict.failure_class == FailureClass::BackendTransient
            || text_verdict.matched_rule == RULE_FALLBACK
        {
            let agent = agent.trim().to_lowercase();
            return Classification::new(
                &agent,
                FailureClass::BackendTransient,
                RULE_PROCESS_TIMEOUT,
                None,
            );
        }
        text_verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSIENT: &[i32] = &[137, 143];

    fn classify(agent: &str, exit_code: i32, stdout: &str, stderr: &str) -> Classification {
        FailureClassifier::default().classify(agent, exit_code, stdout, stderr, TRANSIENT)
    }

    #[test]
    fn billing_text_beats_transient_exit_code() {
        let got = classify("gemini", 137, "", "Quota exceeded for this project");
        assert_eq!(got.failure_class, FailureClass::BillingOrQuota);
        assert_eq!(got.matched_rule, "billing_or_quota");
        assert_eq!(got.matched_pattern.as_deref(), Some("quota"));
        assert_eq!(got.reason_code, "gemini_billing_or_quota");
        assert_eq!(got.classifier_version, CLASSIFIER_VERSION);
    }

    #[test]
    fn rate_limit_is_transient() {
        let got = classify("codex", 1, "", "HTTP 429 too many requests, please retry");
        assert_eq!(got.failure_class, FailureClass::BackendTransient);
        assert_eq!(got.matched_rule, "rate_limit_transient");
        assert_eq!(got.reason_code, "codex_rate_limit_transient");
    }

    #[test]
    fn unmatched_text_falls_back_to_non_retryable() {
        let got = classify("codex", 2, "fatal: unsupported syntax in prompt template", "");
        assert_eq!(got.failure_class, FailureClass::BackendNonRetryable);
        assert_eq!(got.matched_rule, "fallback_non_retryable");
        assert_eq!(got.matched_pattern, None);
    }

    #[test]
    fn transient_exit_code_applies_only_without_text_match() {
        let got = classify("claude", 143, "", "terminated");
        assert_eq!(got.failure_class, FailureClass::BackendTransient);
        assert_eq!(got.matched_rule, "transient_exit_code");
        assert_eq!(got.matched_pattern, None);
        assert_eq!(got.reason_code, "claude_transient_exit_code");
    }

    #[test]
    fn generic_model_phrases_are_detected() {
        let got = classify("claude", 1, "", "Invalid model requested");
        assert_eq!(got.failure_class, FailureClass::ModelNotAvailable);
        assert_eq!(got.reason_code, "claude_model_not_available");
    }

    #[test]
    fn agent_specific_model_rule_only_applies_to_its_agent() {
        let stderr = "404 models/gemini-9-ultra is not found for API version v1beta";
        let gemini = classify("gemini", 1, "", stderr);
        assert_eq!(gemini.failure_class, FailureClass::ModelNotAvailable);
        assert_eq!(gemini.matched_pattern.as_deref(), Some("is not found for api version"));

        let codex = classify("codex", 1, "", stderr);
        assert_eq!(codex.failure_class, FailureClass::BackendNonRetryable);
    }

    #[test]
    fn auth_failures_are_non_retryable() {
        let got = classify("codex", 1, "", "401 Unauthorized: invalid api key");
        assert_eq!(got.failure_class, FailureClass::BackendNonRetryable);
        assert_eq!(got.matched_rule, "access_or_auth");
        assert_eq!(got.reason_code, "codex_access_or_auth");
    }

    #[test]
    fn bare_numbers_inside_words_do_not_match() {
        let got = classify("codex", 1, "request id 14290 failed", "");
        assert_eq!(got.matched_rule, "fallback_non_retryable");
    }

    #[test]
    fn billing_rule_precedes_rate_limit_rule() {
        let got = classify("codex", 1, "rate limit reached", "billing hard limit");
        assert_eq!(got.failure_class, FailureClass::BillingOrQuota);
    }

    #[test]
    fn timeout_defaults_to_transient() {
        let got = FailureClassifier::default().classify_timeout("codex", "working...", "");
        assert_eq!(got.failure_class, FailureClass::BackendTransient);
        assert_eq!(got.matched_rule, "process_timeout");
        assert_eq!(got.reason_code, "codex_process_timeout");
    }

    #[test]
    fn timeout_with_billing_text_keeps_billing_class() {
        let got = FailureClassifier::default().classify_timeout("codex", "", "usage limit reached");
        assert_eq!(got.failure_class, FailureClass::BillingOrQuota);
    }

    #[test]
    fn extra_phrases_run_after_billing_and_before_generic_rules() {
        let mut extra = HashMap::new();
        extra.insert("claude".to_string(), vec!["please switch to a supported tier".to_string()]);
        let classifier = FailureClassifier::with_model_unavailable_phrases(&extra);
        assert_eq!(classifier.rules()[0].name, "billing_or_quota");
        assert_eq!(classifier.rules()[1].agents, Some(vec!["claude".to_string()]));

        let got = classifier.classify("claude", 1, "", "Please switch to a supported tier; try again later", TRANSIENT);
        assert_eq!(got.failure_class, FailureClass::ModelNotAvailable);
    }

    #[test]
    fn extra_phrases_may_start_with_punctuation() {
        let mut extra = HashMap::new();
        extra.insert(
            "gemini".to_string(),
            vec!["(model unavailable)".to_string(), "\"tier-locked\"".to_string()],
        );
        let classifier = FailureClassifier::with_model_unavailable_phrases(&extra);

        let got = classifier.classify("gemini", 1, "", "request rejected (model unavailable)", TRANSIENT);
        assert_eq!(got.failure_class, FailureClass::ModelNotAvailable);
        assert_eq!(got.matched_pattern.as_deref(), Some("(model unavailable)"));

        let got = classifier.classify("gemini", 1, "", "error: \"tier-locked\" for this key", TRANSIENT);
        assert_eq!(got.failure_class, FailureClass::ModelNotAvailable);
    }

    #[test]
    fn word_phrases_still_require_a_word_start() {
        let mut extra = HashMap::new();
        extra.insert("gemini".to_string(), vec!["locked tier".to_string()]);
        let classifier = FailureClassifier::with_model_unavailable_phrases(&extra);
        let got = classifier.classify("gemini", 1, "", "unlocked tier granted", TRANSIENT);
        assert_ne!(got.failure_class, FailureClass::ModelNotAvailable);
    }

    #[test]
    fn event_details_carry_diagnostics() {
        let got = classify("claude", 1, "", "model not found");
        let details = got.to_event_details("claude", "sonnet");
        assert_eq!(details["classifier_version"], 1);
        assert_eq!(details["resolved_model"], "sonnet");
        assert_eq!(details["matched_rule"], "model_not_available");
        assert_eq!(details["failure_class"], "model_not_available");
    }
}
