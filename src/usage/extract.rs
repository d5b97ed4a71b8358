use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

pub const USAGE_PARSER_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    /// The agent printed a total.
    Reported,
    /// The total is the sum of reported parts.
    Estimated,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    AgentStdout,
    AgentStderr,
    None,
}

/// Token usage of one agent invocation. Every count may be unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub status: UsageStatus,
    pub source: UsageSource,
    pub parser_version: String,
}

impl TokenUsage {
    pub fn unknown() -> Self {
        Self {
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            status: UsageStatus::Unknown,
            source: UsageSource::None,
            parser_version: USAGE_PARSER_VERSION.to_string(),
        }
    }

    pub fn is_known(&self) -> bool {
        self.prompt_tokens.is_some() || self.completion_tokens.is_some() || self.total_tokens.is_some()
    }

    fn from_parts(
        prompt: Option<u64>,
        completion: Option<u64>,
        total: Option<u64>,
        source: UsageSource,
    ) -> Option<Self> {
        if prompt.is_none() && completion.is_none() && total.is_none() {
            return None;
        }
        let (total, status) = match total {
            Some(total) => (Some(total), UsageStatus::Reported),
            None => (
                Some(prompt.unwrap_or(0) + completion.unwrap_or(0)),
                UsageStatus::Estimated,
            ),
        };
        Some(Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
            status,
            source,
            parser_version: USAGE_PARSER_VERSION.to_string(),
        })
    }
}

struct UsagePatterns {
    json_prompt: Regex,
    json_completion: Regex,
    json_total: Regex,
    text_input: Regex,
    text_output: Regex,
    text_total: Regex,
    tokens_used: Regex,
}

static PATTERNS: LazyLock<UsagePatterns> = LazyLock::new(|| {
    let re = |pattern: &str| {
        Regex::new(pattern).unwrap_or_else(|e| panic!("invalid usage pattern {pattern}: {e}"))
    };
    UsagePatterns {
        json_prompt: re(r#"(?i)"prompt_tokens"\s*:\s*(\d+)"#),
        json_completion: re(r#"(?i)"completion_tokens"\s*:\s*(\d+)"#),
        json_total: re(r#"(?i)"total_tokens"\s*:\s*(\d+)"#),
        text_input: re(r"(?i)input[_ ]tokens?\s*[:=]\s*([\d,]+)"),
        text_output: re(r"(?i)(?:output|completion)[_ ]tokens?\s*[:=]\s*([\d,]+)"),
        text_total: re(r"(?i)total[_ ]tokens?\s*[:=]\s*([\d,]+)"),
        tokens_used: re(r"(?i)tokens used\s*[\r\n ]+\s*([\d,]+)"),
    }
});

fn capture_count(pattern: &Regex, text: &str) -> Option<u64> {
    let raw = pattern.captures(text)?.get(1)?.as_str().replace(',', "");
    raw.parse().ok()
}

/// Best-effort token usage from agent output. JSON-style counters win over
/// prose; stdout wins over stderr.
pub fn extract_usage(stdout: &str, stderr: &str) -> TokenUsage {
    let streams = [(UsageSource::AgentStdout, stdout), (UsageSource::AgentStderr, stderr)];
    let p = &*PATTERNS;

    for (source, text) in streams {
        if let Some(found) = TokenUsage::from_parts(
            capture_count(&p.json_prompt, text),
            capture_count(&p.json_completion, text),
            capture_count(&p.json_total, text),
            source,
        ) {
            return found;
        }
    }

    for (source, text) in streams {
        let total = capture_count(&p.text_total, text).or_else(|| capture_count(&p.tokens_used, text));
        if let Some(found) = TokenUsage::from_parts(
            capture_count(&p.text_input, text),
            capture_count(&p.text_output, text),
            total,
            source,
        ) {
            return found;
        }
    }

    TokenUsage::unknown()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_counters_are_reported() {
        let stdout = r#"{"usage": {"prompt_tokens": 1200, "completion_tokens": 300, "total_tokens": 1500}}"#;
        let usage = extract_usage(stdout, "");
        assert_eq!(usage.prompt_tokens, Some(1200));
        assert_eq!(usage.completion_tokens, Some(300));
        assert_eq!(usage.total_tokens, Some(1500));
        assert_eq!(usage.status, UsageStatus::Reported);
        assert_eq!(usage.source, UsageSource::AgentStdout);
    }

    #[test]
    fn missing_total_is_summed_and_marked_estimated() {
        let usage = extract_usage("", "input tokens: 1,000\noutput_tokens=250");
        assert_eq!(usage.prompt_tokens, Some(1000));
        assert_eq!(usage.completion_tokens, Some(250));
        assert_eq!(usage.total_tokens, Some(1250));
        assert_eq!(usage.status, UsageStatus::Estimated);
        assert_eq!(usage.source, UsageSource::AgentStderr);
    }

    #[test]
    fn tokens_used_footer_is_a_total() {
        let usage = extract_usage("done\ntokens used\n12,345\n", "");
        assert_eq!(usage.total_tokens, Some(12_345));
        assert_eq!(usage.prompt_tokens, None);
        assert_eq!(usage.status, UsageStatus::Reported);
    }

    #[test]
    fn json_in_stderr_beats_prose_in_stdout() {
        let usage = extract_usage("total tokens: 5", r#""total_tokens": 42"#);
        assert_eq!(usage.total_tokens, Some(42));
        assert_eq!(usage.source, UsageSource::AgentStderr);
    }

    #[test]
    fn no_markers_is_unknown() {
        let usage = extract_usage("hello", "world");
        assert!(!usage.is_known());
        assert_eq!(usage.status, UsageStatus::Unknown);
        assert_eq!(usage.source, UsageSource::None);
        assert_eq!(usage.parser_version, USAGE_PARSER_VERSION);
    }
}
