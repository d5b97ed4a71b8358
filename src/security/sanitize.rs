use regex::Regex;
use std::sync::LazyLock;

/// Default cap for persisted diagnostic previews.
pub const DEFAULT_PREVIEW_CHARS: usize = 2000;

/// One ordered redaction rule. `replacement` follows `regex` expansion syntax.
struct RedactionRule {
    name: &'static str,
    pattern: Regex,
    replacement: &'static str,
}

impl RedactionRule {
    fn new(name: &'static str, pattern: &str, replacement: &'static str) -> Self {
        Self {
            name,
            pattern: Regex::new(pattern)
                .unwrap_or_else(|e| panic!("invalid redaction rule {name}: {e}")),
            replacement,
        }
    }
}

// Replacement markers start with '[' and no value pattern below accepts a
// leading '[', so a second pass never rewrites an already-redacted span.
static REDACTION_RULES: LazyLock<Vec<RedactionRule>> = LazyLock::new(|| {
    vec![
        RedactionRule::new(
            "bearer_token",
            r"(?i)\b(bearer)\s+[a-z0-9._\-]{8,}",
            "${1} [redacted-token]",
        ),
        RedactionRule::new(
            "sk_token",
            r"(?i)\bsk-[a-z0-9_\-]{8,}",
            "[redacted-token]",
        ),
        RedactionRule::new(
            "provider_key",
            r#"(?i)\b(?:agentq|openai|anthropic|gemini|google|codex|claude|hf|huggingface)[a-z0-9_]*?_?(?:api_)?(?:key|token)\s*[:=]\s*['"]?[^'"\s\[][^'"\s]*['"]?"#,
            "[redacted-secret]",
        ),
        RedactionRule::new(
            "signed_url_param",
            r"(?i)([?&](?:token|key|signature|sig|auth|access_token|x-amz-signature|x-goog-signature)=)[^&\s\[][^&\s]*",
            "${1}[redacted]",
        ),
        RedactionRule::new(
            "secret_assignment",
            r#"(?i)\b(api[_-]?key|secret[_-]?key|access[_-]?token|auth[_-]?token|refresh[_-]?token|client[_-]?secret|password|token)(\s*[:=]\s*)['"]?[^'"\s&\[][^'"\s&]*['"]?"#,
            "${1}${2}[redacted]",
        ),
        RedactionRule::new(
            "email",
            r"(?i)\b[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}\b",
            "[redacted-email]",
        ),
    ]
});

/// Redact secrets and PII from diagnostic text, then cap it at `max_chars`
/// characters. Running it over its own output returns the input unchanged.
pub fn sanitize_preview(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() || max_chars == 0 {
        return String::new();
    }

    let mut cleaned = trimmed.to_string();
    for rule in REDACTION_RULES.iter() {
        if rule.pattern.is_match(&cleaned) {
            tracing::trace!(rule = rule.name, "redacting diagnostic text");
            cleaned = rule
                .pattern
                .replace_all(&cleaned, rule.replacement)
                .into_owned();
        }
    }

    truncate_chars(&cleaned, max_chars).trim_end().to_string()
}

/// Longest prefix of `text` holding at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_is_redacted_and_stable() {
        let once = sanitize_preview("auth failed: Bearer abcdef12345678 rejected", 200);
        assert!(once.contains("Bearer [redacted-token]"));
        assert!(!once.contains("abcdef12345678"));
        assert_eq!(sanitize_preview(&once, 200), once);
    }

    #[test]
    fn sk_tokens_are_redacted() {
        let out = sanitize_preview("using key sk-proj-ABCDEF123456 now", 200);
        assert_eq!(out, "using key [redacted-token] now");
    }

    #[test]
    fn provider_keys_are_redacted() {
        let out = sanitize_preview("ANTHROPIC_API_KEY=\"abc123def456\" and more", 200);
        assert!(out.contains("[redacted-secret]"), "{out}");
        assert!(!out.contains("abc123def456"));
        assert_eq!(sanitize_preview(&out, 200), out);
    }

    #[test]
    fn signed_url_params_are_redacted() {
        let out = sanitize_preview(
            "GET https://bucket.example/obj?X-Amz-Signature=deadbeef&token=xyz&page=2",
            300,
        );
        assert!(out.contains("X-Amz-Signature=[redacted]"), "{out}");
        assert!(out.contains("token=[redacted]"), "{out}");
        assert!(out.contains("page=2"));
        assert_eq!(sanitize_preview(&out, 300), out);
    }

    #[test]
    fn secret_assignments_are_redacted() {
        let out = sanitize_preview("password: hunter2 api_key=qwerty", 200);
        assert_eq!(out, "password: [redacted] api_key=[redacted]");
        assert_eq!(sanitize_preview(&out, 200), out);
    }

    #[test]
    fn emails_are_redacted() {
        let out = sanitize_preview("contact ops@example.com for access", 200);
        assert_eq!(out, "contact [redacted-email] for access");
    }

    #[test]
    fn output_never_exceeds_cap() {
        let long = format!("Bearer {} {}", "a".repeat(64), "é".repeat(500));
        let out = sanitize_preview(&long, 40);
        assert!(out.chars().count() <= 40);
    }

    #[test]
    fn redaction_that_grows_text_is_still_capped() {
        let out = sanitize_preview("sk-abcdefgh", 11);
        assert!(out.chars().count() <= 11);
        assert!(!out.contains("abcdefgh"));
    }

    #[test]
    fn blank_input_yields_empty_string() {
        assert_eq!(sanitize_preview("   \n\t", 100), "");
        assert_eq!(sanitize_preview("text", 0), "");
    }

    #[test]
    fn truncate_respects_multibyte_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
