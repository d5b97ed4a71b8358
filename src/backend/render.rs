use crate::error::RenderError;
use sha2::{Digest, Sha256};

/// Target convention for the rendered invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum OsFamily {
    /// Discrete argv, no shell involved.
    Posix,
    /// One command-line string parsed by the child's runtime.
    Windows,
}

impl OsFamily {
    pub fn current() -> Self {
        if cfg!(windows) { Self::Windows } else { Self::Posix }
    }
}

/// Values substituted into a command template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateValues<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub prompt_file: &'a str,
    pub task_manifest: &'a str,
}

impl TemplateValues<'_> {
    fn get(&self, name: &str) -> Option<&str> {
        match name {
            "model" => Some(self.model),
            "prompt" => Some(self.prompt),
            "prompt_file" => Some(self.prompt_file),
            "task_manifest" => Some(self.task_manifest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Argv(Vec<String>),
    CommandLine(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCommand {
    pub invocation: Invocation,
    /// Executable token, for "command not found" diagnostics.
    pub head: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'t> {
    Literal(String),
    Placeholder(&'t str),
}

/// Split a template into literal text and `{name}` placeholders.
/// `{{` and `}}` are literal braces.
fn parse_template(template: &str) -> Result<Vec<Segment<'_>>, RenderError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        match c {
            '{' if chars.peek().is_some_and(|&(_, n)| n == '{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek().is_some_and(|&(_, n)| n == '}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let rest = &template[idx + 1..];
                let end = rest.find('}').ok_or(RenderError::UnterminatedPlaceholder)?;
                let name = &rest[..end];
                if name.is_empty() || name.contains('{') {
                    return Err(RenderError::UnterminatedPlaceholder);
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Placeholder(name));
                // Skip the name and the closing brace.
                for _ in 0..=name.chars().count() {
                    chars.next();
                }
            }
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

/// Render `template` for `os`. The template must be non-empty and hand the
/// agent its prompt through `{prompt}` or `{prompt_file}`; unknown
/// placeholders are rejected.
pub fn render_command(
    template: &str,
    values: &TemplateValues<'_>,
    os: OsFamily,
) -> Result<RenderedCommand, RenderError> {
    let template = template.trim();
    if template.is_empty() {
        return Err(RenderError::EmptyTemplate);
    }
    let segments = parse_template(template)?;
    for segment in &segments {
        if let Segment::Placeholder(name) = segment
            && values.get(name).is_none()
        {
            return Err(RenderError::UnknownPlaceholder((*name).to_string()));
        }
    }
    if !segments
        .iter()
        .any(|s| matches!(s, Segment::Placeholder("prompt" | "prompt_file")))
    {
        return Err(RenderError::MissingPrompt);
    }

    match os {
        OsFamily::Posix => {
            let argv = render_posix(&segments, values)?;
            let head = argv.first().cloned().ok_or(RenderError::EmptyTemplate)?;
            Ok(RenderedCommand {
                invocation: Invocation::Argv(argv),
                head,
            })
        }
        OsFamily::Windows => {
            let line = render_windows(&segments, values);
            let line = line.trim().to_string();
            let head = line
                .split_whitespace()
                .next()
                .map(|h| h.trim_matches('"').to_string())
                .filter(|h| !h.is_empty())
                .ok_or(RenderError::EmptyTemplate)?;
            Ok(RenderedCommand {
                invocation: Invocation::CommandLine(line),
                head,
            })
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
}

/// Shell-style word splitting of the literal text. Placeholder values are
/// inserted verbatim into the current word, so they are never re-split or
/// re-interpreted whatever they contain.
fn render_posix(segments: &[Segment<'_>], values: &TemplateValues<'_>) -> Result<Vec<String>, RenderError> {
    let mut argv = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut quote = Quote::None;

    for segment in segments {
        let text = match segment {
            Segment::Placeholder(name) => {
                word.push_str(values.get(name).unwrap_or_default());
                in_word = true;
                continue;
            }
            Segment::Literal(text) => text,
        };

        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            match (quote, c) {
                (Quote::None, c) if c.is_whitespace() => {
                    if in_word {
                        argv.push(std::mem::take(&mut word));
                        in_word = false;
                    }
                }
                (Quote::None, '\'') => {
                    quote = Quote::Single;
                    in_word = true;
                }
                (Quote::None, '"') => {
                    quote = Quote::Double;
                    in_word = true;
                }
                (Quote::None, '\\') => {
                    if let Some(next) = chars.next() {
                        word.push(next);
                    }
                    in_word = true;
                }
                (Quote::Single, '\'') | (Quote::Double, '"') => quote = Quote::None,
                (Quote::Double, '\\') => match chars.peek() {
                    Some(&(next @ ('"' | '\\' | '$' | '`'))) => {
                        chars.next();
                        word.push(next);
                    }
                    _ => word.push('\\'),
                },
                (_, c) => {
                    word.push(c);
                    in_word = true;
                }
            }
        }
    }

    if quote != Quote::None {
        return Err(RenderError::UnbalancedQuotes);
    }
    if in_word {
        argv.push(word);
    }
    Ok(argv)
}

/// Whether an unescaped `"` toggles quoting, given the literal so far.
fn advance_quote_state(literal: &str, mut in_quotes: bool) -> bool {
    let mut backslashes = 0usize;
    for c in literal.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                if backslashes % 2 == 0 {
                    in_quotes = !in_quotes;
                }
                backslashes = 0;
            }
            _ => backslashes = 0,
        }
    }
    in_quotes
}

fn render_windows(segments: &[Segment<'_>], values: &TemplateValues<'_>) -> String {
    let mut line = String::new();
    let mut in_quotes = false;

    for (pos, segment) in segments.iter().enumerate() {
        match segment {
            Segment::Literal(text) => {
                line.push_str(text);
                in_quotes = advance_quote_state(text, in_quotes);
            }
            Segment::Placeholder(name) => {
                let value = values.get(name).unwrap_or_default();
                if in_quotes {
                    let closes_next = matches!(
                        segments.get(pos + 1),
                        Some(Segment::Literal(next)) if next.starts_with('"')
                    );
                    line.push_str(&escape_inside_quotes(value, closes_next));
                } else {
                    line.push_str(&quote_argument(value));
                }
            }
        }
    }
    line
}

/// Value embedded in an already-quoted template segment: quotes are doubled,
/// and backslashes that would otherwise escape a quote are doubled too.
fn escape_inside_quotes(value: &str, followed_by_quote: bool) -> String {
    let mut out = String::with_capacity(value.len() + 8);
    let mut backslashes = 0usize;
    for c in value.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.push_str(&"\\".repeat(backslashes * 2));
                backslashes = 0;
                out.push_str("\"\"");
            }
            other => {
                out.push_str(&"\\".repeat(backslashes));
                backslashes = 0;
                out.push(other);
            }
        }
    }
    let trailing = if followed_by_quote { backslashes * 2 } else { backslashes };
    out.push_str(&"\\".repeat(trailing));
    out
}

/// Standalone argument quoting: wrap in quotes when empty or containing
/// whitespace, escaping embedded quotes and the backslashes before them.
fn quote_argument(value: &str) -> String {
    let needs_quotes = value.is_empty() || value.contains([' ', '\t']);
    let mut out = String::with_capacity(value.len() + 2);
    if needs_quotes {
        out.push('"');
    }
    let mut backslashes = 0usize;
    for c in value.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.push_str(&"\\".repeat(backslashes * 2));
                backslashes = 0;
                out.push_str("\\\"");
            }
            other => {
                out.push_str(&"\\".repeat(backslashes));
                backslashes = 0;
                out.push(other);
            }
        }
    }
    if needs_quotes {
        out.push_str(&"\\".repeat(backslashes * 2));
        out.push('"');
    } else {
        out.push_str(&"\\".repeat(backslashes));
    }
    out
}

/// Hex sha256 of a command template, stored with each attempt.
pub fn template_fingerprint(template: &str) -> String {
    hex::encode(Sha256::digest(template.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values<'a>(prompt: &'a str) -> TemplateValues<'a> {
        TemplateValues {
            model: "gpt-5",
            prompt,
            prompt_file: "/work/task 1/input/task_prompt.txt",
            task_manifest: "/work/task 1/meta/task_manifest.json",
        }
    }

    /// Parse a Windows command line the way the MSVC runtime does, with `""`
    /// inside quotes producing a literal quote.
    fn split_windows(line: &str) -> Vec<String> {
        let mut args = Vec::new();
        let mut current = String::new();
        let mut in_arg = false;
        let mut in_quotes = false;
        let chars: Vec<char> = line.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c == '\\' {
                let start = i;
                while i < chars.len() && chars[i] == '\\' {
                    i += 1;
                }
                let count = i - start;
                if i < chars.len() && chars[i] == '"' {
                    current.push_str(&"\\".repeat(count / 2));
                    if count % 2 == 1 {
                        current.push('"');
                        i += 1;
                    }
                } else {
                    current.push_str(&"\\".repeat(count));
                }
                in_arg = true;
                continue;
            }
            if c == '"' {
                if in_quotes && chars.get(i + 1) == Some(&'"') {
                    current.push('"');
                    i += 2;
                    continue;
                }
                in_quotes = !in_quotes;
                in_arg = true;
                i += 1;
                continue;
            }
            if c.is_whitespace() && !in_quotes {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
                i += 1;
                continue;
            }
            current.push(c);
            in_arg = true;
            i += 1;
        }
        if in_arg {
            args.push(current);
        }
        args
    }

    #[test]
    fn posix_values_stay_single_arguments() {
        let rendered = render_command(
            "codex exec --model {model} {prompt}",
            &values("say \"hi\" && rm -rf / ; echo $HOME"),
            OsFamily::Posix,
        )
        .unwrap();
        assert_eq!(rendered.head, "codex");
        assert_eq!(
            rendered.invocation,
            Invocation::Argv(vec![
                "codex".into(),
                "exec".into(),
                "--model".into(),
                "gpt-5".into(),
                "say \"hi\" && rm -rf / ; echo $HOME".into(),
            ])
        );
    }

    #[test]
    fn posix_placeholder_inside_quoted_literal_joins_the_word() {
        let rendered = render_command(
            r#"claude -p --model {model} -- "Read your task from {prompt_file} and execute it." {prompt}"#,
            &values("x"),
            OsFamily::Posix,
        )
        .unwrap();
        let Invocation::Argv(argv) = rendered.invocation else {
            panic!("expected argv");
        };
        assert_eq!(
            argv[5],
            "Read your task from /work/task 1/input/task_prompt.txt and execute it."
        );
        assert_eq!(argv.len(), 7);
    }

    #[test]
    fn posix_empty_value_is_still_an_argument() {
        let rendered = render_command("agent {prompt} --end", &values(""), OsFamily::Posix).unwrap();
        assert_eq!(
            rendered.invocation,
            Invocation::Argv(vec!["agent".into(), String::new(), "--end".into()])
        );
    }

    #[test]
    fn windows_quoted_segment_doubles_embedded_quotes() {
        let prompt = r#"Summarize "breaking" news"#;
        let rendered = render_command(
            r#"agent.exe --model {model} -p "Task: {prompt}""#,
            &values(prompt),
            OsFamily::Windows,
        )
        .unwrap();
        let Invocation::CommandLine(line) = &rendered.invocation else {
            panic!("expected command line");
        };
        assert_eq!(line, r#"agent.exe --model gpt-5 -p "Task: Summarize ""breaking"" news""#);
        assert_eq!(
            split_windows(line),
            vec!["agent.exe", "--model", "gpt-5", "-p", &format!("Task: {prompt}")]
        );
        assert_eq!(rendered.head, "agent.exe");
    }

    #[test]
    fn windows_unquoted_values_with_spaces_are_wrapped() {
        let rendered = render_command(
            "agent --manifest {task_manifest} {prompt}",
            &values(r#"say "hi""#),
            OsFamily::Windows,
        )
        .unwrap();
        let Invocation::CommandLine(line) = &rendered.invocation else {
            panic!("expected command line");
        };
        assert_eq!(
            split_windows(line),
            vec![
                "agent",
                "--manifest",
                "/work/task 1/meta/task_manifest.json",
                r#"say "hi""#
            ]
        );
    }

    #[test]
    fn windows_trailing_backslash_before_closing_quote_is_kept() {
        let v = TemplateValues {
            prompt_file: r"C:\work\",
            ..values("p")
        };
        let rendered = render_command(r#"agent "{prompt_file}" {prompt}"#, &v, OsFamily::Windows).unwrap();
        let Invocation::CommandLine(line) = &rendered.invocation else {
            panic!("expected command line");
        };
        assert_eq!(split_windows(line), vec!["agent", r"C:\work\", "p"]);
    }

    #[test]
    fn template_errors() {
        let v = values("p");
        assert_eq!(render_command("  ", &v, OsFamily::Posix), Err(RenderError::EmptyTemplate));
        assert_eq!(
            render_command("agent --model {model} {task_manifest}", &v, OsFamily::Posix),
            Err(RenderError::MissingPrompt)
        );
        assert_eq!(
            render_command("agent {workdir} {prompt}", &v, OsFamily::Posix),
            Err(RenderError::UnknownPlaceholder("workdir".into()))
        );
        assert_eq!(
            render_command("agent {prompt", &v, OsFamily::Posix),
            Err(RenderError::UnterminatedPlaceholder)
        );
        assert_eq!(
            render_command("agent 'unterminated {prompt}", &v, OsFamily::Posix),
            Err(RenderError::UnbalancedQuotes)
        );
    }

    #[test]
    fn doubled_braces_are_literal() {
        let rendered = render_command("agent --json {{}} {prompt}", &values("p"), OsFamily::Posix).unwrap();
        assert_eq!(
            rendered.invocation,
            Invocation::Argv(vec!["agent".into(), "--json".into(), "{}".into(), "p".into()])
        );
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let a = template_fingerprint("codex exec {prompt}");
        assert_eq!(a.len(), 64);
        assert_eq!(a, template_fingerprint("codex exec {prompt}"));
        assert_ne!(a, template_fingerprint("claude -p {prompt}"));
    }
}
