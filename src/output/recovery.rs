use crate::contract::{AgentOutput, OutputBlock};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::LazyLock;

pub const STDOUT_PARSER_VERSION: &str = "v1";

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```(?:json)?\s*(\{.*?\})\s*```")
        .unwrap_or_else(|e| panic!("invalid fenced JSON pattern: {e}"))
});

/// Where in stdout the payload was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StdoutExtraction {
    /// All of stdout was the JSON document.
    Direct,
    /// A ```json fenced block.
    Fenced,
    /// The span from the first `{` to the last `}`.
    BraceSpan,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredOutput {
    pub output: AgentOutput,
    pub extraction: StdoutExtraction,
    pub dropped_source_ids: usize,
}

/// Salvage a blocks contract from raw stdout.
///
/// Citations outside `allowed_source_ids` are dropped; a block left without
/// citations, or with blank text, is dropped. Returns `None` if nothing
/// usable remains. Metadata records how the payload was recovered.
pub fn recover_from_stdout(
    stdout: &str,
    allowed_source_ids: &BTreeSet<String>,
) -> Option<RecoveredOutput> {
    let text = stdout.trim();
    if text.is_empty() {
        return None;
    }

    for (extraction, candidate) in candidates(text) {
        let Some(Value::Object(payload)) = candidate.and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        else {
            continue;
        };
        if let Some(recovered) = normalize(payload, allowed_source_ids, extraction) {
            return Some(recovered);
        }
    }
    None
}

fn candidates(text: &str) -> [(StdoutExtraction, Option<&str>); 3] {
    let fenced = FENCED_JSON
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str());
    let span = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => Some(&text[start..=end]),
        _ => None,
    };
    [
        (StdoutExtraction::Direct, Some(text)),
        (StdoutExtraction::Fenced, fenced),
        (StdoutExtraction::BraceSpan, span),
    ]
}

fn normalize(
    mut payload: Map<String, Value>,
    allowed_source_ids: &BTreeSet<String>,
    extraction: StdoutExtraction,
) -> Option<RecoveredOutput> {
    let Some(Value::Array(raw_blocks)) = payload.remove("blocks") else {
        return None;
    };

    let mut dropped = 0usize;
    let mut blocks = Vec::new();
    for item in raw_blocks {
        let Value::Object(mut item) = item else {
            continue;
        };
        let Some(Value::String(text)) = item.remove("text") else {
            continue;
        };
        let text = text.trim();
        if text.is_empty() {
            continue;
        }

        let mut seen = BTreeSet::new();
        let mut source_ids = Vec::new();
        if let Some(Value::Array(ids)) = item.remove("source_ids") {
            for id in ids {
                let Value::String(id) = id else {
                    dropped += 1;
                    continue;
                };
                if !allowed_source_ids.contains(&id) {
                    dropped += 1;
                    continue;
                }
                if seen.insert(id.clone()) {
                    source_ids.push(id);
                }
            }
        }
        if source_ids.is_empty() {
            continue;
        }
        blocks.push(OutputBlock {
            text: text.to_string(),
            source_ids,
        });
    }

    if blocks.is_empty() {
        return None;
    }

    let mut metadata = match payload.remove("metadata") {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    metadata.insert("recovered_from".into(), Value::from("stdout"));
    metadata.insert("stdout_parser".into(), Value::from("json_payload_normalized"));
    metadata.insert("stdout_parser_version".into(), Value::from(STDOUT_PARSER_VERSION));
    metadata.insert("stdout_extraction".into(), Value::from(extraction.to_string()));
    metadata.insert("dropped_source_ids".into(), Value::from(dropped));

    Some(RecoveredOutput {
        output: AgentOutput { blocks, metadata },
        extraction,
        dropped_source_ids: dropped,
    })
}
