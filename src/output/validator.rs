use crate::contract::{AgentOutput, OutputBlock};
use crate::failure::FailureClass;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;

/// Why the declared output was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub failure_class: FailureClass,
    /// Stable attempt-level code, e.g. `output_contract_missing_file`.
    pub code: &'static str,
    pub summary: String,
}

impl ValidationFailure {
    fn invalid_json(code: &'static str, summary: impl Into<String>) -> Self {
        Self {
            failure_class: FailureClass::OutputInvalidJson,
            code,
            summary: summary.into(),
        }
    }

    fn schema(summary: impl Into<String>) -> Self {
        Self::invalid_json("output_contract_schema_invalid", summary)
    }

    fn source_mapping(summary: impl Into<String>) -> Self {
        Self {
            failure_class: FailureClass::SourceMappingFailed,
            code: "source_mapping_violation",
            summary: summary.into(),
        }
    }
}

pub async fn validate_output_file(
    path: &Path,
    allowed_source_ids: &BTreeSet<String>,
) -> Result<AgentOutput, ValidationFailure> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ValidationFailure::invalid_json(
                "output_contract_missing_file",
                format!("Output file not found: {}", path.display()),
            ));
        }
        Err(e) => {
            return Err(ValidationFailure::invalid_json(
                "output_contract_unreadable",
                format!("Output file unreadable: {}: {e}", path.display()),
            ));
        }
    };
    validate_output_bytes(&bytes, allowed_source_ids)
}

/// Validate an output document against the blocks contract. Shape problems
/// are `OutputInvalidJson`; citation problems are `SourceMappingFailed`.
pub fn validate_output_bytes(
    bytes: &[u8],
    allowed_source_ids: &BTreeSet<String>,
) -> Result<AgentOutput, ValidationFailure> {
    let raw: Value = serde_json::from_slice(bytes).map_err(|e| {
        ValidationFailure::invalid_json("output_contract_unreadable", format!("Output is not valid JSON: {e}"))
    })?;
    let Value::Object(mut root) = raw else {
        return Err(ValidationFailure::schema("Output must be a JSON object."));
    };

    let metadata = match root.remove("metadata") {
        None | Some(Value::Null) => serde_json::Map::new(),
        Some(Value::Object(map)) => map,
        Some(_) => return Err(ValidationFailure::schema("metadata must be an object.")),
    };
    let Some(Value::Array(raw_blocks)) = root.remove("blocks") else {
        return Err(ValidationFailure::schema("Output must contain blocks array."));
    };

    let mut blocks = Vec::with_capacity(raw_blocks.len());
    for (index, block) in raw_blocks.into_iter().enumerate() {
        blocks.push(validate_block(index, block, allowed_source_ids)?);
    }

    Ok(AgentOutput { blocks, metadata })
}

fn validate_block(
    index: usize,
    block: Value,
    allowed_source_ids: &BTreeSet<String>,
) -> Result<OutputBlock, ValidationFailure> {
    let Value::Object(mut block) = block else {
        return Err(ValidationFailure::schema(format!("blocks[{index}] must be an object.")));
    };

    let text = match block.remove("text") {
        Some(Value::String(text)) if !text.trim().is_empty() => text,
        Some(Value::String(_)) => {
            return Err(ValidationFailure::schema(format!("blocks[{index}].text must be non-empty.")));
        }
        _ => {
            return Err(ValidationFailure::schema(format!("blocks[{index}].text must be a string.")));
        }
    };

    let raw_ids = match block.remove("source_ids") {
        Some(Value::Array(ids)) if !ids.is_empty() => ids,
        _ => {
            return Err(ValidationFailure::source_mapping(format!(
                "blocks[{index}] has empty or missing source_ids."
            )));
        }
    };

    let mut source_ids = Vec::with_capacity(raw_ids.len());
    for id in raw_ids {
        let Value::String(id) = id else {
            return Err(ValidationFailure::schema(format!(
                "blocks[{index}].source_ids must contain only strings."
            )));
        };
        source_ids.push(id);
    }

    let unknown: BTreeSet<&str> = source_ids
        .iter()
        .filter(|id| !allowed_source_ids.contains(id.as_str()))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        let listed: Vec<&str> = unknown.into_iter().collect();
        return Err(ValidationFailure::source_mapping(format!(
            "blocks[{index}] contains unknown source_ids: {}",
            listed.join(", ")
        )));
    }

    Ok(OutputBlock { text, source_ids })
}
