use super::types::{ArticlesIndex, TaskInput, TaskManifest};
use crate::error::ContractError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

fn io_error(path: &Path, source: std::io::Error) -> ContractError {
    ContractError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn invalid(path: &Path, message: impl Into<String>) -> ContractError {
    ContractError::Invalid {
        path: path.display().to_string(),
        message: message.into(),
    }
}

/// Pretty-printed JSON with keys in sorted order, so files diff cleanly.
pub async fn write_json<T: Serialize>(path: &Path, payload: &T) -> Result<(), ContractError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(parent, e))?;
    }
    // Round-trip through Value: its map type is ordered by key.
    let value = serde_json::to_value(payload).map_err(|e| ContractError::Json {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let text = serde_json::to_string_pretty(&value).map_err(|e| ContractError::Json {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    tokio::fs::write(path, text)
        .await
        .map_err(|e| io_error(path, e))
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ContractError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| io_error(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| ContractError::Json {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

pub async fn read_manifest(path: &Path) -> Result<TaskManifest, ContractError> {
    let manifest: TaskManifest = read_json(path).await?;
    if manifest.contract_version < 1 {
        return Err(invalid(path, "contract_version must be >= 1"));
    }
    if manifest.task_id.trim().is_empty() {
        return Err(invalid(path, "task_id must be non-empty"));
    }
    Ok(manifest)
}

pub async fn read_task_input(path: &Path) -> Result<TaskInput, ContractError> {
    let input: TaskInput = read_json(path).await?;
    if input.task_type.trim().is_empty() {
        return Err(invalid(path, "task_input.task_type must be a non-empty string"));
    }
    Ok(input)
}

pub async fn read_articles_index(path: &Path) -> Result<ArticlesIndex, ContractError> {
    let index: ArticlesIndex = read_json(path).await?;
    if let Some(pos) = index
        .articles
        .iter()
        .position(|a| a.source_id.trim().is_empty())
    {
        return Err(invalid(
            path,
            format!("articles[{pos}].source_id must be a non-empty string"),
        ));
    }
    Ok(index)
}
