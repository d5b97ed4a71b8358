use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::PathBuf;

pub const CONTRACT_VERSION: u32 = 2;

/// One citation target the agent may reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleIndexEntry {
    pub source_id: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
}

impl ArticleIndexEntry {
    pub fn new(source_id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            title: title.into(),
            url: url.into(),
            source: String::new(),
            published_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticlesIndex {
    pub articles: Vec<ArticleIndexEntry>,
}

impl ArticlesIndex {
    pub fn source_ids(&self) -> BTreeSet<String> {
        self.articles.iter().map(|a| a.source_id.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    pub task_type: String,
    pub prompt: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBlock {
    pub text: String,
    pub source_ids: Vec<String>,
}

/// What the agent must write to `output_result_path`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub blocks: Vec<OutputBlock>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Paths of one materialized attempt. Written to `meta/task_manifest.json`
/// and handed to the agent as `{task_manifest}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskManifest {
    #[serde(default = "default_contract_version")]
    pub contract_version: u32,
    pub task_id: String,
    pub task_type: String,
    pub attempt: u32,
    pub workdir: PathBuf,
    pub task_input_path: PathBuf,
    pub articles_index_path: PathBuf,
    pub output_result_path: PathBuf,
    pub output_stdout_path: PathBuf,
    pub output_stderr_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema_hint: Option<String>,
}

fn default_contract_version() -> u32 {
    1
}

impl TaskManifest {
    /// Enriched prompt file the runner writes next to the task input.
    pub fn prompt_file_path(&self) -> PathBuf {
        self.workdir.join("input").join("task_prompt.txt")
    }
}
