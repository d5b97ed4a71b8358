use super::io::write_json;
use super::types::{ArticleIndexEntry, ArticlesIndex, CONTRACT_VERSION, TaskInput, TaskManifest};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct MaterializedTask {
    pub manifest_path: PathBuf,
    pub manifest: TaskManifest,
}

/// Lays out one directory per attempt:
///
/// ```text
/// <root>/<task_id>/attempt-<n>/
///   input/task_input.json
///   input/articles_index.json
///   output/agent_result.json
///   output/agent_stdout.log
///   output/agent_stderr.log
///   meta/task_manifest.json
/// ```
#[derive(Debug, Clone)]
pub struct WorkdirManager {
    root: PathBuf,
}

impl WorkdirManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn attempt_dir(&self, task_id: &str, attempt: u32) -> PathBuf {
        self.root.join(task_id).join(format!("attempt-{attempt}"))
    }

    /// Create a fresh workdir for `attempt`. Leftovers from a crashed earlier
    /// run of the same attempt are discarded.
    pub async fn materialize(
        &self,
        task_id: &str,
        attempt: u32,
        input: &TaskInput,
        articles: &[ArticleIndexEntry],
    ) -> Result<MaterializedTask> {
        let base_dir = self.attempt_dir(task_id, attempt);
        if tokio::fs::try_exists(&base_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&base_dir)
                .await
                .with_context(|| format!("Failed to clear stale workdir: {}", base_dir.display()))?;
        }

        let input_dir = base_dir.join("input");
        let output_dir = base_dir.join("output");
        let meta_dir = base_dir.join("meta");
        for dir in [&input_dir, &output_dir, &meta_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create workdir: {}", dir.display()))?;
        }

        let manifest = TaskManifest {
            contract_version: CONTRACT_VERSION,
            task_id: task_id.to_string(),
            task_type: input.task_type.clone(),
            attempt,
            workdir: base_dir.clone(),
            task_input_path: input_dir.join("task_input.json"),
            articles_index_path: input_dir.join("articles_index.json"),
            output_result_path: output_dir.join("agent_result.json"),
            output_stdout_path: output_dir.join("agent_stdout.log"),
            output_stderr_path: output_dir.join("agent_stderr.log"),
            output_schema_hint: Some("blocks_v1".into()),
        };
        let manifest_path = meta_dir.join("task_manifest.json");

        write_json(&manifest.task_input_path, input).await?;
        write_json(
            &manifest.articles_index_path,
            &ArticlesIndex {
                articles: articles.to_vec(),
            },
        )
        .await?;
        write_json(&manifest_path, &manifest).await?;

        Ok(MaterializedTask {
            manifest_path,
            manifest,
        })
    }
}
