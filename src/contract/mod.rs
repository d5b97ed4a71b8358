//! File contracts exchanged with agent processes through the task workdir.

pub mod io;
pub mod types;
pub mod workdir;

pub use io::{read_articles_index, read_json, read_manifest, read_task_input, write_json};
pub use types::{
    AgentOutput, ArticleIndexEntry, ArticlesIndex, CONTRACT_VERSION, OutputBlock, TaskInput,
    TaskManifest,
};
pub use workdir::{MaterializedTask, WorkdirManager};
