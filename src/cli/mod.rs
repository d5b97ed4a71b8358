pub mod commands;
pub mod dispatch;
pub mod report;

pub use commands::{Cli, Commands};
pub use dispatch::dispatch;
