pub mod repair;
pub mod retry;

pub use repair::{RepairDecision, decide_repair};
pub use retry::{RetryPolicy, RetryVerdict};
