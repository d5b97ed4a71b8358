use crate::failure::FailureClass;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairDecision {
    pub should_repair: bool,
    pub reason: &'static str,
}

/// One repair re-run per task, and only for contract-shaped failures.
/// The repair does not touch the retry budget.
pub fn decide_repair(
    failure_class: FailureClass,
    repair_attempted_at: Option<DateTime<Utc>>,
) -> RepairDecision {
    if !failure_class.is_repairable() {
        return RepairDecision {
            should_repair: false,
            reason: "Failure class is not repairable in-attempt.",
        };
    }
    if repair_attempted_at.is_some() {
        return RepairDecision {
            should_repair: false,
            reason: "Repair already attempted.",
        };
    }
    RepairDecision {
        should_repair: true,
        reason: "One repair attempt is allowed.",
    }
}
