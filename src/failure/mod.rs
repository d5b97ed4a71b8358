pub mod classifier;

pub use classifier::{CLASSIFIER_VERSION, Classification, ClassifierRule, FailureClassifier};

use serde::{Deserialize, Serialize};

/// Closed set of attempt outcomes that drive retry and repair decisions.
/// A successful attempt has no failure class.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    BillingOrQuota,
    ModelNotAvailable,
    BackendTransient,
    BackendNonRetryable,
    OutputInvalidJson,
    SourceMappingFailed,
}

impl FailureClass {
    /// Only transient backend conditions are re-queued automatically.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::BackendTransient)
    }

    /// Contract-shaped failures are eligible for stdout recovery and the
    /// one-shot repair re-run.
    pub fn is_repairable(self) -> bool {
        matches!(self, Self::OutputInvalidJson | Self::SourceMappingFailed)
    }

    pub fn as_db(self) -> &'static str {
        match self {
            Self::BillingOrQuota => "billing_or_quota",
            Self::ModelNotAvailable => "model_not_available",
            Self::BackendTransient => "backend_transient",
            Self::BackendNonRetryable => "backend_non_retryable",
            Self::OutputInvalidJson => "output_invalid_json",
            Self::SourceMappingFailed => "source_mapping_failed",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        value.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn db_names_round_trip_through_display() {
        for class in FailureClass::iter() {
            assert_eq!(class.to_string(), class.as_db());
            assert_eq!(FailureClass::from_db(class.as_db()), Some(class));
        }
        assert_eq!(FailureClass::from_db("timeout"), None);
    }

    #[test]
    fn only_contract_failures_are_repairable() {
        let repairable: Vec<_> = FailureClass::iter().filter(|c| c.is_repairable()).collect();
        assert_eq!(
            repairable,
            vec![FailureClass::OutputInvalidJson, FailureClass::SourceMappingFailed]
        );
        assert!(FailureClass::BackendTransient.is_retryable());
        assert!(!FailureClass::BillingOrQuota.is_retryable());
        assert!(!FailureClass::ModelNotAvailable.is_retryable());
    }
}
