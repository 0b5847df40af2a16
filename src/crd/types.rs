//! Supporting status types shared by signer resources

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reported on every PodCertificateRequest this signer handles
pub const ISSUED_CONDITION: &str = "Issued";

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
///
/// Mirrors `metav1.Condition`, which is what the PodCertificateRequest
/// status subresource expects.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (always `Issued` for this signer)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,

    /// Generation of the object this condition was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
            observed_generation: None,
        }
    }

    /// Set the observed generation
    pub fn with_observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// True when both conditions report the same outcome, ignoring timestamps
    pub fn same_outcome(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_sets_timestamp() {
        let before = Utc::now();
        let condition = Condition::new(
            ISSUED_CONDITION,
            ConditionStatus::True,
            "Issued",
            "certificate issued",
        );
        let after = Utc::now();

        assert_eq!(condition.type_, "Issued");
        assert_eq!(condition.status, ConditionStatus::True);
        assert!(condition.last_transition_time >= before);
        assert!(condition.last_transition_time <= after);
        assert!(condition.observed_generation.is_none());
    }

    #[test]
    fn test_condition_serializes_like_metav1() {
        let condition = Condition::new(
            ISSUED_CONDITION,
            ConditionStatus::False,
            "InvalidPublicKey",
            "bad key",
        )
        .with_observed_generation(Some(3));

        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "Issued");
        assert_eq!(json["status"], "False");
        assert_eq!(json["reason"], "InvalidPublicKey");
        assert_eq!(json["observedGeneration"], 3);
        assert!(json.get("lastTransitionTime").is_some());
    }

    #[test]
    fn test_same_outcome_ignores_timestamp() {
        let a = Condition::new(ISSUED_CONDITION, ConditionStatus::False, "R", "m");
        let mut b = a.clone();
        b.last_transition_time = a.last_transition_time - chrono::Duration::hours(1);
        assert!(a.same_outcome(&b));

        b.reason = "Other".to_string();
        assert!(!a.same_outcome(&b));
    }

    #[test]
    fn test_condition_status_display() {
        assert_eq!(ConditionStatus::True.to_string(), "True");
        assert_eq!(ConditionStatus::False.to_string(), "False");
        assert_eq!(ConditionStatus::default().to_string(), "Unknown");
    }
}
