//! Status conditions
//!
//! Follows the Kubernetes `metav1.Condition` shape. The `Ready` condition is
//! the one external monitoring and UIs look at.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Condition messages are cut to this many characters to bound status size
pub const MAX_CONDITION_MESSAGE_LENGTH: usize = 20000;

/// Type of the main condition
pub const READY_CONDITION: &str = "Ready";

/// Reasons set on the `Ready` condition
pub mod reasons {
    pub const RECONCILIATION_SUCCEEDED: &str = "ReconciliationSucceeded";
    pub const PREPARE_FAILED: &str = "PrepareFailed";
    pub const DEPLOY_FAILED: &str = "DeployFailed";
    pub const VALIDATE_FAILED: &str = "ValidateFailed";
    pub const INVALID_SPEC: &str = "InvalidSpec";
    pub const MANUAL_REQUEST_INVALID: &str = "ManualRequestInvalid";
    pub const AWAITING_APPROVAL: &str = "AwaitingApproval";
    pub const SUSPENDED: &str = "Suspended";
    pub const DEPENDENCY_NOT_READY: &str = "DependencyNotReady";
    pub const TIMEOUT: &str = "Timeout";
    pub const DELETION_FAILED: &str = "DeletionFailed";
}

/// Condition status value
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// One observation about the state of a resource
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition, e.g. `Ready`
    #[serde(rename = "type")]
    pub type_: String,

    /// True, False or Unknown
    pub status: ConditionStatus,

    /// Machine readable CamelCase reason
    pub reason: String,

    /// Human readable details
    #[serde(default)]
    pub message: String,

    /// Last time the status changed
    pub last_transition_time: DateTime<Utc>,

    /// Generation the condition was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Creates a `Ready` condition; the message is truncated
    pub fn ready(
        status: ConditionStatus,
        reason: &str,
        message: impl AsRef<str>,
        observed_generation: Option<i64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: READY_CONDITION.to_string(),
            status,
            reason: reason.to_string(),
            message: truncate_message(message.as_ref()),
            last_transition_time: now,
            observed_generation,
        }
    }
}

/// Cuts `message` to [`MAX_CONDITION_MESSAGE_LENGTH`] characters
pub fn truncate_message(message: &str) -> String {
    match message.char_indices().nth(MAX_CONDITION_MESSAGE_LENGTH) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

/// Looks up a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Inserts or replaces the condition of the same type.
///
/// `lastTransitionTime` is kept when the status value does not change.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    condition.message = truncate_message(&condition.message);
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_truncate_message() {
        let long = "a".repeat(MAX_CONDITION_MESSAGE_LENGTH + 10);
        assert_eq!(truncate_message(&long).chars().count(), MAX_CONDITION_MESSAGE_LENGTH);
        assert_eq!(truncate_message("short"), "short");

        // multi-byte characters must not be split
        let wide = "é".repeat(MAX_CONDITION_MESSAGE_LENGTH + 1);
        assert_eq!(truncate_message(&wide).chars().count(), MAX_CONDITION_MESSAGE_LENGTH);
    }

    #[test]
    fn test_set_condition_keeps_transition_time_for_same_status() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, Condition::ready(ConditionStatus::True, reasons::RECONCILIATION_SUCCEEDED, "ok", Some(1), at(10)));
        set_condition(&mut conditions, Condition::ready(ConditionStatus::True, reasons::RECONCILIATION_SUCCEEDED, "still ok", Some(2), at(20)));

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, at(10));
        assert_eq!(conditions[0].message, "still ok");
        assert_eq!(conditions[0].observed_generation, Some(2));

        set_condition(&mut conditions, Condition::ready(ConditionStatus::False, reasons::PREPARE_FAILED, "boom", Some(2), at(30)));
        assert_eq!(conditions[0].last_transition_time, at(30));
        assert_eq!(conditions[0].reason, reasons::PREPARE_FAILED);
    }

    #[test]
    fn test_condition_wire_format() {
        let c = Condition::ready(ConditionStatus::Unknown, reasons::AWAITING_APPROVAL, "waiting", None, at(0));
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["type"], "Ready");
        assert_eq!(json["status"], "Unknown");
        assert_eq!(json["reason"], "AwaitingApproval");
        assert!(json.get("observedGeneration").is_none());
    }
}
