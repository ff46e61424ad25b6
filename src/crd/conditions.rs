//! # Conditions
//!
//! Typed status conditions keyed by condition type.
//!
//! On the wire conditions are the usual Kubernetes list; in memory they are a map so
//! that upserts are deterministic and lookups do not depend on list order.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, JsonSchema)]
pub enum ConditionType {
    Succeeded,
    Ready,
    Shared,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

/// Machine-readable reason of a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Reason {
    Created,
    CreateInProgress,
    CreateFailed,
    Updated,
    UpdateInProgress,
    UpdateFailed,
    DeleteInProgress,
    DeleteFailed,
    Provisioned,
    NotProvisioned,
    InProgress,
    ShareSucceeded,
    ShareFailed,
    ShareNotSupported,
    UnShareSucceeded,
    UnShareFailed,
}

impl Reason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Created => "Created",
            Reason::CreateInProgress => "CreateInProgress",
            Reason::CreateFailed => "CreateFailed",
            Reason::Updated => "Updated",
            Reason::UpdateInProgress => "UpdateInProgress",
            Reason::UpdateFailed => "UpdateFailed",
            Reason::DeleteInProgress => "DeleteInProgress",
            Reason::DeleteFailed => "DeleteFailed",
            Reason::Provisioned => "Provisioned",
            Reason::NotProvisioned => "NotProvisioned",
            Reason::InProgress => "InProgress",
            Reason::ShareSucceeded => "ShareSucceeded",
            Reason::ShareFailed => "ShareFailed",
            Reason::ShareNotSupported => "ShareNotSupported",
            Reason::UnShareSucceeded => "UnShareSucceeded",
            Reason::UnShareFailed => "UnShareFailed",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single observation about the resource
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (Succeeded, Ready, Shared, Failed)
    pub r#type: ConditionType,
    pub status: ConditionStatus,
    pub reason: Reason,
    #[serde(default)]
    pub message: String,
    /// Generation of the resource this condition was computed for
    #[serde(default)]
    pub observed_generation: i64,
    /// Last time the status changed (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    #[must_use]
    pub fn new(
        r#type: ConditionType,
        status: ConditionStatus,
        reason: Reason,
        message: impl Into<String>,
        observed_generation: i64,
    ) -> Self {
        Self {
            r#type,
            status,
            reason,
            message: message.into(),
            observed_generation,
            last_transition_time: None,
        }
    }
}

/// Conditions keyed by type
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "Vec<Condition>", into = "Vec<Condition>")]
pub struct Conditions(BTreeMap<ConditionType, Condition>);

impl Conditions {
    #[must_use]
    pub fn get(&self, r#type: ConditionType) -> Option<&Condition> {
        self.0.get(&r#type)
    }

    /// Insert or replace the condition of the same type.
    ///
    /// The transition time moves only when the status changes.
    pub fn set(&mut self, mut condition: Condition) {
        let previous = self.0.get(&condition.r#type);
        condition.last_transition_time = match previous {
            Some(previous) if previous.status == condition.status => {
                previous.last_transition_time.clone()
            }
            _ => Some(chrono::Utc::now().to_rfc3339()),
        };
        self.0.insert(condition.r#type, condition);
    }

    pub fn remove(&mut self, r#type: ConditionType) -> Option<Condition> {
        self.0.remove(&r#type)
    }

    #[must_use]
    pub fn is_true(&self, r#type: ConditionType) -> bool {
        self.get(r#type)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// True when the condition is True and was computed for `generation`
    #[must_use]
    pub fn is_true_at(&self, r#type: ConditionType, generation: i64) -> bool {
        self.get(r#type)
            .is_some_and(|c| c.status == ConditionStatus::True && c.observed_generation == generation)
    }

    #[must_use]
    pub fn reason(&self, r#type: ConditionType) -> Option<Reason> {
        self.get(r#type).map(|c| c.reason)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.values()
    }
}

impl From<Vec<Condition>> for Conditions {
    fn from(list: Vec<Condition>) -> Self {
        Self(list.into_iter().map(|c| (c.r#type, c)).collect())
    }
}

impl From<Conditions> for Vec<Condition> {
    fn from(conditions: Conditions) -> Self {
        conditions.0.into_values().collect()
    }
}
