//! # ServiceInstance Status
//!
//! Observed state written by the operator.

use crate::crd::Conditions;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a remote lifecycle operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OperationCategory {
    Create,
    Update,
    Delete,
}

impl OperationCategory {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationCategory::Create => "create",
            OperationCategory::Update => "update",
            OperationCategory::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of the ServiceInstance resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceStatus {
    /// Instance id assigned by the service manager
    #[serde(default, rename = "instanceID", skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
    #[serde(default, rename = "subaccountID", skip_serializing_if = "String::is_empty")]
    pub subaccount_id: String,
    /// Fingerprint of the spec last applied remotely
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hashed_spec: String,
    /// Fingerprint of the merged parameters last sent remotely
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parameters_hash: String,
    /// Location of the in-flight remote operation
    #[serde(default, rename = "operationURL", skip_serializing_if = "String::is_empty")]
    pub operation_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_type: Option<OperationCategory>,
    #[serde(default)]
    #[schemars(with = "Vec<crate::crd::Condition>")]
    pub conditions: Conditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<crate::crd::ConditionStatus>,
}

impl ServiceInstanceStatus {
    #[must_use]
    pub fn has_operation(&self) -> bool {
        !self.operation_url.is_empty()
    }

    /// Record a tracked remote operation
    pub fn start_operation(&mut self, category: OperationCategory, location: impl Into<String>) {
        self.operation_url = location.into();
        self.operation_type = Some(category);
    }

    pub fn clear_operation(&mut self) {
        self.operation_url.clear();
        self.operation_type = None;
    }
}
