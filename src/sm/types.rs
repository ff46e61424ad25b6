//! Request and response types of the service manager API.

use crate::crd::{OperationCategory, UserInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SERVICE_INSTANCES_PATH: &str = "/v1/service_instances";

/// Labels as modelled by the service manager: every key maps to a list of values
pub type Labels = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProvisionRequest {
    pub name: String,
    #[serde(skip)]
    pub service_offering_name: String,
    #[serde(skip)]
    pub service_plan_name: String,
    pub service_plan_id: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub parameters: serde_json::Value,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionResponse {
    pub instance_id: String,
    pub subaccount_id: String,
    /// Operation location when the broker provisions asynchronously
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpdateRequest {
    pub name: String,
    #[serde(skip)]
    pub service_offering_name: String,
    #[serde(skip)]
    pub service_plan_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub service_plan_id: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub parameters: serde_json::Value,
}

/// Instance as returned by the service manager
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RemoteInstance {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub shared: Option<bool>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub last_operation: Option<Operation>,
}

impl RemoteInstance {
    #[must_use]
    pub fn subaccount_id(&self) -> Option<&str> {
        self.labels
            .get(crate::constants::SUBACCOUNT_ID_LABEL)
            .and_then(|values| values.first())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum OperationState {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

impl OperationState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Succeeded | OperationState::Failed)
    }
}

/// Remote lifecycle operation
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Operation {
    pub id: String,
    pub r#type: OperationCategory,
    pub state: OperationState,
    #[serde(default)]
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<serde_json::Value>,
}

impl Operation {
    /// Description of a failed operation, taken from its structured error payload
    #[must_use]
    pub fn failure_description(&self) -> String {
        match &self.errors {
            Some(serde_json::Value::Object(map)) => match map.get("description") {
                Some(serde_json::Value::String(description)) => description.clone(),
                _ => serde_json::Value::Object(map.clone()).to_string(),
            },
            Some(serde_json::Value::String(raw)) => {
                // Some brokers deliver the payload as an encoded JSON string
                serde_json::from_str::<serde_json::Value>(raw)
                    .ok()
                    .and_then(|v| v.get("description").and_then(|d| d.as_str()).map(str::to_string))
                    .unwrap_or_else(|| raw.clone())
            }
            Some(other) => other.to_string(),
            None => format!("{} operation failed", self.r#type),
        }
    }
}

/// Search parameters for listing instances
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub label_query: Vec<String>,
    pub field_query: Vec<String>,
    pub attach_last_operations: bool,
}

/// Location of an operation of a known instance
#[must_use]
pub fn operation_location(instance_id: &str, operation_id: &str) -> String {
    format!("{SERVICE_INSTANCES_PATH}/{instance_id}/operations/{operation_id}")
}

/// Instance id embedded in an operation location, if any
#[must_use]
pub fn instance_id_from_location(location: &str) -> Option<String> {
    let path = location.split('?').next().unwrap_or(location);
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    while let Some(segment) = segments.next() {
        if segment == "service_instances" {
            return segments.next().map(str::to_string);
        }
    }
    None
}
