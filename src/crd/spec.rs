//! # ServiceInstance Spec
//!
//! Desired state of a service instance as declared by its owner.

use schemars::{JsonSchema, Schema, SchemaGenerator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// ServiceInstance Custom Resource Definition
///
/// Declares an instance of a service offering/plan to be provisioned through the
/// service manager.
///
/// # Example
///
/// ```yaml
/// apiVersion: services.cloud.sap.com/v1
/// kind: ServiceInstance
/// metadata:
///   name: my-db
///   namespace: default
/// spec:
///   serviceOfferingName: postgresql-db
///   servicePlanName: trial
///   parameters:
///     region: eu10
///   parametersFrom:
///     - secretKeyRef:
///         name: db-params
///         key: secret-parameter
///   watchParametersFromChanges: true
///   shared: true
/// ```
#[derive(kube::CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    kind = "ServiceInstance",
    group = "services.cloud.sap.com",
    version = "v1",
    namespaced,
    status = "crate::crd::ServiceInstanceStatus",
    shortname = "si",
    printcolumn = r#"{"name":"Offering", "type":"string", "jsonPath":".spec.serviceOfferingName"}, {"name":"Plan", "type":"string", "jsonPath":".spec.servicePlanName"}, {"name":"Shared", "type":"boolean", "jsonPath":".spec.shared"}, {"name":"Status", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Succeeded\")].reason"}, {"name":"Ready", "type":"string", "jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceSpec {
    /// Name of the service offering in the service marketplace
    pub service_offering_name: String,
    /// Name of the plan within the offering
    pub service_plan_name: String,
    /// Plan id; resolved from offering and plan names when empty
    #[serde(default, rename = "servicePlanID", skip_serializing_if = "String::is_empty")]
    pub service_plan_id: String,
    /// Name of the instance in the service manager; defaults to the resource name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub external_name: String,
    /// Provisioning parameters passed to the broker as-is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub parameters: Option<serde_json::Value>,
    /// Secrets whose keys are merged into the provisioning parameters
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters_from: Vec<ParametersFromSource>,
    /// Re-apply parameters when a referenced secret changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_parameters_from_changes: Option<bool>,
    /// Share the instance with other subaccounts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared: Option<bool>,
    /// Tags attached to the instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_tags: Vec<String>,
    /// Secret holding the service manager access credentials for this instance
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub btp_access_credentials_secret: String,
    /// Identity of the user who created the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

/// Source of provisioning parameters
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParametersFromSource {
    /// A key of a secret in the instance namespace holding a JSON object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<SecretKeyReference>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SecretKeyReference {
    pub name: String,
    pub key: String,
}

/// Requesting user as recorded by admission
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct UserInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Vec<String>>,
}

impl ServiceInstanceSpec {
    /// Whether referenced parameter secrets should be watched
    #[must_use]
    pub fn watches_parameters(&self) -> bool {
        self.watch_parameters_from_changes.unwrap_or(false)
    }

    /// Names of all secrets referenced by `parametersFrom`, deduplicated and sorted
    #[must_use]
    pub fn referenced_secrets(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .parameters_from
            .iter()
            .filter_map(|source| source.secret_key_ref.as_ref())
            .map(|reference| reference.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

impl ServiceInstance {
    /// Name of the instance in the service manager
    #[must_use]
    pub fn external_name(&self) -> String {
        if self.spec.external_name.is_empty() {
            self.metadata.name.clone().unwrap_or_default()
        } else {
            self.spec.external_name.clone()
        }
    }
}

/// Arbitrary JSON object kept verbatim by the API server
fn preserve_unknown_fields(_gen: &mut SchemaGenerator) -> Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}
