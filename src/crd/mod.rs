//! # Custom Resource Definitions
//!
//! The `ServiceInstance` CRD and its status model.

mod conditions;
mod spec;
mod status;

pub use conditions::{Condition, ConditionStatus, ConditionType, Conditions, Reason};
pub use spec::{
    ParametersFromSource, SecretKeyReference, ServiceInstance, ServiceInstanceSpec, UserInfo,
};
pub use status::{OperationCategory, ServiceInstanceStatus};

use std::fmt;

/// Namespaced name identifying an instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub namespace: String,
    pub name: String,
}

impl InstanceKey {
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    #[must_use]
    pub fn from_instance(instance: &ServiceInstance) -> Self {
        Self::new(
            instance.metadata.namespace.clone().unwrap_or_default(),
            instance.metadata.name.clone().unwrap_or_default(),
        )
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
