//! # Cluster Store
//!
//! Access to the declarative state the reconciler reads and writes: instances and
//! the secrets they reference.
//!
//! Writes carry the resourceVersion of the object they were computed from; a write
//! based on stale state fails with [`StoreError::Conflict`] and must be recomputed
//! from a fresh read.

use crate::crd::{InstanceKey, ServiceInstance};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use thiserror::Error;

pub mod kube;

pub use self::kube::KubeStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },
    #[error("conflicting write to {kind} {namespace}/{name}")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
    },
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] ::kube::Error),
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_instance(&self, key: &InstanceKey) -> Result<Option<ServiceInstance>, StoreError>;

    /// Instances of `namespace` carrying the label `label_key` (any value)
    async fn list_instances_with_label(
        &self,
        namespace: &str,
        label_key: &str,
    ) -> Result<Vec<ServiceInstance>, StoreError>;

    /// Replace the instance metadata (labels, annotations, finalizers)
    async fn update_instance(&self, instance: &ServiceInstance) -> Result<ServiceInstance, StoreError>;

    /// Replace the instance status
    async fn update_instance_status(
        &self,
        instance: &ServiceInstance,
    ) -> Result<ServiceInstance, StoreError>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError>;

    /// Replace the secret metadata
    async fn update_secret(&self, secret: &Secret) -> Result<Secret, StoreError>;
}
