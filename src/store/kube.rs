//! Kubernetes-backed [`ClusterStore`].

use super::{ClusterStore, StoreError};
use crate::crd::{InstanceKey, ServiceInstance};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};

const FIELD_MANAGER: &str = "service-instance-operator";

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn instances(&self, namespace: &str) -> Api<ServiceInstance> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Translate API status codes the reconciler reacts to
fn map_error(error: kube::Error, kind: &'static str, namespace: &str, name: &str) -> StoreError {
    match &error {
        kube::Error::Api(response) if response.code == 409 => StoreError::Conflict {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(response) if response.code == 404 => StoreError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        _ => StoreError::Kube(error),
    }
}

/// Status merge patch in which cleared fields are explicit nulls
fn status_patch(instance: &ServiceInstance) -> Result<serde_json::Value, StoreError> {
    let mut value = serde_json::to_value(instance.status.clone().unwrap_or_default())
        .map_err(|e| StoreError::Other(format!("failed to serialize status: {e}")))?;
    if let Some(fields) = value.as_object_mut() {
        for field in CLEARABLE_STATUS_FIELDS {
            fields
                .entry((*field).to_string())
                .or_insert(serde_json::Value::Null);
        }
    }
    Ok(value)
}

const CLEARABLE_STATUS_FIELDS: &[&str] = &[
    "instanceID",
    "subaccountID",
    "hashedSpec",
    "parametersHash",
    "operationURL",
    "operationType",
    "ready",
];

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_instance(&self, key: &InstanceKey) -> Result<Option<ServiceInstance>, StoreError> {
        Ok(self.instances(&key.namespace).get_opt(&key.name).await?)
    }

    async fn list_instances_with_label(
        &self,
        namespace: &str,
        label_key: &str,
    ) -> Result<Vec<ServiceInstance>, StoreError> {
        let list = self
            .instances(namespace)
            .list(&ListParams::default().labels(label_key))
            .await?;
        Ok(list.items)
    }

    async fn update_instance(&self, instance: &ServiceInstance) -> Result<ServiceInstance, StoreError> {
        let namespace = instance.namespace().unwrap_or_default();
        let name = instance.name_any();
        self.instances(&namespace)
            .replace(&name, &PostParams::default(), instance)
            .await
            .map_err(|e| map_error(e, "ServiceInstance", &namespace, &name))
    }

    async fn update_instance_status(
        &self,
        instance: &ServiceInstance,
    ) -> Result<ServiceInstance, StoreError> {
        let namespace = instance.namespace().unwrap_or_default();
        let name = instance.name_any();
        // The resourceVersion turns the merge patch into a conditional write
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": instance.resource_version() },
            "status": status_patch(instance)?,
        });
        self.instances(&namespace)
            .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_error(e, "ServiceInstance", &namespace, &name))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        Ok(self.secrets(namespace).get_opt(name).await?)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        let namespace = secret.namespace().unwrap_or_default();
        let name = secret.name_any();
        self.secrets(&namespace)
            .replace(&name, &PostParams::default(), secret)
            .await
            .map_err(|e| map_error(e, "Secret", &namespace, &name))
    }
}
