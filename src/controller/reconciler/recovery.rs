//! # Recovery
//!
//! Finds a remote instance created for this resource by an earlier attempt, so a
//! restart or a lost status write never leads to a second provisioning.

use crate::constants::K8S_NAME_LABEL;
use crate::controller::reconciler::fingerprint::{
    derived_k8s_name, parameters_fingerprint, spec_fingerprint,
};
use crate::controller::reconciler::transitions::{set_failure, set_in_progress, set_success};
use crate::controller::reconciler::types::{Action, Reconciler};
use crate::crd::{OperationCategory, ServiceInstance};
use crate::sm::types::operation_location;
use crate::sm::{ListQuery, OperationState, RemoteInstance, ServiceManagerClient, SmError};
use std::time::Duration;
use tracing::info;

/// Result of a recovery search
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// No remote instance belongs to this resource
    NotFound,
    /// A remote instance was adopted; its state is reflected in the status
    Adopted(Action),
}

/// Search query identifying the remote instance of a resource
#[must_use]
pub fn recovery_query(cluster_id: &str, instance: &ServiceInstance) -> ListQuery {
    let namespace = instance.metadata.namespace.clone().unwrap_or_default();
    let name = instance.metadata.name.clone().unwrap_or_default();
    ListQuery {
        label_query: vec![format!(
            "{K8S_NAME_LABEL} eq '{}'",
            derived_k8s_name(cluster_id, &namespace, &name)
        )],
        field_query: vec![
            format!("name eq '{}'", instance.external_name()),
            format!(
                "service_offering_name eq '{}'",
                instance.spec.service_offering_name
            ),
            format!("context/clusterid eq '{cluster_id}'"),
            format!("context/namespace eq '{namespace}'"),
        ],
        attach_last_operations: true,
    }
}

/// Look for an existing remote instance and adopt it
///
/// `parameters` is the payload the resource would send now; when given, its
/// fingerprint is recorded with the adopted instance.
///
/// # Errors
/// Returns an error if the search fails or matches more than one instance
pub async fn recover(
    ctx: &Reconciler,
    client: &dyn ServiceManagerClient,
    instance: &mut ServiceInstance,
    parameters: Option<&serde_json::Value>,
) -> Result<Recovery, SmError> {
    let query = recovery_query(&ctx.config.cluster_id, instance);
    let mut candidates = client.list_instances(&query).await?;

    let remote = match candidates.len() {
        0 => return Ok(Recovery::NotFound),
        1 => candidates.remove(0),
        n => {
            return Err(SmError::Unexpected(format!(
                "found {n} instances matching {}, cannot decide which to adopt",
                instance.external_name()
            )))
        }
    };

    if remote.last_operation.as_ref().is_some_and(|op| {
        op.r#type == OperationCategory::Delete && op.state == OperationState::Succeeded
    }) {
        return Ok(Recovery::NotFound);
    }

    Ok(Recovery::Adopted(adopt(
        ctx, instance, remote, parameters,
    )))
}

fn adopt(
    ctx: &Reconciler,
    instance: &mut ServiceInstance,
    remote: RemoteInstance,
    parameters: Option<&serde_json::Value>,
) -> Action {
    info!(
        "♻️  Adopting remote instance {} for {}/{}",
        remote.id,
        instance.metadata.namespace.as_deref().unwrap_or_default(),
        instance.metadata.name.as_deref().unwrap_or_default()
    );

    let hashed_spec = spec_fingerprint(&instance.spec);
    let status = instance.status.get_or_insert_with(Default::default);
    status.instance_id.clone_from(&remote.id);
    if let Some(subaccount) = remote.subaccount_id() {
        status.subaccount_id = subaccount.to_string();
    }
    status.hashed_spec = hashed_spec;
    if let Some(parameters) = parameters {
        status.parameters_hash = parameters_fingerprint(parameters);
    }

    match remote.last_operation {
        Some(op) if !op.state.is_terminal() => {
            status.start_operation(op.r#type, operation_location(&remote.id, &op.id));
            set_in_progress(instance, op.r#type, "");
            Action::requeue(ctx.config.poll_interval())
        }
        Some(op) if op.state == OperationState::Failed => {
            set_failure(instance, op.r#type, &op.failure_description());
            Action::await_change()
        }
        Some(op) => {
            set_success(instance, op.r#type);
            Action::requeue(Duration::ZERO)
        }
        None if remote.ready => {
            set_success(instance, OperationCategory::Create);
            Action::requeue(Duration::ZERO)
        }
        None => {
            set_failure(
                instance,
                OperationCategory::Create,
                &format!("recovered instance {} is not ready", remote.id),
            );
            Action::await_change()
        }
    }
}
