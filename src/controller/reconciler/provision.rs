//! # Create
//!
//! Provisions the remote instance of a resource that has none yet, after making
//! sure an earlier attempt did not already create one.

use crate::constants::{CLUSTER_ID_LABEL, K8S_NAME_LABEL, NAMESPACE_LABEL};
use crate::controller::reconciler::fingerprint::{
    derived_k8s_name, parameters_fingerprint, spec_fingerprint,
};
use crate::controller::reconciler::next_action;
use crate::controller::reconciler::parameters;
use crate::controller::reconciler::recovery::{recover, Recovery};
use crate::controller::reconciler::transitions::{
    handle_error, handle_parameters_error, set_in_progress, set_success,
};
use crate::controller::reconciler::types::{Action, Reconciler, ReconcilerError};
use crate::crd::{InstanceKey, OperationCategory, ServiceInstance};
use crate::sm::types::Labels;
use crate::sm::ProvisionRequest;
use std::collections::BTreeMap;
use tracing::info;

/// Provision request for an instance with the given merged parameters
#[must_use]
pub fn provision_request(
    cluster_id: &str,
    instance: &ServiceInstance,
    parameters: serde_json::Value,
) -> ProvisionRequest {
    let namespace = instance.metadata.namespace.clone().unwrap_or_default();
    let name = instance.metadata.name.clone().unwrap_or_default();

    let labels: Labels = [
        (
            K8S_NAME_LABEL.to_string(),
            vec![derived_k8s_name(cluster_id, &namespace, &name)],
        ),
        (CLUSTER_ID_LABEL.to_string(), vec![cluster_id.to_string()]),
        (NAMESPACE_LABEL.to_string(), vec![namespace.clone()]),
    ]
    .into_iter()
    .collect();

    let context: BTreeMap<String, String> = [
        ("clusterid".to_string(), cluster_id.to_string()),
        ("namespace".to_string(), namespace),
        ("instance_name".to_string(), name),
    ]
    .into_iter()
    .collect();

    ProvisionRequest {
        name: instance.external_name(),
        service_offering_name: instance.spec.service_offering_name.clone(),
        service_plan_name: instance.spec.service_plan_name.clone(),
        service_plan_id: instance.spec.service_plan_id.clone(),
        parameters,
        labels,
        context,
        tags: instance.spec.custom_tags.clone(),
        user: instance.spec.user_info.clone(),
    }
}

/// Create the remote instance, or adopt the one a previous attempt left behind
///
/// # Errors
/// Returns an error if a store read fails
pub async fn create(ctx: &Reconciler, instance: &mut ServiceInstance) -> Result<Action, ReconcilerError> {
    let key = InstanceKey::from_instance(instance);

    let parameters = match parameters::resolve(ctx.store.as_ref(), instance).await {
        Ok(parameters) => parameters,
        Err(e) => return handle_parameters_error(ctx, instance, OperationCategory::Create, e),
    };

    let client = match ctx.clients.client_for(instance).await {
        Ok(client) => client,
        Err(e) => return Ok(handle_error(ctx, instance, OperationCategory::Create, &e)),
    };

    match recover(ctx, client.as_ref(), instance, Some(&parameters)).await {
        Ok(Recovery::Adopted(action)) => return Ok(action),
        Ok(Recovery::NotFound) => {}
        Err(e) => return Ok(handle_error(ctx, instance, OperationCategory::Create, &e)),
    }

    info!(
        "🆕 Provisioning {} ({} / {}) for {}",
        instance.external_name(),
        instance.spec.service_offering_name,
        instance.spec.service_plan_name,
        key
    );

    let request = provision_request(&ctx.config.cluster_id, instance, parameters);
    let hashed_spec = spec_fingerprint(&instance.spec);
    let parameters_hash = parameters_fingerprint(&request.parameters);
    {
        let status = instance.status.get_or_insert_with(Default::default);
        status.hashed_spec = hashed_spec;
        status.parameters_hash = parameters_hash;
    }

    let response = match client.provision(&request).await {
        Ok(response) => response,
        Err(e) => return Ok(handle_error(ctx, instance, OperationCategory::Create, &e)),
    };

    ctx.reset_backoff(&key);
    let status = instance.status.get_or_insert_with(Default::default);
    status.instance_id = response.instance_id;
    status.subaccount_id = response.subaccount_id;

    if let Some(location) = response.location {
        info!("⏳ Provisioning of {} continues asynchronously", key);
        status.start_operation(OperationCategory::Create, location);
        set_in_progress(instance, OperationCategory::Create, "");
        return Ok(Action::requeue(ctx.config.poll_interval()));
    }

    info!("✅ Provisioned {} as {}", key, status.instance_id);
    set_success(instance, OperationCategory::Create);
    Ok(next_action(instance))
}
