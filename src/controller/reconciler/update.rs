//! # Update
//!
//! Applies spec edits and changed secret-sourced parameters to an existing remote
//! instance.

use crate::controller::reconciler::fingerprint::{parameters_fingerprint, spec_fingerprint};
use crate::controller::reconciler::next_action;
use crate::controller::reconciler::parameters::ParametersError;
use crate::controller::reconciler::transitions::{
    handle_error, handle_parameters_error, set_in_progress, set_success,
};
use crate::controller::reconciler::types::{Action, Reconciler, ReconcilerError};
use crate::crd::{ConditionType, InstanceKey, OperationCategory, Reason, ServiceInstance};
use crate::sm::UpdateRequest;
use tracing::info;

/// Whether the spec differs from what was last applied, or an update is pending
#[must_use]
pub fn spec_changed(instance: &ServiceInstance) -> bool {
    let Some(status) = instance.status.as_ref() else {
        return true;
    };
    spec_fingerprint(&instance.spec) != status.hashed_spec
        || status.conditions.reason(ConditionType::Succeeded) == Some(Reason::UpdateInProgress)
}

/// Whether the merged parameters differ from the payload last sent
#[must_use]
pub fn parameters_changed(instance: &ServiceInstance, parameters: &serde_json::Value) -> bool {
    instance
        .status
        .as_ref()
        .is_none_or(|status| parameters_fingerprint(parameters) != status.parameters_hash)
}

/// Update request for an instance with the given merged parameters
#[must_use]
pub fn update_request(instance: &ServiceInstance, parameters: serde_json::Value) -> UpdateRequest {
    UpdateRequest {
        name: instance.external_name(),
        service_offering_name: instance.spec.service_offering_name.clone(),
        service_plan_name: instance.spec.service_plan_name.clone(),
        service_plan_id: instance.spec.service_plan_id.clone(),
        parameters,
    }
}

/// Send the current spec and parameters to the existing remote instance
///
/// # Errors
/// Returns an error if a store read fails
pub async fn update(
    ctx: &Reconciler,
    instance: &mut ServiceInstance,
    parameters: Result<serde_json::Value, ParametersError>,
) -> Result<Action, ReconcilerError> {
    let key = InstanceKey::from_instance(instance);
    let parameters = match parameters {
        Ok(parameters) => parameters,
        Err(e) => return handle_parameters_error(ctx, instance, OperationCategory::Update, e),
    };

    let client = match ctx.clients.client_for(instance).await {
        Ok(client) => client,
        Err(e) => return Ok(handle_error(ctx, instance, OperationCategory::Update, &e)),
    };

    let instance_id = instance
        .status
        .as_ref()
        .map(|s| s.instance_id.clone())
        .unwrap_or_default();
    info!("🔁 Updating {} ({})", key, instance_id);

    let request = update_request(instance, parameters);
    let hashed_spec = spec_fingerprint(&instance.spec);
    let parameters_hash = parameters_fingerprint(&request.parameters);
    {
        let status = instance.status.get_or_insert_with(Default::default);
        status.hashed_spec = hashed_spec;
        status.parameters_hash = parameters_hash;
    }

    match client.update_instance(&instance_id, &request).await {
        Ok(Some(location)) => {
            info!("⏳ Update of {} continues asynchronously", key);
            ctx.reset_backoff(&key);
            instance
                .status
                .get_or_insert_with(Default::default)
                .start_operation(OperationCategory::Update, location);
            set_in_progress(instance, OperationCategory::Update, "");
            Ok(Action::requeue(ctx.config.poll_interval()))
        }
        Ok(None) => {
            info!("✅ Updated {}", key);
            ctx.reset_backoff(&key);
            set_success(instance, OperationCategory::Update);
            Ok(next_action(instance))
        }
        Err(e) => Ok(handle_error(ctx, instance, OperationCategory::Update, &e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ServiceInstanceSpec, ServiceInstanceStatus};
    use serde_json::json;

    fn settled() -> ServiceInstance {
        let mut instance = ServiceInstance::new(
            "db",
            ServiceInstanceSpec {
                service_offering_name: "postgres".to_string(),
                service_plan_name: "small".to_string(),
                ..Default::default()
            },
        );
        instance.status = Some(ServiceInstanceStatus {
            instance_id: "id-1".to_string(),
            hashed_spec: spec_fingerprint(&instance.spec),
            parameters_hash: parameters_fingerprint(&json!({"a": 1})),
            ..Default::default()
        });
        instance
    }

    #[test]
    fn test_spec_edit_needs_update() {
        let mut instance = settled();
        assert!(!spec_changed(&instance));
        instance.spec.service_plan_name = "large".to_string();
        assert!(spec_changed(&instance));
    }

    #[test]
    fn test_pending_update_is_retried() {
        let mut instance = settled();
        set_in_progress(&mut instance, OperationCategory::Update, "rate limited");
        assert!(spec_changed(&instance));
    }

    #[test]
    fn test_parameter_drift() {
        let instance = settled();
        assert!(!parameters_changed(&instance, &json!({"a": 1})));
        assert!(parameters_changed(&instance, &json!({"a": 2})));
    }
}
