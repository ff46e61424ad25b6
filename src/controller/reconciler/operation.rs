//! # Operation Tracking
//!
//! Polls the remote operation recorded in `status.operationURL` and applies its
//! outcome. No new remote lifecycle call is issued while an operation is tracked.

use crate::controller::reconciler::delete;
use crate::controller::reconciler::transitions::{
    handle_error, set_failure, set_in_progress, set_success,
};
use crate::controller::reconciler::types::{Action, Reconciler, ReconcilerError};
use crate::controller::reconciler::next_action;
use crate::crd::{
    Condition, ConditionStatus, ConditionType, InstanceKey, OperationCategory, Reason,
    ServiceInstance,
};
use crate::observability::metrics;
use crate::sm::types::instance_id_from_location;
use crate::sm::{ErrorClass, Operation, OperationState, ServiceManagerClient};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Category of the tracked operation, inferred for statuses written without one
fn tracked_category(instance: &ServiceInstance) -> OperationCategory {
    let status = instance.status.clone().unwrap_or_default();
    status.operation_type.unwrap_or_else(|| {
        if instance.metadata.deletion_timestamp.is_some() {
            OperationCategory::Delete
        } else if status.instance_id.is_empty() {
            OperationCategory::Create
        } else {
            OperationCategory::Update
        }
    })
}

/// Poll the tracked operation once
///
/// # Errors
/// Returns an error if a store write fails
pub async fn poll(ctx: &Reconciler, instance: &mut ServiceInstance) -> Result<Action, ReconcilerError> {
    let category = tracked_category(instance);
    let location = instance
        .status
        .as_ref()
        .map(|s| s.operation_url.clone())
        .unwrap_or_default();

    let client = match ctx.clients.client_for(instance).await {
        Ok(client) => client,
        Err(e) => return Ok(handle_error(ctx, instance, category, &e)),
    };

    match client.status(&location).await {
        Ok(op) => apply(ctx, client.as_ref(), instance, category, &location, op).await,
        Err(e) if e.status_code() == Some(404) => Ok(operation_gone(ctx, instance, category, &location)),
        Err(e) => Ok(handle_error(ctx, instance, category, &e)),
    }
}

async fn apply(
    ctx: &Reconciler,
    client: &dyn ServiceManagerClient,
    instance: &mut ServiceInstance,
    category: OperationCategory,
    location: &str,
    op: Operation,
) -> Result<Action, ReconcilerError> {
    let key = InstanceKey::from_instance(instance);
    let deleting = instance.metadata.deletion_timestamp.is_some();

    match op.state {
        OperationState::Pending | OperationState::InProgress => {
            debug!("{} operation of {} still {:?}", category, key, op.state);
            set_in_progress(instance, category, "");
            metrics::increment_requeues_total("operation_in_progress");
            return Ok(Action::requeue(ctx.config.poll_interval()));
        }
        OperationState::Succeeded => {
            info!("✅ {} operation of {} succeeded", category, key);
            ctx.reset_backoff(&key);
            let status = instance.status.get_or_insert_with(Default::default);
            status.clear_operation();
            match category {
                OperationCategory::Create => {
                    if status.instance_id.is_empty() {
                        status.instance_id = if op.resource_id.is_empty() {
                            instance_id_from_location(location).unwrap_or_default()
                        } else {
                            op.resource_id.clone()
                        };
                    }
                    if status.subaccount_id.is_empty() && !status.instance_id.is_empty() {
                        match client.get_instance_by_id(&status.instance_id).await {
                            Ok(remote) => {
                                if let Some(subaccount) = remote.subaccount_id() {
                                    status.subaccount_id = subaccount.to_string();
                                }
                            }
                            Err(e) => warn!("Failed to read subaccount of {}: {}", key, e),
                        }
                    }
                    set_success(instance, OperationCategory::Create);
                }
                OperationCategory::Update => set_success(instance, OperationCategory::Update),
                OperationCategory::Delete => {
                    if deleting {
                        return delete::remove(ctx, instance).await;
                    }
                    // removed remotely while the resource stays: provision it again
                    status.instance_id.clear();
                    status.subaccount_id.clear();
                    return Ok(Action::requeue(Duration::ZERO));
                }
            }
        }
        OperationState::Failed => {
            let description = op.failure_description();
            warn!("❌ {} operation of {} failed: {}", category, key, description);
            instance
                .status
                .get_or_insert_with(Default::default)
                .clear_operation();
            set_failure(instance, category, &description);
            if category == OperationCategory::Delete {
                metrics::increment_requeues_total(ErrorClass::Transient.as_str());
                return Ok(Action::requeue(ctx.backoff_for(&key, ErrorClass::Transient)));
            }
        }
    }

    if deleting {
        // let the delete path take over now that nothing is in flight
        return Ok(Action::requeue(Duration::ZERO));
    }
    Ok(next_action(instance))
}

/// The manager no longer knows the tracked operation
fn operation_gone(
    ctx: &Reconciler,
    instance: &mut ServiceInstance,
    category: OperationCategory,
    location: &str,
) -> Action {
    let key = InstanceKey::from_instance(instance);
    let message = format!("operation {location} no longer exists");
    warn!("❓ {} operation of {}: {}", category, key, message);

    let generation = instance.metadata.generation.unwrap_or_default();
    let status = instance.status.get_or_insert_with(Default::default);
    status.clear_operation();
    if category == OperationCategory::Create {
        // search again, the instance may or may not exist
        status.instance_id.clear();
    }
    set_failure(instance, category, &message);
    if category == OperationCategory::Update {
        if let Some(status) = instance.status.as_mut() {
            status.conditions.set(Condition::new(
                ConditionType::Succeeded,
                ConditionStatus::False,
                Reason::UpdateInProgress,
                message,
                generation,
            ));
        }
    }

    metrics::increment_requeues_total("operation_gone");
    Action::requeue(ctx.backoff_for(&key, ErrorClass::Transient))
}
