//! # Delete
//!
//! Deprovisions the remote instance of a resource marked for deletion, then releases
//! its watched secrets and its finalizer.

use crate::constants::FINALIZER_NAME;
use crate::controller::reconciler::operation;
use crate::controller::reconciler::recovery::{recover, Recovery};
use crate::controller::reconciler::secrets::remove_all_watch_edges;
use crate::controller::reconciler::transitions::{handle_error, set_in_progress};
use crate::controller::reconciler::types::{Action, Reconciler, ReconcilerError};
use crate::crd::{InstanceKey, OperationCategory, ServiceInstance};
use tracing::info;

/// Whether the instance still carries the operator finalizer
#[must_use]
pub fn has_finalizer(instance: &ServiceInstance) -> bool {
    instance
        .metadata
        .finalizers
        .iter()
        .flatten()
        .any(|f| f == FINALIZER_NAME)
}

/// Drive a resource marked for deletion
///
/// # Errors
/// Returns an error if a store write fails
pub async fn reconcile_delete(
    ctx: &Reconciler,
    instance: &mut ServiceInstance,
) -> Result<Action, ReconcilerError> {
    if !has_finalizer(instance) {
        return Ok(Action::await_change());
    }

    if instance.status.as_ref().is_some_and(|s| s.has_operation()) {
        return operation::poll(ctx, instance).await;
    }

    let client = match ctx.clients.client_for(instance).await {
        Ok(client) => client,
        Err(e) => return Ok(handle_error(ctx, instance, OperationCategory::Delete, &e)),
    };

    let has_id = instance
        .status
        .as_ref()
        .is_some_and(|s| !s.instance_id.is_empty());
    if !has_id {
        match recover(ctx, client.as_ref(), instance, None).await {
            Ok(Recovery::NotFound) => {
                info!(
                    "No remote instance for {}, removing it",
                    InstanceKey::from_instance(instance)
                );
                return remove(ctx, instance).await;
            }
            Ok(Recovery::Adopted(action)) => {
                if instance.status.as_ref().is_some_and(|s| s.has_operation()) {
                    return Ok(action);
                }
            }
            Err(e) => return Ok(handle_error(ctx, instance, OperationCategory::Delete, &e)),
        }
    }

    let key = InstanceKey::from_instance(instance);
    let instance_id = instance
        .status
        .as_ref()
        .map(|s| s.instance_id.clone())
        .unwrap_or_default();
    info!("🗑️  Deprovisioning {} ({})", key, instance_id);

    match client.deprovision(&instance_id).await {
        Ok(None) => {
            info!("✅ Deprovisioned {}", key);
            remove(ctx, instance).await
        }
        Ok(Some(location)) => {
            info!("⏳ Deprovisioning of {} continues asynchronously", key);
            ctx.reset_backoff(&key);
            instance
                .status
                .get_or_insert_with(Default::default)
                .start_operation(OperationCategory::Delete, location);
            set_in_progress(instance, OperationCategory::Delete, "");
            Ok(Action::requeue(ctx.config.poll_interval()))
        }
        Err(e) if e.is_gone() => {
            info!("Remote instance of {} is already gone", key);
            remove(ctx, instance).await
        }
        Err(e) => Ok(handle_error(ctx, instance, OperationCategory::Delete, &e)),
    }
}

/// Release watched secrets, then let the resource go
///
/// # Errors
/// Returns an error if a store write fails
pub async fn remove(ctx: &Reconciler, instance: &mut ServiceInstance) -> Result<Action, ReconcilerError> {
    let key = InstanceKey::from_instance(instance);
    remove_all_watch_edges(ctx, instance).await?;

    if has_finalizer(instance) {
        let mut updated = instance.clone();
        if let Some(finalizers) = updated.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != FINALIZER_NAME);
        }
        let stored = ctx.store.update_instance(&updated).await?;
        instance.metadata = stored.metadata;
    }

    info!("🗑️  Removed finalizer from {}", key);
    ctx.forget(&key);
    Ok(Action::await_change())
}
