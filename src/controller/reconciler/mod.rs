//! # Reconciler
//!
//! Core reconciliation logic for `ServiceInstance` resources.
//!
//! The reconciler drives the service manager until the remote instance matches the
//! resource, and reflects what it observed in the resource status.
//!
//! ## Reconciliation Flow
//!
//! 1. Deleted resources deprovision the remote instance and release their finalizer
//! 2. Ensure the finalizer and the secret watch edges
//! 3. Poll an in-flight remote operation; nothing else happens until it is terminal
//! 4. Without a remote instance: recover an orphan or provision
//! 5. Update when the spec or the watched parameters changed
//! 6. Share or unshare
//!
//! Every invocation writes the status at most once, and only when it changed.

pub mod delete;
pub mod fingerprint;
pub mod operation;
pub mod parameters;
pub mod provision;
pub mod recovery;
pub mod secrets;
pub mod share;
pub mod transitions;
pub mod types;
pub mod update;

pub use share::sharing_update_required;
pub use types::{Action, BackoffState, Reconciler, ReconcilerError, TriggerSource};

use crate::constants::FINALIZER_NAME;
use crate::crd::{ConditionType, InstanceKey, ServiceInstance, ServiceInstanceStatus};
use crate::observability::metrics;
use fingerprint::{parameters_fingerprint, spec_fingerprint};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, Instrument};

/// True when the resource needs no remote call at all
///
/// Drift of secret-sourced parameters is not visible here; the reconciler checks it
/// separately for instances that watch their secrets.
#[must_use]
pub fn is_final_state(instance: &ServiceInstance) -> bool {
    let Some(status) = instance.status.as_ref() else {
        return false;
    };
    let generation = instance.metadata.generation.unwrap_or_default();

    !status.has_operation()
        && status.conditions.is_true_at(ConditionType::Succeeded, generation)
        && spec_fingerprint(&instance.spec) == status.hashed_spec
        && !sharing_update_required(instance)
}

/// Continue right away unless the resource has settled
#[must_use]
pub fn next_action(instance: &ServiceInstance) -> Action {
    if is_final_state(instance) {
        Action::await_change()
    } else {
        Action::requeue(Duration::ZERO)
    }
}

/// Reconcile one resource
///
/// # Errors
/// Returns an error when the store cannot be read or written; remote failures are
/// recorded in the status and turned into a requeue instead
pub async fn reconcile(
    key: InstanceKey,
    ctx: &Reconciler,
    trigger_source: TriggerSource,
) -> Result<Action, ReconcilerError> {
    let start = Instant::now();
    metrics::increment_reconciliations();

    let span = tracing::info_span!(
        "reconcile",
        resource.name = %key.name,
        resource.namespace = %key.namespace,
        resource.kind = "ServiceInstance",
        trigger = trigger_source.as_str()
    );
    let result = reconcile_instance(&key, ctx, trigger_source)
        .instrument(span)
        .await;

    metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        metrics::increment_reconciliation_errors();
        error!("❌ Reconciliation of {} failed: {}", key, e);
    }
    result
}

async fn reconcile_instance(
    key: &InstanceKey,
    ctx: &Reconciler,
    trigger_source: TriggerSource,
) -> Result<Action, ReconcilerError> {
    let Some(mut instance) = ctx.store.get_instance(key).await? else {
        debug!("{} no longer exists", key);
        ctx.forget(key);
        return Ok(Action::await_change());
    };
    debug!(
        "🔄 Reconciling ServiceInstance {} (trigger source: {})",
        key,
        trigger_source.as_str()
    );

    let snapshot = instance.status.clone();
    let action = if instance.metadata.deletion_timestamp.is_some() {
        delete::reconcile_delete(ctx, &mut instance).await?
    } else {
        reconcile_live(ctx, &mut instance).await?
    };

    let removed =
        instance.metadata.deletion_timestamp.is_some() && !delete::has_finalizer(&instance);
    if !removed {
        commit_status(ctx, &mut instance, snapshot.as_ref()).await?;
    }
    Ok(action)
}

async fn reconcile_live(
    ctx: &Reconciler,
    instance: &mut ServiceInstance,
) -> Result<Action, ReconcilerError> {
    ensure_finalizer(ctx, instance).await?;
    secrets::sync_watch_edges(ctx, instance).await?;

    if instance.status.as_ref().is_some_and(ServiceInstanceStatus::has_operation) {
        return operation::poll(ctx, instance).await;
    }

    let status = instance.status.clone().unwrap_or_default();
    if status.instance_id.is_empty() {
        return provision::create(ctx, instance).await;
    }

    let spec_changed = update::spec_changed(instance);
    let watches = instance.spec.watches_parameters();
    if spec_changed || watches || status.hashed_spec.is_empty() {
        let parameters = parameters::resolve(ctx.store.as_ref(), instance).await;

        if status.hashed_spec.is_empty() {
            // adopted from an older status: take the current state as applied
            let hashed_spec = spec_fingerprint(&instance.spec);
            let status = instance.status.get_or_insert_with(Default::default);
            status.hashed_spec = hashed_spec;
            if let Ok(parameters) = &parameters {
                status.parameters_hash = parameters_fingerprint(parameters);
            }
        } else if spec_changed
            || match &parameters {
                Ok(parameters) => update::parameters_changed(instance, parameters),
                Err(_) => true,
            }
        {
            return update::update(ctx, instance, parameters).await;
        }
    }

    let generation = instance.metadata.generation.unwrap_or_default();
    let conditions = &status.conditions;
    if conditions.is_true(ConditionType::Succeeded)
        && !conditions.is_true_at(ConditionType::Succeeded, generation)
    {
        transitions::refresh_generation(instance);
    }

    if sharing_update_required(instance) {
        return share::reconcile_sharing(ctx, instance).await;
    }

    ctx.reset_backoff(&InstanceKey::from_instance(instance));
    Ok(Action::await_change())
}

async fn ensure_finalizer(
    ctx: &Reconciler,
    instance: &mut ServiceInstance,
) -> Result<(), ReconcilerError> {
    if delete::has_finalizer(instance) {
        return Ok(());
    }
    let mut updated = instance.clone();
    updated
        .metadata
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(FINALIZER_NAME.to_string());
    let stored = ctx.store.update_instance(&updated).await?;
    instance.metadata = stored.metadata;
    info!(
        "Added finalizer to {}",
        InstanceKey::from_instance(instance)
    );
    Ok(())
}

/// Write the status if it differs from what was read
async fn commit_status(
    ctx: &Reconciler,
    instance: &mut ServiceInstance,
    snapshot: Option<&ServiceInstanceStatus>,
) -> Result<(), ReconcilerError> {
    if instance.status.as_ref() == snapshot {
        return Ok(());
    }
    let stored = ctx.store.update_instance_status(instance).await?;
    instance.metadata.resource_version = stored.metadata.resource_version;
    Ok(())
}
