//! # Sharing
//!
//! Applies `spec.shared` once the instance itself is settled. Sharing results only
//! ever touch the `Shared` condition.

use crate::controller::reconciler::types::{Action, Reconciler, ReconcilerError};
use crate::crd::{
    Condition, ConditionStatus, ConditionType, InstanceKey, Reason, ServiceInstance,
};
use crate::observability::metrics;
use crate::sm::{ErrorClass, SmError};
use std::time::Duration;
use tracing::{info, warn};

/// Whether a share or unshare call is needed to match `spec.shared`
#[must_use]
pub fn sharing_update_required(instance: &ServiceInstance) -> bool {
    let Some(status) = instance.status.as_ref() else {
        return false;
    };
    if !status.conditions.is_true(ConditionType::Succeeded) {
        return false;
    }

    let shared = instance.spec.shared.unwrap_or(false);
    let generation = instance.metadata.generation.unwrap_or_default();
    match status.conditions.get(ConditionType::Shared) {
        None => shared,
        // not retried until the resource changes
        Some(c) if c.reason == Reason::ShareNotSupported => {
            shared && c.observed_generation != generation
        }
        Some(c) if c.status == ConditionStatus::True => !shared,
        Some(_) => shared,
    }
}

fn set_shared(instance: &mut ServiceInstance, status: ConditionStatus, reason: Reason, message: &str) {
    let generation = instance.metadata.generation.unwrap_or_default();
    instance
        .status
        .get_or_insert_with(Default::default)
        .conditions
        .set(Condition::new(
            ConditionType::Shared,
            status,
            reason,
            message,
            generation,
        ));
}

/// Share or unshare the instance
///
/// # Errors
/// Never fails today; the signature matches the other workflow steps
pub async fn reconcile_sharing(
    ctx: &Reconciler,
    instance: &mut ServiceInstance,
) -> Result<Action, ReconcilerError> {
    let key = InstanceKey::from_instance(instance);
    let share = instance.spec.shared.unwrap_or(false);

    let client = match ctx.clients.client_for(instance).await {
        Ok(client) => client,
        Err(e) => return Ok(sharing_failed(ctx, instance, share, &e)),
    };
    let instance_id = instance
        .status
        .as_ref()
        .map(|s| s.instance_id.clone())
        .unwrap_or_default();

    let result = if share {
        client.share_instance(&instance_id).await
    } else {
        client.unshare_instance(&instance_id).await
    };

    match result {
        Ok(()) if share => {
            info!("🤝 Shared {}", key);
            set_shared(instance, ConditionStatus::True, Reason::ShareSucceeded, "instance shared successfully");
        }
        Ok(()) => {
            info!("🔒 Unshared {}", key);
            if instance.spec.shared.is_none() {
                if let Some(status) = instance.status.as_mut() {
                    status.conditions.remove(ConditionType::Shared);
                }
            } else {
                set_shared(
                    instance,
                    ConditionStatus::False,
                    Reason::UnShareSucceeded,
                    "instance unshared successfully",
                );
            }
        }
        Err(e) => return Ok(sharing_failed(ctx, instance, share, &e)),
    }

    ctx.reset_backoff(&key);
    Ok(Action::requeue(Duration::ZERO))
}

fn sharing_failed(ctx: &Reconciler, instance: &mut ServiceInstance, share: bool, err: &SmError) -> Action {
    let key = InstanceKey::from_instance(instance);
    let class = err.classify();
    let message = err.message();
    warn!(
        "⚠️  {} of {} failed ({}): {}",
        if share { "Sharing" } else { "Unsharing" },
        key,
        class.as_str(),
        message
    );
    metrics::increment_requeues_total("sharing");

    if class == ErrorClass::RateLimited {
        // leave the condition on the side that still needs the call
        set_shared(instance, (!share).into(), Reason::InProgress, "in progress");
        return Action::requeue(ctx.backoff_for(&key, class));
    }

    if !share {
        set_shared(instance, ConditionStatus::True, Reason::UnShareFailed, &message);
        return Action::requeue(ctx.backoff_for(&key, class));
    }

    if matches!(err.status_code(), Some(400 | 500)) {
        set_shared(instance, ConditionStatus::False, Reason::ShareNotSupported, &message);
        return Action::await_change();
    }

    set_shared(instance, ConditionStatus::False, Reason::ShareFailed, &message);
    Action::requeue(ctx.backoff_for(&key, class))
}
