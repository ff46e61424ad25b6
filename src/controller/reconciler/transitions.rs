//! # Condition Transitions
//!
//! The three lifecycle transitions applied to an instance, and the mapping from
//! failed calls to conditions plus a requeue delay.

use crate::controller::reconciler::parameters::ParametersError;
use crate::controller::reconciler::types::{Action, Reconciler, ReconcilerError};
use crate::crd::{
    Condition, ConditionStatus, ConditionType, InstanceKey, OperationCategory, Reason,
    ServiceInstance,
};
use crate::observability::metrics;
use crate::sm::{ErrorClass, SmError};
use tracing::{error, warn};

#[must_use]
pub fn in_progress_reason(category: OperationCategory) -> Reason {
    match category {
        OperationCategory::Create => Reason::CreateInProgress,
        OperationCategory::Update => Reason::UpdateInProgress,
        OperationCategory::Delete => Reason::DeleteInProgress,
    }
}

#[must_use]
pub fn failed_reason(category: OperationCategory) -> Reason {
    match category {
        OperationCategory::Create => Reason::CreateFailed,
        OperationCategory::Update => Reason::UpdateFailed,
        OperationCategory::Delete => Reason::DeleteFailed,
    }
}

fn generation(instance: &ServiceInstance) -> i64 {
    instance.metadata.generation.unwrap_or_default()
}

fn ensure_not_provisioned(instance: &mut ServiceInstance) {
    let generation = generation(instance);
    let status = instance.status.get_or_insert_with(Default::default);
    if status.conditions.get(ConditionType::Ready).is_none() {
        status.conditions.set(Condition::new(
            ConditionType::Ready,
            ConditionStatus::False,
            Reason::NotProvisioned,
            "",
            generation,
        ));
    }
}

/// A remote operation is running or will be retried
pub fn set_in_progress(instance: &mut ServiceInstance, category: OperationCategory, message: &str) {
    let generation = generation(instance);
    let status = instance.status.get_or_insert_with(Default::default);
    status.conditions.set(Condition::new(
        ConditionType::Succeeded,
        ConditionStatus::False,
        in_progress_reason(category),
        message,
        generation,
    ));
    status.conditions.remove(ConditionType::Failed);
    ensure_not_provisioned(instance);
}

/// A create or update completed
pub fn set_success(instance: &mut ServiceInstance, category: OperationCategory) {
    let generation = generation(instance);
    let (reason, message) = match category {
        OperationCategory::Update => (Reason::Updated, "ServiceInstance updated successfully"),
        _ => (Reason::Created, "ServiceInstance provisioned successfully"),
    };
    let status = instance.status.get_or_insert_with(Default::default);
    status.conditions.set(Condition::new(
        ConditionType::Succeeded,
        ConditionStatus::True,
        reason,
        message,
        generation,
    ));
    status.conditions.set(Condition::new(
        ConditionType::Ready,
        ConditionStatus::True,
        Reason::Provisioned,
        "ServiceInstance provisioned successfully",
        generation,
    ));
    status.conditions.remove(ConditionType::Failed);
    status.ready = Some(ConditionStatus::True);
}

/// A remote operation ended in failure
///
/// An instance that was Ready stays Ready.
pub fn set_failure(instance: &mut ServiceInstance, category: OperationCategory, message: &str) {
    let generation = generation(instance);
    let reason = failed_reason(category);
    let status = instance.status.get_or_insert_with(Default::default);
    status.conditions.set(Condition::new(
        ConditionType::Succeeded,
        ConditionStatus::False,
        reason,
        message,
        generation,
    ));
    status.conditions.set(Condition::new(
        ConditionType::Failed,
        ConditionStatus::True,
        reason,
        message,
        generation,
    ));
    ensure_not_provisioned(instance);
}

/// Re-stamp settled conditions with the current generation
pub fn refresh_generation(instance: &mut ServiceInstance) {
    let generation = generation(instance);
    let Some(status) = instance.status.as_mut() else {
        return;
    };
    for r#type in [ConditionType::Succeeded, ConditionType::Ready] {
        if let Some(mut condition) = status.conditions.get(r#type).cloned() {
            condition.observed_generation = generation;
            status.conditions.set(condition);
        }
    }
}

/// Record a failed service manager call and pick the retry delay
pub fn handle_error(
    ctx: &Reconciler,
    instance: &mut ServiceInstance,
    category: OperationCategory,
    err: &SmError,
) -> Action {
    let key = InstanceKey::from_instance(instance);
    if let SmError::Unexpected(message) = err {
        error!(
            "❌ {} of {} failed: {}",
            category, key, message
        );
        set_failure(instance, category, message);
        metrics::increment_requeues_total(ErrorClass::NonTransient.as_str());
        return Action::requeue(ctx.config.non_transient_requeue_duration());
    }

    let class = err.classify();
    warn!(
        "⚠️  {} of {} will be retried ({}): {}",
        category,
        key,
        class.as_str(),
        err
    );
    set_in_progress(instance, category, &err.message());
    metrics::increment_requeues_total(class.as_str());
    Action::requeue(ctx.backoff_for(&key, class))
}

/// Record a parameter payload that could not be built
///
/// Missing secrets or keys keep the instance in progress until they show up; a
/// malformed payload is a failure until the spec or the secret changes.
///
/// # Errors
/// Store errors are returned unchanged
pub fn handle_parameters_error(
    ctx: &Reconciler,
    instance: &mut ServiceInstance,
    category: OperationCategory,
    err: ParametersError,
) -> Result<Action, ReconcilerError> {
    match err {
        ParametersError::Store(e) => Err(e.into()),
        e if e.is_missing_dependency() => {
            let key = InstanceKey::from_instance(instance);
            warn!("⏳ {} of {} waits for parameters: {}", category, key, e);
            set_in_progress(instance, category, &e.to_string());
            metrics::increment_requeues_total("missing_parameters");
            Ok(Action::requeue(ctx.backoff_for(&key, ErrorClass::Transient)))
        }
        e => Ok(handle_error(
            ctx,
            instance,
            category,
            &SmError::Unexpected(e.to_string()),
        )),
    }
}
