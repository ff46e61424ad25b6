//! # Error Policy
//!
//! Error handling and backoff logic for the controller and the watch streams.

use crate::controller::reconciler::{Action, Reconciler, ReconcilerError};
use crate::crd::{InstanceKey, ServiceInstance};
use crate::observability;
use crate::sm::ErrorClass;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Instrument};

/// Requeue decision for a reconcile that returned an error
///
/// Conflicts mean another writer got there first; they are retried almost
/// immediately from fresh state. Everything else backs off per resource.
pub fn handle_reconciliation_error(
    obj: Arc<ServiceInstance>,
    error: &ReconcilerError,
    ctx: Arc<Reconciler>,
) -> Action {
    let key = InstanceKey::from_instance(&obj);
    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.reconciliation_error",
        resource.name = %key.name,
        resource.namespace = %key.namespace,
        error = %error
    );
    let _error_guard = error_span.enter();

    if error.is_conflict() {
        info!("🔁 Conflicting write to {}, retrying from fresh state", key);
        observability::metrics::increment_requeues_total("conflict");
        return Action::requeue(ctx.config.conflict_requeue_duration());
    }

    let delay = ctx.backoff_for(&key, ErrorClass::Transient);
    let next_trigger_time = chrono::Utc::now()
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    error!("Reconciliation error for {}: {:?}", key, error);
    info!(
        "📅 Next retry scheduled: {} (in {}ms, trigger source: error-backoff)",
        next_trigger_time.to_rfc3339(),
        delay.as_millis()
    );

    observability::metrics::increment_requeues_total("error-backoff");
    Action::requeue(delay)
}

/// Handle watch stream errors with appropriate classification and backoff
///
/// Returns `None` when the stream should be restarted, `Some(())` to keep
/// consuming it.
pub async fn handle_watch_stream_error(
    error_string: &str,
    backoff: &AtomicU64,
    max_backoff_ms: u64,
    watch_restart_delay: Duration,
) -> Option<()> {
    let error_span = tracing::span!(
        tracing::Level::WARN,
        "controller.watch.error",
        error = %error_string
    );
    classify_watch_error(error_string, backoff, max_backoff_ms, watch_restart_delay)
        .instrument(error_span)
        .await
}

async fn classify_watch_error(
    error_string: &str,
    backoff: &AtomicU64,
    max_backoff_ms: u64,
    watch_restart_delay: Duration,
) -> Option<()> {
    // 404 first: a plain-text 404 body surfaces as a decode error mentioning the watch
    let is_not_found = error_string.contains("ObjectNotFound")
        || error_string.contains("404")
        || error_string.contains("not found");
    let is_401 =
        (error_string.contains("401") || error_string.contains("Unauthorized")) && !is_not_found;
    let is_410 = error_string.contains("410")
        || error_string.contains("too old resource version")
        || error_string.contains("Expired")
        || error_string.contains("Gone");
    let is_429 = error_string.contains("429")
        || error_string.contains("storage is (re)initializing")
        || error_string.contains("TooManyRequests");

    if is_401 {
        error!(
            "❌ Watch authentication failed (401 Unauthorized) - RBAC may have been revoked or token expired"
        );
        error!("🔍 Verify the operator ServiceAccount may list and watch serviceinstances and secrets:");
        error!(
            "      kubectl auth can-i watch serviceinstances.services.cloud.sap.com --as=system:serviceaccount:<namespace>:service-instance-operator --all-namespaces"
        );
        warn!(
            "⏳ Waiting {}s before retrying watch (RBAC may need time to propagate)...",
            watch_restart_delay.as_secs()
        );
        tokio::time::sleep(watch_restart_delay).await;
        None
    } else if is_410 {
        warn!(
            "Watch resource version expired (410) - this is normal during pod restarts, watch will restart"
        );
        None
    } else if is_429 {
        let current_backoff = backoff.load(Ordering::Relaxed);
        warn!(
            "API server storage reinitializing (429), backing off for {}ms before restart...",
            current_backoff
        );
        tokio::time::sleep(Duration::from_millis(current_backoff)).await;
        backoff.store(
            current_backoff.saturating_mul(2).min(max_backoff_ms),
            Ordering::Relaxed,
        );
        None
    } else if is_not_found {
        warn!(
            "Resource not found (404) - this may be normal if a resource was deleted or the CRD is missing. Error: {}",
            error_string
        );
        Some(())
    } else {
        error!("Watch stream error: {}", error_string);
        tokio::time::sleep(watch_restart_delay).await;
        None
    }
}
