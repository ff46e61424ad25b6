//! # Watch Loop
//!
//! Runs the `ServiceInstance` controller until a shutdown signal arrives:
//!
//! - a `kube_runtime::Controller` watches instances, runs at most one reconcile per
//!   object at a time and schedules the requeue each reconcile returns
//! - a secret watcher sends the dependents of changed parameter secrets to the
//!   controller through `reconcile_on`
//!
//! The secret watch stream is restarted after errors until the controller stops.

use crate::constants::WATCH_SECRET_LABEL;
use crate::controller::reconciler::{
    reconcile, Action, Reconciler, ReconcilerError, TriggerSource,
};
use crate::crd::{InstanceKey, ServiceInstance};
use crate::runtime::error_policy::{handle_reconciliation_error, handle_watch_stream_error};
use crate::runtime::secret_watch::{handle_secret_event, SecretContentCache};
use crate::server::ServerState;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
use kube_runtime::controller::{self, Controller};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

type ControllerResult =
    Result<(ObjectRef<ServiceInstance>, Action), controller::Error<ReconcilerError, watcher::Error>>;

/// Run the operator until a shutdown signal arrives
///
/// # Errors
/// Does not fail once initialization succeeded
pub async fn run_watch_loop(
    client: Client,
    reconciler: Arc<Reconciler>,
    server_state: Arc<ServerState>,
) -> Result<(), anyhow::Error> {
    let config = reconciler.config.clone();
    let instances: Api<ServiceInstance> = Api::all(client.clone());
    let (requests, secret_triggers) = mpsc::unbounded();

    let secrets = tokio::spawn(watch_secrets(
        Api::all(client),
        requests,
        Arc::clone(&reconciler),
    ));

    server_state.is_ready.store(true, Ordering::Relaxed);
    let shutdown_server_state = Arc::clone(&server_state);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal (SIGINT/SIGTERM), initiating graceful shutdown...");
        shutdown_server_state.is_ready.store(false, Ordering::Relaxed);
        info!("Marked server as not ready, waiting for in-flight reconciliations to complete...");
    });

    info!(
        "✅ Starting ServiceInstance controller ({} concurrent reconcile(s))...",
        config.controller_concurrency()
    );
    Controller::new(instances, watcher::Config::default().any_semantic())
        .with_config(controller::Config::default().concurrency(config.controller_concurrency()))
        .reconcile_on(secret_triggers)
        .shutdown_on_signal()
        .run(reconcile_resource, handle_reconciliation_error, reconciler)
        .for_each(|result| futures::future::ready(log_controller_result(result)))
        .await;

    secrets.abort();
    info!("Operator stopped gracefully");
    Ok(())
}

/// Reconcile entry point handed to the controller
async fn reconcile_resource(
    obj: Arc<ServiceInstance>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let trigger_source = TriggerSource::infer(&obj);
    reconcile(InstanceKey::from_instance(&obj), &ctx, trigger_source).await
}

fn log_controller_result(result: ControllerResult) {
    match result {
        Ok((obj, action)) => debug!("Reconciled {}: {:?}", obj, action),
        // already logged and scheduled by the error policy
        Err(controller::Error::ReconcilerFailed(e, obj)) => {
            debug!("Reconcile of {} failed: {}", obj, e);
        }
        Err(controller::Error::ObjectNotFound(obj)) => {
            debug!("{} left the cache before it was reconciled", obj);
        }
        Err(controller::Error::QueueError(e)) => {
            warn!("ServiceInstance watch error, retrying with backoff: {}", e);
        }
        Err(e) => error!("Controller error: {}", e),
    }
}

async fn watch_secrets(
    api: Api<Secret>,
    requests: UnboundedSender<ObjectRef<ServiceInstance>>,
    reconciler: Arc<Reconciler>,
) {
    let config = reconciler.config.clone();
    let backoff = AtomicU64::new(config.backoff_start_ms);
    let mut cache = SecretContentCache::new();
    let selector = format!("{WATCH_SECRET_LABEL}=true");

    while !requests.is_closed() {
        info!("Starting watched secret watch ({})...", selector);
        let mut stream = watcher(api.clone(), watcher::Config::default().labels(&selector)).boxed();
        // the error handler already waited before asking for a restart
        let mut restart_delayed = false;
        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(secret) | watcher::Event::InitApply(secret)) => {
                    backoff.store(config.backoff_start_ms, Ordering::Relaxed);
                    if let Err(e) =
                        handle_secret_event(&reconciler, &requests, &mut cache, &secret).await
                    {
                        error!("Failed to handle secret event: {}", e);
                    }
                }
                Ok(watcher::Event::Delete(secret)) => cache.forget(&secret),
                Ok(watcher::Event::Init | watcher::Event::InitDone) => {}
                Err(e) => {
                    if handle_watch_stream_error(
                        &e.to_string(),
                        &backoff,
                        config.backoff_max_ms,
                        config.watch_restart_delay_duration(),
                    )
                    .await
                    .is_none()
                    {
                        restart_delayed = true;
                        break;
                    }
                }
            }
        }
        if requests.is_closed() {
            break;
        }
        let pause = restart_pause(restart_delayed, config.watch_restart_delay_duration());
        warn!(
            "Secret watch stream ended, restarting in {}ms...",
            pause.as_millis()
        );
        tokio::time::sleep(pause).await;
    }
    debug!("Secret watcher stopped");
}

/// Pause before re-opening a watch stream
fn restart_pause(handler_waited: bool, restart_delay: Duration) -> Duration {
    if handler_waited {
        Duration::ZERO
    } else {
        restart_delay
    }
}
