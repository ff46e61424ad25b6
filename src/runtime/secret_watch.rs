//! # Secret Watch
//!
//! Turns events on watched parameter secrets into reconcile requests for the
//! instances that depend on them. Requests are sent as object references to the
//! controller, which coalesces them with its own watch events.
//!
//! Only content changes matter: metadata churn, including the operator's own
//! annotation and finalizer writes, does not fan out.

use crate::controller::reconciler::fingerprint::sha256_hex;
use crate::controller::reconciler::secrets::{
    release_secret, secret_label_key, update_secret_with_retry,
};
use crate::controller::reconciler::{Reconciler, ReconcilerError};
use crate::crd::ServiceInstance;
use crate::observability::metrics;
use futures::channel::mpsc::UnboundedSender;
use k8s_openapi::api::core::v1::Secret;
use kube_runtime::reflector::ObjectRef;
use std::collections::HashMap;
use tracing::{debug, info};

/// Last seen content hash per secret
#[derive(Debug, Default)]
pub struct SecretContentCache {
    hashes: HashMap<String, String>,
}

impl SecretContentCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the content of a secret; returns whether it is new or changed
    pub fn observe(&mut self, secret: &Secret) -> bool {
        let hash = content_hash(secret);
        self.hashes.insert(cache_key(secret), hash.clone()) != Some(hash)
    }

    pub fn forget(&mut self, secret: &Secret) {
        self.hashes.remove(&cache_key(secret));
    }
}

fn cache_key(secret: &Secret) -> String {
    format!(
        "{}/{}",
        secret.metadata.namespace.as_deref().unwrap_or_default(),
        secret.metadata.name.as_deref().unwrap_or_default()
    )
}

/// Hash over the data of a secret, independent of metadata
#[must_use]
pub fn content_hash(secret: &Secret) -> String {
    let mut buffer = Vec::new();
    for (key, value) in secret.data.iter().flatten() {
        buffer.extend_from_slice(key.as_bytes());
        buffer.push(0);
        buffer.extend_from_slice(&value.0);
        buffer.push(0);
    }
    buffer.push(1);
    for (key, value) in secret.string_data.iter().flatten() {
        buffer.extend_from_slice(key.as_bytes());
        buffer.push(0);
        buffer.extend_from_slice(value.as_bytes());
        buffer.push(0);
    }
    sha256_hex(&buffer)
}

/// Handle an added or modified watched secret
///
/// Returns the number of instances sent to the controller.
///
/// # Errors
/// Returns an error if the store cannot be read or the secret cannot be released
pub async fn handle_secret_event(
    ctx: &Reconciler,
    requests: &UnboundedSender<ObjectRef<ServiceInstance>>,
    cache: &mut SecretContentCache,
    secret: &Secret,
) -> Result<usize, ReconcilerError> {
    let namespace = secret.metadata.namespace.clone().unwrap_or_default();
    let name = secret.metadata.name.clone().unwrap_or_default();

    if secret.metadata.deletion_timestamp.is_some() {
        info!("🗑️  Watched secret {}/{} is being deleted, releasing it", namespace, name);
        update_secret_with_retry(ctx.store.as_ref(), &namespace, &name, release_secret).await?;
        cache.forget(secret);
        return enqueue_dependents(ctx, requests, &namespace, &name).await;
    }

    if !cache.observe(secret) {
        debug!("Secret {}/{} content unchanged", namespace, name);
        return Ok(0);
    }

    enqueue_dependents(ctx, requests, &namespace, &name).await
}

async fn enqueue_dependents(
    ctx: &Reconciler,
    requests: &UnboundedSender<ObjectRef<ServiceInstance>>,
    namespace: &str,
    name: &str,
) -> Result<usize, ReconcilerError> {
    let dependents = ctx
        .store
        .list_instances_with_label(namespace, &secret_label_key(name))
        .await?;
    for instance in &dependents {
        if requests.unbounded_send(ObjectRef::from_obj(instance)).is_err() {
            debug!("Controller stopped, dropping reconcile request for {}", name);
            return Ok(0);
        }
    }
    if !dependents.is_empty() {
        info!(
            "🔑 Secret {}/{} changed, reconciling {} instance(s)",
            namespace,
            name,
            dependents.len()
        );
        metrics::increment_secret_fanout(dependents.len() as u64);
    }
    Ok(dependents.len())
}
