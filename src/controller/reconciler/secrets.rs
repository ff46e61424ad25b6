//! # Secret Watch Edges
//!
//! Bookkeeping of the relation between instances and the parameter secrets they
//! watch.
//!
//! An edge is stored on both ends:
//! - the instance carries `services.cloud.sap.com/secret-<secret>` with the secret
//!   name as value, so a changed secret can find its watchers with a label lookup.
//!   Names too long for a label are hashed; an annotation under the same key keeps
//!   the real name so the edge can still be removed
//! - the secret carries one `services.cloud.sap.com/watchSecret-<uid>` annotation per
//!   watching instance, the `services.cloud.sap.com/watchSecret` label and the
//!   finalizer
//!
//! The finalizer is present exactly while at least one annotation is. Secrets are
//! shared between instances, so every secret write is a read-modify-write retried on
//! conflict.

use crate::constants::{
    FINALIZER_NAME, MAX_LABEL_LENGTH, SECRET_LABEL_PREFIX, SECRET_UPDATE_ATTEMPTS,
    WATCH_SECRET_ANNOTATION_PREFIX, WATCH_SECRET_LABEL,
};
use crate::controller::reconciler::fingerprint::sha256_hex;
use crate::controller::reconciler::types::{Reconciler, ReconcilerError};
use crate::crd::ServiceInstance;
use crate::store::{ClusterStore, StoreError};
use k8s_openapi::api::core::v1::Secret;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Instance label key pointing at secret `secret_name`
#[must_use]
pub fn secret_label_key(secret_name: &str) -> String {
    // the name part of a qualified label key is limited like any label
    let name_part = format!("secret-{secret_name}");
    if name_part.len() > MAX_LABEL_LENGTH {
        format!(
            "{SECRET_LABEL_PREFIX}{}",
            &sha256_hex(secret_name.as_bytes())[..MAX_LABEL_LENGTH - "secret-".len()]
        )
    } else {
        format!("{SECRET_LABEL_PREFIX}{secret_name}")
    }
}

fn secret_label_value(secret_name: &str) -> String {
    if secret_name.len() > MAX_LABEL_LENGTH {
        sha256_hex(secret_name.as_bytes())[..MAX_LABEL_LENGTH].to_string()
    } else {
        secret_name.to_string()
    }
}

/// Secret annotation key recording instance `uid` as a watcher
#[must_use]
pub fn watch_annotation_key(uid: &str) -> String {
    format!("{WATCH_SECRET_ANNOTATION_PREFIX}{uid}")
}

fn secret_entries(map: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    map.into_iter()
        .flatten()
        .filter(|(key, _)| key.starts_with(SECRET_LABEL_PREFIX))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Secrets this instance currently points at, keyed by label key
///
/// The name comes from the annotation when there is one, since the label value
/// of a long name is only its hash.
fn labelled_secrets(instance: &ServiceInstance) -> BTreeMap<String, String> {
    let names = secret_entries(instance.metadata.annotations.as_ref());
    secret_entries(instance.metadata.labels.as_ref())
        .into_iter()
        .map(|(key, value)| {
            let name = names.get(&key).cloned().unwrap_or(value);
            (key, name)
        })
        .collect()
}

fn watched_secrets(instance: &ServiceInstance) -> Vec<String> {
    if instance.spec.watches_parameters() {
        instance.spec.referenced_secrets()
    } else {
        Vec::new()
    }
}

/// Bring the watch edges of an instance in line with its spec
///
/// Adds edges for every referenced secret while watching is enabled and removes
/// edges to secrets that are no longer referenced or watched. Missing secrets are
/// skipped; the edge is added once they exist.
///
/// # Errors
/// Returns an error if the store rejects a write
pub async fn sync_watch_edges(
    ctx: &Reconciler,
    instance: &mut ServiceInstance,
) -> Result<(), ReconcilerError> {
    let namespace = instance.metadata.namespace.clone().unwrap_or_default();
    let uid = instance.metadata.uid.clone().unwrap_or_default();
    let desired = watched_secrets(instance);
    let desired_labels: BTreeMap<String, String> = desired
        .iter()
        .map(|name| (secret_label_key(name), secret_label_value(name)))
        .collect();
    let desired_names: BTreeMap<String, String> = desired
        .iter()
        .map(|name| (secret_label_key(name), name.clone()))
        .collect();

    for name in &desired {
        add_watcher(ctx.store.as_ref(), &namespace, name, &uid).await?;
    }

    for (key, name) in &labelled_secrets(instance) {
        if !desired_names.contains_key(key) {
            remove_watcher(ctx.store.as_ref(), &namespace, name, &uid).await?;
        }
    }

    if secret_entries(instance.metadata.labels.as_ref()) == desired_labels
        && secret_entries(instance.metadata.annotations.as_ref()) == desired_names
    {
        return Ok(());
    }

    let mut updated = instance.clone();
    let labels = updated.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.retain(|key, _| !key.starts_with(SECRET_LABEL_PREFIX));
    labels.extend(desired_labels);
    let annotations = updated.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.retain(|key, _| !key.starts_with(SECRET_LABEL_PREFIX));
    annotations.extend(desired_names);
    let stored = ctx.store.update_instance(&updated).await?;
    instance.metadata = stored.metadata;
    debug!(
        "Updated secret labels of {}/{}",
        namespace,
        instance.metadata.name.as_deref().unwrap_or_default()
    );
    Ok(())
}

/// Drop every edge of an instance that is going away
///
/// # Errors
/// Returns an error if the store rejects a write
pub async fn remove_all_watch_edges(
    ctx: &Reconciler,
    instance: &ServiceInstance,
) -> Result<(), ReconcilerError> {
    let namespace = instance.metadata.namespace.clone().unwrap_or_default();
    let uid = instance.metadata.uid.clone().unwrap_or_default();

    let names: BTreeSet<String> = labelled_secrets(instance)
        .into_values()
        .chain(instance.spec.referenced_secrets())
        .collect();
    for name in names {
        remove_watcher(ctx.store.as_ref(), &namespace, &name, &uid).await?;
    }
    Ok(())
}

/// Register `uid` as a watcher of a secret; returns whether the secret changed
///
/// A secret being deleted gets no new watchers: the API server refuses new
/// finalizers on it and it was released when its deletion was seen.
fn mark_watched(secret: &mut Secret, uid: &str) -> bool {
    if secret.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let mut changed = false;

    let annotations = secret.metadata.annotations.get_or_insert_with(BTreeMap::new);
    if annotations
        .insert(watch_annotation_key(uid), "true".to_string())
        .as_deref()
        != Some("true")
    {
        changed = true;
    }

    let labels = secret.metadata.labels.get_or_insert_with(BTreeMap::new);
    if labels
        .insert(WATCH_SECRET_LABEL.to_string(), "true".to_string())
        .as_deref()
        != Some("true")
    {
        changed = true;
    }

    let finalizers = secret.metadata.finalizers.get_or_insert_with(Vec::new);
    if !finalizers.iter().any(|f| f == FINALIZER_NAME) {
        finalizers.push(FINALIZER_NAME.to_string());
        changed = true;
    }

    changed
}

/// Unregister `uid`; the finalizer and label go with the last watcher
fn unmark_watched(secret: &mut Secret, uid: &str) -> bool {
    let mut changed = false;
    let key = watch_annotation_key(uid);

    if let Some(annotations) = secret.metadata.annotations.as_mut() {
        changed |= annotations.remove(&key).is_some();
    }

    let has_watchers = secret
        .metadata
        .annotations
        .iter()
        .flatten()
        .any(|(k, _)| k.starts_with(WATCH_SECRET_ANNOTATION_PREFIX));
    if !has_watchers {
        changed |= strip_watch_metadata(secret);
    }

    changed
}

fn strip_watch_metadata(secret: &mut Secret) -> bool {
    let mut changed = false;
    if let Some(finalizers) = secret.metadata.finalizers.as_mut() {
        let before = finalizers.len();
        finalizers.retain(|f| f != FINALIZER_NAME);
        changed |= finalizers.len() != before;
    }
    if let Some(labels) = secret.metadata.labels.as_mut() {
        changed |= labels.remove(WATCH_SECRET_LABEL).is_some();
    }
    changed
}

/// Remove every watch marker from a secret so its deletion can complete
///
/// Returns whether the secret changed.
pub fn release_secret(secret: &mut Secret) -> bool {
    let mut changed = false;
    if let Some(annotations) = secret.metadata.annotations.as_mut() {
        let before = annotations.len();
        annotations.retain(|k, _| !k.starts_with(WATCH_SECRET_ANNOTATION_PREFIX));
        changed |= annotations.len() != before;
    }
    changed | strip_watch_metadata(secret)
}

/// Apply `mutate` to a secret and write it, re-reading after conflicts
///
/// # Errors
/// Returns the last conflict after all attempts, or any other store error
pub async fn update_secret_with_retry<F>(
    store: &dyn ClusterStore,
    namespace: &str,
    name: &str,
    mutate: F,
) -> Result<(), StoreError>
where
    F: Fn(&mut Secret) -> bool + Send + Sync,
{
    let mut last_error = None;
    for attempt in 1..=SECRET_UPDATE_ATTEMPTS {
        let Some(mut secret) = store.get_secret(namespace, name).await? else {
            return Ok(());
        };
        if !mutate(&mut secret) {
            return Ok(());
        }
        match store.update_secret(&secret).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_conflict() => {
                debug!(
                    "Conflict updating secret {}/{} (attempt {}/{})",
                    namespace, name, attempt, SECRET_UPDATE_ATTEMPTS
                );
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error.unwrap_or_else(|| StoreError::Conflict {
        kind: "Secret",
        namespace: namespace.to_string(),
        name: name.to_string(),
    }))
}

async fn add_watcher(
    store: &dyn ClusterStore,
    namespace: &str,
    name: &str,
    uid: &str,
) -> Result<(), StoreError> {
    update_secret_with_retry(store, namespace, name, |secret| mark_watched(secret, uid)).await
}

async fn remove_watcher(
    store: &dyn ClusterStore,
    namespace: &str,
    name: &str,
    uid: &str,
) -> Result<(), StoreError> {
    update_secret_with_retry(store, namespace, name, |secret| {
        let changed = unmark_watched(secret, uid);
        if changed {
            info!("🔓 Instance {} stopped watching secret {}/{}", uid, namespace, name);
        }
        changed
    })
    .await
}
