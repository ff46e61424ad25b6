//! # Parameters
//!
//! Builds the parameter payload sent to the service manager: the inline
//! `parameters` object merged with every JSON object referenced through
//! `parametersFrom`.

use crate::crd::ServiceInstance;
use crate::store::{ClusterStore, StoreError};
use k8s_openapi::api::core::v1::Secret;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParametersError {
    /// Referenced secret does not exist (yet)
    #[error("secrets \"{name}\" not found")]
    SecretNotFound { name: String },
    #[error("key \"{key}\" not found in secret \"{secret}\"")]
    KeyNotFound { secret: String, key: String },
    #[error("value of key \"{key}\" in secret \"{secret}\" is not a JSON object")]
    NotAnObject { secret: String, key: String },
    #[error("parameter \"{key}\" is defined more than once")]
    DuplicateKey { key: String },
    #[error("inline parameters must be a JSON object")]
    InlineNotAnObject,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ParametersError {
    /// The payload can be built once a missing dependency shows up
    #[must_use]
    pub fn is_missing_dependency(&self) -> bool {
        matches!(
            self,
            ParametersError::SecretNotFound { .. } | ParametersError::KeyNotFound { .. }
        )
    }
}

/// Resolve the merged parameter payload of an instance
///
/// Secrets are read from the instance namespace. An instance without any
/// parameters yields `Value::Null`.
///
/// # Errors
/// Returns an error if a referenced secret or key is missing, a value is not a JSON
/// object, the same key is defined twice, or the store cannot be read
pub async fn resolve(
    store: &dyn ClusterStore,
    instance: &ServiceInstance,
) -> Result<Value, ParametersError> {
    let namespace = instance.metadata.namespace.clone().unwrap_or_default();
    let mut sources = Vec::new();

    for reference in instance
        .spec
        .parameters_from
        .iter()
        .filter_map(|source| source.secret_key_ref.as_ref())
    {
        // a secret on its way out counts as gone
        let secret = store
            .get_secret(&namespace, &reference.name)
            .await?
            .filter(|secret| secret.metadata.deletion_timestamp.is_none())
            .ok_or_else(|| ParametersError::SecretNotFound {
                name: reference.name.clone(),
            })?;
        sources.push(secret_object(&secret, &reference.name, &reference.key)?);
    }

    merge(instance.spec.parameters.as_ref(), sources)
}

/// JSON object stored under `key` of a secret
fn secret_object(
    secret: &Secret,
    secret_name: &str,
    key: &str,
) -> Result<Map<String, Value>, ParametersError> {
    let raw = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|bytes| bytes.0.clone())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|s| s.clone().into_bytes())
        })
        .ok_or_else(|| ParametersError::KeyNotFound {
            secret: secret_name.to_string(),
            key: key.to_string(),
        })?;

    match serde_json::from_slice::<Value>(&raw) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(ParametersError::NotAnObject {
            secret: secret_name.to_string(),
            key: key.to_string(),
        }),
    }
}

/// Merge the inline parameters with secret-sourced objects
///
/// # Errors
/// Returns an error if a key appears in more than one source
pub fn merge(
    inline: Option<&Value>,
    sources: Vec<Map<String, Value>>,
) -> Result<Value, ParametersError> {
    let mut merged = match inline {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err(ParametersError::InlineNotAnObject),
    };
    let had_inline = inline.is_some_and(|v| !v.is_null());

    if sources.is_empty() && !had_inline {
        return Ok(Value::Null);
    }

    for source in sources {
        for (key, value) in source {
            if merged.contains_key(&key) {
                return Err(ParametersError::DuplicateKey { key });
            }
            merged.insert(key, value);
        }
    }

    Ok(Value::Object(merged))
}
