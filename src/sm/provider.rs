//! Credentials-backed client provider
//!
//! Builds one [`ServiceManagerRest`] per access-credentials secret. An instance
//! naming `btpAccessCredentialsSecret` uses that secret from its own namespace;
//! every other instance uses the operator's default secret from the management
//! namespace. Clients are rebuilt when the secret's resourceVersion changes.

use crate::config::ControllerConfig;
use crate::crd::ServiceInstance;
use crate::sm::rest::{Credentials, ServiceManagerRest};
use crate::sm::{ClientProvider, ServiceManagerClient, SmError};
use crate::store::ClusterStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

const CLIENT_ID_KEY: &str = "clientid";
const CLIENT_SECRET_KEY: &str = "clientsecret";
const SM_URL_KEY: &str = "sm_url";
const TOKEN_URL_KEY: &str = "tokenurl";

pub struct CredentialsClientProvider {
    store: Arc<dyn ClusterStore>,
    config: ControllerConfig,
    cache: Mutex<HashMap<String, (String, Arc<ServiceManagerRest>)>>,
}

impl std::fmt::Debug for CredentialsClientProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsClientProvider")
            .field("management_namespace", &self.config.management_namespace)
            .finish_non_exhaustive()
    }
}

impl CredentialsClientProvider {
    #[must_use]
    pub fn new(store: Arc<dyn ClusterStore>, config: ControllerConfig) -> Self {
        Self {
            store,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn secret_location(&self, instance: &ServiceInstance) -> (String, String) {
        let name = &instance.spec.btp_access_credentials_secret;
        match name.is_empty() {
            false => (
                instance.metadata.namespace.clone().unwrap_or_default(),
                name.clone(),
            ),
            true => (
                self.config.management_namespace.clone(),
                self.config.credentials_secret_name.clone(),
            ),
        }
    }
}

/// Extract access credentials from a secret's data
///
/// # Errors
/// Returns an error naming the first missing key
pub fn credentials_from_secret(secret: &Secret) -> Result<Credentials, SmError> {
    let name = secret.metadata.name.clone().unwrap_or_default();
    let value = |key: &str| -> Result<String, SmError> {
        let from_data = secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned());
        let from_string_data = || {
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(key))
                .cloned()
        };
        from_data
            .or_else(from_string_data)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                SmError::Transport(format!("key {key} not found in credentials secret {name}"))
            })
    };

    Ok(Credentials {
        client_id: value(CLIENT_ID_KEY)?,
        client_secret: value(CLIENT_SECRET_KEY)?,
        sm_url: value(SM_URL_KEY)?,
        token_url: value(TOKEN_URL_KEY)?,
    })
}

#[async_trait]
impl ClientProvider for CredentialsClientProvider {
    async fn client_for(
        &self,
        instance: &ServiceInstance,
    ) -> Result<Arc<dyn ServiceManagerClient>, SmError> {
        let (namespace, name) = self.secret_location(instance);
        let secret = self
            .store
            .get_secret(&namespace, &name)
            .await
            .map_err(|e| SmError::Transport(format!("failed to read credentials secret: {e}")))?
            .ok_or_else(|| {
                SmError::Transport(format!(
                    "credentials secret {namespace}/{name} not found"
                ))
            })?;

        let cache_key = format!("{namespace}/{name}");
        let version = secret.metadata.resource_version.clone().unwrap_or_default();

        let mut cache = self.cache.lock().await;
        if let Some((cached_version, client)) = cache.get(&cache_key) {
            if *cached_version == version {
                return Ok(Arc::clone(client) as Arc<dyn ServiceManagerClient>);
            }
        }

        debug!("Building service manager client from {}", cache_key);
        let client = Arc::new(ServiceManagerRest::new(credentials_from_secret(&secret)?)?);
        cache.insert(cache_key, (version, Arc::clone(&client)));
        Ok(client)
    }
}
