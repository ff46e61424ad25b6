//! # Service Manager
//!
//! Contract of the remote service manager as consumed by the reconciler, plus the
//! REST implementation used in production.
//!
//! The reconciler only depends on [`ServiceManagerClient`]; tests inject their own
//! implementation through a [`ClientProvider`].

use crate::crd::ServiceInstance;
use async_trait::async_trait;
use std::sync::Arc;

pub mod error;
pub mod provider;
pub mod rest;
pub mod types;

pub use error::{BrokerError, ErrorClass, ServiceManagerError, SmError};
pub use types::{
    ListQuery, Operation, OperationState, ProvisionRequest, ProvisionResponse, RemoteInstance,
    UpdateRequest,
};

/// Operations of the service manager used by the reconciler
///
/// Calls that can complete asynchronously return the operation location when the
/// manager accepted the request without finishing it.
#[async_trait]
pub trait ServiceManagerClient: Send + Sync {
    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionResponse, SmError>;

    async fn update_instance(
        &self,
        instance_id: &str,
        request: &UpdateRequest,
    ) -> Result<Option<String>, SmError>;

    async fn deprovision(&self, instance_id: &str) -> Result<Option<String>, SmError>;

    async fn get_instance_by_id(&self, instance_id: &str) -> Result<RemoteInstance, SmError>;

    async fn list_instances(&self, query: &ListQuery) -> Result<Vec<RemoteInstance>, SmError>;

    /// Current state of the operation at `location`
    async fn status(&self, location: &str) -> Result<Operation, SmError>;

    async fn share_instance(&self, instance_id: &str) -> Result<(), SmError>;

    async fn unshare_instance(&self, instance_id: &str) -> Result<(), SmError>;
}

/// Resolves the client to use for a given instance
///
/// Instances may carry their own access credentials, so clients are not global.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    async fn client_for(
        &self,
        instance: &ServiceInstance,
    ) -> Result<Arc<dyn ServiceManagerClient>, SmError>;
}

/// Provider returning the same client for every instance
#[derive(Clone)]
pub struct StaticClientProvider {
    client: Arc<dyn ServiceManagerClient>,
}

impl StaticClientProvider {
    #[must_use]
    pub fn new(client: Arc<dyn ServiceManagerClient>) -> Self {
        Self { client }
    }
}

impl std::fmt::Debug for StaticClientProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticClientProvider").finish_non_exhaustive()
    }
}

#[async_trait]
impl ClientProvider for StaticClientProvider {
    async fn client_for(
        &self,
        _instance: &ServiceInstance,
    ) -> Result<Arc<dyn ServiceManagerClient>, SmError> {
        Ok(Arc::clone(&self.client))
    }
}
