//! Common test utilities for integration tests
//!
//! Provides an in-memory cluster store with optimistic concurrency, a scripted
//! service manager and fixtures shared by the reconciliation and Pact tests.

#![allow(dead_code)]

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use service_instance_operator::prelude::*;
use service_instance_operator::constants::{K8S_NAME_LABEL, SUBACCOUNT_ID_LABEL};
use service_instance_operator::sm::ServiceManagerError;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static RUSTLS_INIT: Once = Once::new();

/// Initialize rustls crypto provider for tests
///
/// This must be called before any async operations that use rustls.
/// Uses a `Once` to ensure it's only called once across all tests.
pub fn init_rustls() {
    RUSTLS_INIT.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .expect("Failed to install rustls crypto provider");
    });
}

pub const NAMESPACE: &str = "default";

// ---------------------------------------------------------------------------
// In-memory cluster store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    instances: BTreeMap<InstanceKey, ServiceInstance>,
    secrets: BTreeMap<(String, String), Secret>,
    revision: u64,
    status_conflicts: usize,
    status_writes: usize,
}

impl StoreState {
    fn next_revision(&mut self) -> Option<String> {
        self.revision += 1;
        Some(self.revision.to_string())
    }
}

/// Cluster store keeping objects in memory
///
/// Behaves like the API server where the reconciler can observe it: generations
/// only move on spec changes, writes based on a stale resourceVersion conflict and
/// objects being deleted disappear once their last finalizer is gone.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

fn conflict(kind: &'static str, namespace: &str, name: &str) -> StoreError {
    StoreError::Conflict {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

fn not_found(kind: &'static str, namespace: &str, name: &str) -> StoreError {
    StoreError::NotFound {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

fn deletion_timestamp() -> Time {
    serde_json::from_value(serde_json::json!("2026-01-01T00:00:00Z"))
        .expect("valid RFC3339 timestamp")
}

fn has_finalizers(metadata: &ObjectMeta) -> bool {
    metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty())
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create an instance the way the API server would
    pub fn insert_instance(&self, mut instance: ServiceInstance) -> InstanceKey {
        let mut state = self.state.lock().unwrap();
        instance
            .metadata
            .namespace
            .get_or_insert_with(|| NAMESPACE.to_string());
        instance.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        instance.metadata.generation = Some(1);
        instance.metadata.resource_version = state.next_revision();
        let key = InstanceKey::from_instance(&instance);
        state.instances.insert(key.clone(), instance);
        key
    }

    /// User edit of the spec; bumps the generation when the spec changed
    pub fn edit_spec(&self, key: &InstanceKey, edit: impl FnOnce(&mut ServiceInstanceSpec)) {
        let mut state = self.state.lock().unwrap();
        let revision = state.next_revision();
        let instance = state.instances.get_mut(key).expect("instance exists");
        let before = instance.spec.clone();
        edit(&mut instance.spec);
        if instance.spec != before {
            instance.metadata.generation = instance.metadata.generation.map(|g| g + 1);
        }
        instance.metadata.resource_version = revision;
    }

    /// User deletion; objects holding finalizers only get a deletion timestamp
    pub fn request_deletion(&self, key: &InstanceKey) {
        let mut state = self.state.lock().unwrap();
        let revision = state.next_revision();
        let Some(instance) = state.instances.get_mut(key) else {
            return;
        };
        if has_finalizers(&instance.metadata) {
            instance.metadata.deletion_timestamp = Some(deletion_timestamp());
            instance.metadata.resource_version = revision;
        } else {
            state.instances.remove(key);
        }
    }

    #[must_use]
    pub fn instance(&self, key: &InstanceKey) -> Option<ServiceInstance> {
        self.state.lock().unwrap().instances.get(key).cloned()
    }

    #[must_use]
    pub fn status(&self, key: &InstanceKey) -> ServiceInstanceStatus {
        self.instance(key)
            .and_then(|i| i.status)
            .expect("instance has a status")
    }

    pub fn insert_secret(&self, mut secret: Secret) {
        let mut state = self.state.lock().unwrap();
        secret
            .metadata
            .namespace
            .get_or_insert_with(|| NAMESPACE.to_string());
        secret.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        secret.metadata.resource_version = state.next_revision();
        let id = (
            secret.metadata.namespace.clone().unwrap_or_default(),
            secret.metadata.name.clone().unwrap_or_default(),
        );
        state.secrets.insert(id, secret);
    }

    /// User edit of one key of a secret
    pub fn set_secret_value(&self, namespace: &str, name: &str, key: &str, value: &str) {
        let mut state = self.state.lock().unwrap();
        let revision = state.next_revision();
        let secret = state
            .secrets
            .get_mut(&(namespace.to_string(), name.to_string()))
            .expect("secret exists");
        secret
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), ByteString(value.as_bytes().to_vec()));
        secret.metadata.resource_version = revision;
    }

    pub fn request_secret_deletion(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        let revision = state.next_revision();
        let id = (namespace.to_string(), name.to_string());
        let Some(secret) = state.secrets.get_mut(&id) else {
            return;
        };
        if has_finalizers(&secret.metadata) {
            secret.metadata.deletion_timestamp = Some(deletion_timestamp());
            secret.metadata.resource_version = revision;
        } else {
            state.secrets.remove(&id);
        }
    }

    #[must_use]
    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.state
            .lock()
            .unwrap()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Make the next `count` status writes lose an optimistic-concurrency race
    pub fn fail_next_status_writes(&self, count: usize) {
        self.state.lock().unwrap().status_conflicts = count;
    }

    /// Number of accepted status writes
    #[must_use]
    pub fn status_writes(&self) -> usize {
        self.state.lock().unwrap().status_writes
    }
}

#[async_trait]
impl ClusterStore for InMemoryStore {
    async fn get_instance(&self, key: &InstanceKey) -> Result<Option<ServiceInstance>, StoreError> {
        Ok(self.instance(key))
    }

    async fn list_instances_with_label(
        &self,
        namespace: &str,
        label_key: &str,
    ) -> Result<Vec<ServiceInstance>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .instances
            .values()
            .filter(|i| i.metadata.namespace.as_deref() == Some(namespace))
            .filter(|i| {
                i.metadata
                    .labels
                    .as_ref()
                    .is_some_and(|labels| labels.contains_key(label_key))
            })
            .cloned()
            .collect())
    }

    async fn update_instance(&self, instance: &ServiceInstance) -> Result<ServiceInstance, StoreError> {
        let key = InstanceKey::from_instance(instance);
        let mut state = self.state.lock().unwrap();
        let revision = state.next_revision();
        let stored = state
            .instances
            .get_mut(&key)
            .ok_or_else(|| not_found("ServiceInstance", &key.namespace, &key.name))?;
        if stored.metadata.resource_version != instance.metadata.resource_version {
            return Err(conflict("ServiceInstance", &key.namespace, &key.name));
        }

        stored.metadata.labels.clone_from(&instance.metadata.labels);
        stored.metadata.annotations.clone_from(&instance.metadata.annotations);
        stored.metadata.finalizers.clone_from(&instance.metadata.finalizers);
        stored.metadata.resource_version = revision;
        let result = stored.clone();

        if result.metadata.deletion_timestamp.is_some() && !has_finalizers(&result.metadata) {
            state.instances.remove(&key);
        }
        Ok(result)
    }

    async fn update_instance_status(
        &self,
        instance: &ServiceInstance,
    ) -> Result<ServiceInstance, StoreError> {
        let key = InstanceKey::from_instance(instance);
        let mut state = self.state.lock().unwrap();
        if state.status_conflicts > 0 {
            state.status_conflicts -= 1;
            return Err(conflict("ServiceInstance", &key.namespace, &key.name));
        }
        let revision = state.next_revision();
        let stored = state
            .instances
            .get_mut(&key)
            .ok_or_else(|| not_found("ServiceInstance", &key.namespace, &key.name))?;
        if stored.metadata.resource_version != instance.metadata.resource_version {
            return Err(conflict("ServiceInstance", &key.namespace, &key.name));
        }

        stored.status.clone_from(&instance.status);
        stored.metadata.resource_version = revision;
        let result = stored.clone();
        state.status_writes += 1;
        Ok(result)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        Ok(self.secret(namespace, name))
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        let namespace = secret.metadata.namespace.clone().unwrap_or_default();
        let name = secret.metadata.name.clone().unwrap_or_default();
        let id = (namespace.clone(), name.clone());
        let mut state = self.state.lock().unwrap();
        let revision = state.next_revision();
        let stored = state
            .secrets
            .get_mut(&id)
            .ok_or_else(|| not_found("Secret", &namespace, &name))?;
        if stored.metadata.resource_version != secret.metadata.resource_version {
            return Err(conflict("Secret", &namespace, &name));
        }
        // the API server refuses new finalizers on an object being deleted
        if stored.metadata.deletion_timestamp.is_some() {
            let existing = stored.metadata.finalizers.clone().unwrap_or_default();
            if secret
                .metadata
                .finalizers
                .iter()
                .flatten()
                .any(|f| !existing.contains(f))
            {
                return Err(StoreError::Other(format!(
                    "Secret {namespace}/{name} is invalid: no new finalizers can be added if the object is being deleted"
                )));
            }
        }

        stored.metadata.labels.clone_from(&secret.metadata.labels);
        stored.metadata.annotations.clone_from(&secret.metadata.annotations);
        stored.metadata.finalizers.clone_from(&secret.metadata.finalizers);
        stored.metadata.resource_version = revision;
        let result = stored.clone();

        if result.metadata.deletion_timestamp.is_some() && !has_finalizers(&result.metadata) {
            state.secrets.remove(&id);
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Scripted service manager
// ---------------------------------------------------------------------------

/// A call received by the fake service manager
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Provision(ProvisionRequest),
    Update(String, UpdateRequest),
    Deprovision(String),
    GetInstance(String),
    List(ListQuery),
    Status(String),
    Share(String),
    Unshare(String),
}

impl Call {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Call::Provision(_) => "provision",
            Call::Update(..) => "update",
            Call::Deprovision(_) => "deprovision",
            Call::GetInstance(_) => "get_instance",
            Call::List(_) => "list",
            Call::Status(_) => "status",
            Call::Share(_) => "share",
            Call::Unshare(_) => "unshare",
        }
    }
}

#[derive(Default)]
struct ManagerState {
    calls: Vec<Call>,
    provision: VecDeque<Result<ProvisionResponse, SmError>>,
    update: VecDeque<Result<Option<String>, SmError>>,
    deprovision: VecDeque<Result<Option<String>, SmError>>,
    status: VecDeque<Result<Operation, SmError>>,
    share: VecDeque<Result<(), SmError>>,
    unshare: VecDeque<Result<(), SmError>>,
    /// Instances known remotely, by id
    remote: BTreeMap<String, RemoteInstance>,
    next_id: u32,
}

/// Service manager answering from scripted responses
///
/// Unscripted calls succeed synchronously. Provisioned instances are remembered so
/// recovery lookups find them by their `_k8sname` label.
#[derive(Default)]
pub struct FakeServiceManager {
    state: Mutex<ManagerState>,
}

impl FakeServiceManager {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_provision(&self, response: Result<ProvisionResponse, SmError>) {
        self.state.lock().unwrap().provision.push_back(response);
    }

    pub fn script_update(&self, response: Result<Option<String>, SmError>) {
        self.state.lock().unwrap().update.push_back(response);
    }

    pub fn script_deprovision(&self, response: Result<Option<String>, SmError>) {
        self.state.lock().unwrap().deprovision.push_back(response);
    }

    pub fn script_status(&self, response: Result<Operation, SmError>) {
        self.state.lock().unwrap().status.push_back(response);
    }

    pub fn script_share(&self, response: Result<(), SmError>) {
        self.state.lock().unwrap().share.push_back(response);
    }

    pub fn script_unshare(&self, response: Result<(), SmError>) {
        self.state.lock().unwrap().unshare.push_back(response);
    }

    /// Seed an instance that exists remotely without the cluster knowing it
    pub fn seed_remote(&self, instance: RemoteInstance) {
        self.state
            .lock()
            .unwrap()
            .remote
            .insert(instance.id.clone(), instance);
    }

    #[must_use]
    pub fn remote_count(&self) -> usize {
        self.state.lock().unwrap().remote.len()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    #[must_use]
    pub fn count(&self, kind: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.kind() == kind)
            .count()
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

/// Value of `label eq 'value'` in a label query
fn queried_label(query: &ListQuery, label: &str) -> Option<String> {
    let prefix = format!("{label} eq '");
    query.label_query.iter().find_map(|q| {
        q.strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix('\''))
            .map(str::to_string)
    })
}

#[async_trait]
impl ServiceManagerClient for FakeServiceManager {
    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionResponse, SmError> {
        self.record(Call::Provision(request.clone()));
        let mut state = self.state.lock().unwrap();
        let response = match state.provision.pop_front() {
            Some(scripted) => scripted?,
            None => {
                state.next_id += 1;
                ProvisionResponse {
                    instance_id: format!("instance-{}", state.next_id),
                    subaccount_id: "subaccount-1".to_string(),
                    location: None,
                }
            }
        };

        let mut labels = request.labels.clone();
        labels.insert(SUBACCOUNT_ID_LABEL.to_string(), vec!["subaccount-1".to_string()]);
        let in_flight = response.location.as_ref().map(|location| Operation {
            id: location.rsplit('/').next().unwrap_or_default().to_string(),
            r#type: OperationCategory::Create,
            state: OperationState::InProgress,
            resource_id: response.instance_id.clone(),
            errors: None,
        });
        state.remote.insert(
            response.instance_id.clone(),
            RemoteInstance {
                id: response.instance_id.clone(),
                name: request.name.clone(),
                ready: in_flight.is_none(),
                shared: None,
                labels,
                last_operation: in_flight,
            },
        );
        Ok(response)
    }

    async fn update_instance(
        &self,
        instance_id: &str,
        request: &UpdateRequest,
    ) -> Result<Option<String>, SmError> {
        self.record(Call::Update(instance_id.to_string(), request.clone()));
        self.state.lock().unwrap().update.pop_front().unwrap_or(Ok(None))
    }

    async fn deprovision(&self, instance_id: &str) -> Result<Option<String>, SmError> {
        self.record(Call::Deprovision(instance_id.to_string()));
        let mut state = self.state.lock().unwrap();
        let response = state.deprovision.pop_front().unwrap_or(Ok(None));
        if matches!(response, Ok(None)) {
            state.remote.remove(instance_id);
        }
        response
    }

    async fn get_instance_by_id(&self, instance_id: &str) -> Result<RemoteInstance, SmError> {
        self.record(Call::GetInstance(instance_id.to_string()));
        self.state
            .lock()
            .unwrap()
            .remote
            .get(instance_id)
            .cloned()
            .ok_or_else(|| SmError::Api(ServiceManagerError::new(404, "instance not found")))
    }

    async fn list_instances(&self, query: &ListQuery) -> Result<Vec<RemoteInstance>, SmError> {
        self.record(Call::List(query.clone()));
        let wanted = queried_label(query, K8S_NAME_LABEL);
        Ok(self
            .state
            .lock()
            .unwrap()
            .remote
            .values()
            .filter(|remote| {
                wanted.as_ref().is_none_or(|wanted| {
                    remote
                        .labels
                        .get(K8S_NAME_LABEL)
                        .is_some_and(|values| values.contains(wanted))
                })
            })
            .cloned()
            .collect())
    }

    async fn status(&self, location: &str) -> Result<Operation, SmError> {
        self.record(Call::Status(location.to_string()));
        self.state.lock().unwrap().status.pop_front().unwrap_or_else(|| {
            Err(SmError::Unexpected(format!("no scripted status for {location}")))
        })
    }

    async fn share_instance(&self, instance_id: &str) -> Result<(), SmError> {
        self.record(Call::Share(instance_id.to_string()));
        self.state.lock().unwrap().share.pop_front().unwrap_or(Ok(()))
    }

    async fn unshare_instance(&self, instance_id: &str) -> Result<(), SmError> {
        self.record(Call::Unshare(instance_id.to_string()));
        self.state.lock().unwrap().unshare.pop_front().unwrap_or(Ok(()))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[must_use]
pub fn spec() -> ServiceInstanceSpec {
    ServiceInstanceSpec {
        service_offering_name: "postgresql-db".to_string(),
        service_plan_name: "small".to_string(),
        ..Default::default()
    }
}

#[must_use]
pub fn instance(name: &str, spec: ServiceInstanceSpec) -> ServiceInstance {
    let mut instance = ServiceInstance::new(name, spec);
    instance.metadata.namespace = Some(NAMESPACE.to_string());
    instance
}

/// Spec reading its parameters from `secret`/`key`, optionally watching it
#[must_use]
pub fn spec_with_secret(secret: &str, key: &str, watch: bool) -> ServiceInstanceSpec {
    ServiceInstanceSpec {
        parameters_from: vec![ParametersFromSource {
            secret_key_ref: Some(SecretKeyReference {
                name: secret.to_string(),
                key: key.to_string(),
            }),
        }],
        watch_parameters_from_changes: Some(watch),
        ..spec()
    }
}

#[must_use]
pub fn secret(name: &str, key: &str, value: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            key.to_string(),
            ByteString(value.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

#[must_use]
pub fn operation(category: OperationCategory, state: OperationState) -> Operation {
    Operation {
        id: "op-1".to_string(),
        r#type: category,
        state,
        resource_id: String::new(),
        errors: None,
    }
}

#[must_use]
pub fn api_error(status_code: u16, description: &str) -> SmError {
    SmError::Api(ServiceManagerError::new(status_code, description))
}

#[must_use]
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        cluster_id: "test-cluster".to_string(),
        ..ControllerConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Reconciler wired to an in-memory store and a scripted service manager
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub manager: Arc<FakeServiceManager>,
    pub reconciler: Arc<Reconciler>,
}

impl Harness {
    #[must_use]
    pub fn new() -> Self {
        let store = InMemoryStore::new();
        let manager = FakeServiceManager::new();
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            Arc::new(StaticClientProvider::new(manager.clone())),
            test_config(),
        ));
        Self {
            store,
            manager,
            reconciler,
        }
    }

    pub async fn reconcile(&self, key: &InstanceKey) -> Result<Action, ReconcilerError> {
        reconcile(key.clone(), &self.reconciler, TriggerSource::Resync).await
    }

    /// Reconcile until the reconciler stops asking to continue right away
    pub async fn settle(&self, key: &InstanceKey) -> Action {
        for _ in 0..20 {
            let action = self.reconcile(key).await.expect("reconcile succeeds");
            if action != Action::requeue(Duration::ZERO) {
                return action;
            }
        }
        panic!("{key} did not settle");
    }

    /// Number of lifecycle calls (provision, update, deprovision, share, unshare)
    #[must_use]
    pub fn lifecycle_calls(&self) -> usize {
        ["provision", "update", "deprovision", "share", "unshare"]
            .iter()
            .map(|kind| self.manager.count(kind))
            .sum()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Condition of type `kind` in a status
#[must_use]
pub fn condition(status: &ServiceInstanceStatus, kind: ConditionType) -> Condition {
    status
        .conditions
        .get(kind)
        .cloned()
        .unwrap_or_else(|| panic!("condition {kind:?} is set"))
}
