//! # Reconciler Types
//!
//! Core types used by the reconciler.

use crate::config::ControllerConfig;
use crate::controller::backoff::ExponentialBackoff;
use crate::crd::{ConditionType, InstanceKey, ServiceInstance};
use crate::sm::{ClientProvider, ErrorClass};
use crate::store::{ClusterStore, StoreError};
pub use kube_runtime::controller::Action;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("Reconciliation failed: {0}")]
    Other(#[from] anyhow::Error),
}

impl ReconcilerError {
    /// A write lost an optimistic-concurrency race
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, ReconcilerError::Store(e) if e.is_conflict())
    }
}

/// What most likely scheduled a reconcile
///
/// The controller runtime does not say why an object was scheduled, so the source
/// is inferred from the object it hands over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// Resource is being deleted
    Deletion,
    /// Spec generation not yet reflected in the conditions
    SpecChange,
    /// A remote operation is being tracked
    OperationPoll,
    /// Requeue, watched secret change or periodic resync
    Resync,
}

impl TriggerSource {
    #[must_use]
    pub fn infer(instance: &ServiceInstance) -> Self {
        if instance.metadata.deletion_timestamp.is_some() {
            return TriggerSource::Deletion;
        }
        let Some(status) = instance.status.as_ref() else {
            return TriggerSource::SpecChange;
        };
        if status.has_operation() {
            return TriggerSource::OperationPoll;
        }
        let generation = instance.metadata.generation.unwrap_or_default();
        let observed = status
            .conditions
            .get(ConditionType::Succeeded)
            .map(|c| c.observed_generation);
        if observed == Some(generation) {
            TriggerSource::Resync
        } else {
            TriggerSource::SpecChange
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Deletion => "deletion",
            TriggerSource::SpecChange => "spec-change",
            TriggerSource::OperationPoll => "operation-poll",
            TriggerSource::Resync => "resync",
        }
    }
}

/// Per-resource retry state
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub transient: ExponentialBackoff,
    pub rate_limited: ExponentialBackoff,
    pub error_count: u32,
}

impl BackoffState {
    #[must_use]
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            transient: ExponentialBackoff::new(
                config.backoff_start_duration(),
                config.backoff_max_duration(),
            ),
            rate_limited: ExponentialBackoff::new(
                config.rate_limit_backoff_start_duration(),
                config.rate_limit_backoff_max_duration(),
            ),
            error_count: 0,
        }
    }

    pub fn increment_error(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.transient.reset();
        self.rate_limited.reset();
        self.error_count = 0;
    }
}

/// Reconciler context shared by all workers
pub struct Reconciler {
    pub store: Arc<dyn ClusterStore>,
    pub clients: Arc<dyn ClientProvider>,
    pub config: ControllerConfig,
    /// Per-resource backoff state, keyed by "namespace/name"
    pub backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(
        store: Arc<dyn ClusterStore>,
        clients: Arc<dyn ClientProvider>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            clients,
            config,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Delay before retrying a resource whose last attempt failed with `class`
    pub fn backoff_for(&self, key: &InstanceKey, class: ErrorClass) -> Duration {
        if class == ErrorClass::NonTransient {
            return self.config.non_transient_requeue_duration();
        }
        match self.backoff_states.lock() {
            Ok(mut states) => {
                let state = states
                    .entry(key.to_string())
                    .or_insert_with(|| BackoffState::new(&self.config));
                state.increment_error();
                let delay = if class == ErrorClass::RateLimited {
                    state.rate_limited.next_backoff()
                } else {
                    state.transient.next_backoff()
                };
                debug!(
                    "Backing off {} for {}ms after {} consecutive error(s)",
                    key,
                    delay.as_millis(),
                    state.error_count
                );
                delay
            }
            Err(e) => {
                warn!("Failed to lock backoff_states: {}, using default backoff", e);
                self.config.backoff_max_duration()
            }
        }
    }

    /// Forget accumulated backoff after a successful step
    pub fn reset_backoff(&self, key: &InstanceKey) {
        if let Ok(mut states) = self.backoff_states.lock() {
            if let Some(state) = states.get_mut(&key.to_string()) {
                state.reset();
            }
        }
    }

    /// Drop all state kept for a resource that no longer exists
    pub fn forget(&self, key: &InstanceKey) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(&key.to_string());
        }
    }
}
