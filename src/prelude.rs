//! # Prelude
//!
//! Re-exports commonly used types and traits for convenience.
//!
//! ## Usage
//!
//! ```rust
//! use service_instance_operator::prelude::*;
//! ```
//!
//! This brings into scope:
//! - All CRD types (ServiceInstance, conditions, status)
//! - The service manager contract (ServiceManagerClient, ClientProvider, SmError)
//! - The cluster store contract (ClusterStore, StoreError)
//! - Reconciler types (Reconciler, ReconcilerError, Action, etc.)
//! - Config types (ControllerConfig, ServerConfig)

// CRD types - most commonly used
pub use crate::crd::*;

// Service manager contract
pub use crate::sm::{
    ClientProvider, ErrorClass, ListQuery, Operation, OperationState, ProvisionRequest,
    ProvisionResponse, RemoteInstance, ServiceManagerClient, SmError, StaticClientProvider,
    UpdateRequest,
};

// Cluster store contract
pub use crate::store::{ClusterStore, StoreError};

// Reconciler types - core controller functionality
pub use crate::controller::reconciler::{
    is_final_state, reconcile, Action, BackoffState, Reconciler, ReconcilerError, TriggerSource,
};

// Config types
pub use crate::config::{ControllerConfig, ServerConfig};
