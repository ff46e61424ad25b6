//! # Constants
//!
//! Shared constants used throughout the operator.
//!
//! Durations are defaults; `ControllerConfig::from_env` can override them.

/// API group of the `ServiceInstance` CRD
pub const API_GROUP: &str = "services.cloud.sap.com";

/// Finalizer placed on instances and on watched parameter secrets
pub const FINALIZER_NAME: &str = "services.cloud.sap.com/sap-btp-finalizer";

/// Prefix of the instance label pointing at a watched secret
pub const SECRET_LABEL_PREFIX: &str = "services.cloud.sap.com/secret-";

/// Prefix of the secret annotation recording one watching instance UID
pub const WATCH_SECRET_ANNOTATION_PREFIX: &str = "services.cloud.sap.com/watchSecret-";

/// Label marking a secret as watched so the secret watcher can select it
pub const WATCH_SECRET_LABEL: &str = "services.cloud.sap.com/watchSecret";

/// Remote label carrying the derived, cluster-unique resource name
pub const K8S_NAME_LABEL: &str = "_k8sname";

/// Remote label carrying the cluster identifier
pub const CLUSTER_ID_LABEL: &str = "_clusterid";

/// Remote label carrying the resource namespace
pub const NAMESPACE_LABEL: &str = "_namespace";

/// Remote instance label holding the subaccount id
pub const SUBACCOUNT_ID_LABEL: &str = "subaccount_id";

/// Kubernetes limit for label names and values
pub const MAX_LABEL_LENGTH: usize = 63;

/// Default HTTP server port for metrics and health checks
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Default interval between polls of an in-flight remote operation (seconds)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Default exponential backoff starting value for transient errors (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 1000;

/// Default exponential backoff maximum value for transient errors (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 300_000;

/// Default backoff starting value after a rate limit (milliseconds)
pub const DEFAULT_RATE_LIMIT_BACKOFF_START_MS: u64 = 10_000;

/// Default backoff maximum value after a rate limit (milliseconds)
pub const DEFAULT_RATE_LIMIT_BACKOFF_MAX_MS: u64 = 600_000;

/// Default steady requeue interval after a non-transient rejection (seconds)
pub const DEFAULT_NON_TRANSIENT_REQUEUE_SECS: u64 = 300;

/// Default requeue delay after an optimistic-concurrency conflict (milliseconds)
pub const DEFAULT_CONFLICT_REQUEUE_MS: u64 = 100;

/// Default number of reconciles the controller runs at once
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: usize = 4;

/// Default delay before restarting a watch stream after an error (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Attempts made on a secret read-modify-write before giving up on a conflict
pub const SECRET_UPDATE_ATTEMPTS: usize = 5;
