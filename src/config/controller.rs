//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use std::time::Duration;

/// Controller-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Identifier of this cluster, attached to every remote instance
    pub cluster_id: String,
    /// Namespace holding the default service manager credentials
    pub management_namespace: String,
    /// Name of the default service manager credentials secret
    pub credentials_secret_name: String,
    /// Interval between polls of an in-flight remote operation (seconds)
    pub poll_interval_secs: u64,
    /// Exponential backoff starting value for transient errors (milliseconds)
    pub backoff_start_ms: u64,
    /// Exponential backoff maximum value for transient errors (milliseconds)
    pub backoff_max_ms: u64,
    /// Backoff starting value after a rate limit (milliseconds)
    pub rate_limit_backoff_start_ms: u64,
    /// Backoff maximum value after a rate limit (milliseconds)
    pub rate_limit_backoff_max_ms: u64,
    /// Steady requeue interval after a non-transient rejection (seconds)
    pub non_transient_requeue_secs: u64,
    /// Requeue delay after an optimistic-concurrency conflict (milliseconds)
    pub conflict_requeue_ms: u64,
    /// Reconciles the controller runs at once; one object is never reconciled twice concurrently
    pub max_concurrent_reconciles: usize,
    /// Watch stream restart delay after errors (seconds)
    pub watch_restart_delay_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            cluster_id: "default-cluster".to_string(),
            management_namespace: "sap-btp-operator".to_string(),
            credentials_secret_name: "sap-btp-service-operator".to_string(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            rate_limit_backoff_start_ms: DEFAULT_RATE_LIMIT_BACKOFF_START_MS,
            rate_limit_backoff_max_ms: DEFAULT_RATE_LIMIT_BACKOFF_MAX_MS,
            non_transient_requeue_secs: DEFAULT_NON_TRANSIENT_REQUEUE_SECS,
            conflict_requeue_ms: DEFAULT_CONFLICT_REQUEUE_MS,
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    #[must_use]
    pub fn from_env() -> Self {
        use crate::constants::*;
        Self {
            cluster_id: env_var_or_default_str("CLUSTER_ID", "default-cluster"),
            management_namespace: env_var_or_default_str("MANAGEMENT_NAMESPACE", "sap-btp-operator"),
            credentials_secret_name: env_var_or_default_str(
                "SM_CREDENTIALS_SECRET",
                "sap-btp-service-operator",
            ),
            poll_interval_secs: env_var_or_default("POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS),
            backoff_start_ms: env_var_or_default("BACKOFF_START_MS", DEFAULT_BACKOFF_START_MS),
            backoff_max_ms: env_var_or_default("BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
            rate_limit_backoff_start_ms: env_var_or_default(
                "RATE_LIMIT_BACKOFF_START_MS",
                DEFAULT_RATE_LIMIT_BACKOFF_START_MS,
            ),
            rate_limit_backoff_max_ms: env_var_or_default(
                "RATE_LIMIT_BACKOFF_MAX_MS",
                DEFAULT_RATE_LIMIT_BACKOFF_MAX_MS,
            ),
            non_transient_requeue_secs: env_var_or_default(
                "NON_TRANSIENT_REQUEUE_SECS",
                DEFAULT_NON_TRANSIENT_REQUEUE_SECS,
            ),
            conflict_requeue_ms: env_var_or_default("CONFLICT_REQUEUE_MS", DEFAULT_CONFLICT_REQUEUE_MS),
            max_concurrent_reconciles: env_var_or_default(
                "MAX_CONCURRENT_RECONCILES",
                DEFAULT_MAX_CONCURRENT_RECONCILES,
            )
            .max(1),
            watch_restart_delay_secs: env_var_or_default(
                "WATCH_RESTART_DELAY_SECS",
                DEFAULT_WATCH_RESTART_DELAY_SECS,
            ),
        }
    }

    /// Get operation poll interval
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Get backoff start duration
    #[must_use]
    pub fn backoff_start_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_start_ms)
    }

    /// Get backoff max duration
    #[must_use]
    pub fn backoff_max_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    #[must_use]
    pub fn rate_limit_backoff_start_duration(&self) -> Duration {
        Duration::from_millis(self.rate_limit_backoff_start_ms)
    }

    #[must_use]
    pub fn rate_limit_backoff_max_duration(&self) -> Duration {
        Duration::from_millis(self.rate_limit_backoff_max_ms)
    }

    /// Get steady requeue interval for non-transient failures
    #[must_use]
    pub fn non_transient_requeue_duration(&self) -> Duration {
        Duration::from_secs(self.non_transient_requeue_secs)
    }

    #[must_use]
    pub fn conflict_requeue_duration(&self) -> Duration {
        Duration::from_millis(self.conflict_requeue_ms)
    }

    /// Concurrency limit handed to the controller runtime
    #[must_use]
    pub fn controller_concurrency(&self) -> u16 {
        u16::try_from(self.max_concurrent_reconciles.max(1)).unwrap_or(u16::MAX)
    }

    /// Get watch restart delay duration
    #[must_use]
    pub fn watch_restart_delay_duration(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_secs)
    }
}

/// Read environment variable or return default value
pub(crate) fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as string or return default
pub(crate) fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
