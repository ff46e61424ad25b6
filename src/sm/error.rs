//! # Service Manager Errors
//!
//! Failure model of service manager calls and its classification into retry classes.
//!
//! The service manager proxies to third-party brokers. A 502 from the manager may
//! wrap a broker timeout or a broker-side validation failure, so when a broker
//! status is embedded it decides the class.

use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Retry class of a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network errors and 5xx; retried with bounded exponential backoff
    Transient,
    /// HTTP 429 from the manager or a broker; retried with a longer backoff
    RateLimited,
    /// Definitive rejection; surfaced on the resource and retried at a steady interval
    NonTransient,
}

impl ErrorClass {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::NonTransient => "non_transient",
        }
    }
}

/// Failure reported by a downstream broker
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BrokerError {
    pub status_code: u16,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub description: String,
}

/// Error response of the service manager API
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceManagerError {
    pub status_code: u16,
    pub error: String,
    pub description: String,
    pub broker_error: Option<BrokerError>,
}

impl ServiceManagerError {
    #[must_use]
    pub fn new(status_code: u16, description: impl Into<String>) -> Self {
        Self {
            status_code,
            description: description.into(),
            ..Self::default()
        }
    }

    /// Manager error wrapping a broker failure
    #[must_use]
    pub fn from_broker(status_code: u16, broker_status: u16, broker_description: impl Into<String>) -> Self {
        Self {
            status_code,
            description: format!("service broker responded with status {broker_status}"),
            broker_error: Some(BrokerError {
                status_code: broker_status,
                error: String::new(),
                description: broker_description.into(),
            }),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn classify(&self) -> ErrorClass {
        let code = self
            .broker_error
            .as_ref()
            .map_or(self.status_code, |broker| broker.status_code);
        match code {
            429 => ErrorClass::RateLimited,
            500..=599 => ErrorClass::Transient,
            _ => ErrorClass::NonTransient,
        }
    }

    /// Message for the user: broker description first, then the manager's own
    #[must_use]
    pub fn message(&self) -> String {
        if let Some(broker) = &self.broker_error {
            if !broker.description.is_empty() {
                return broker.description.clone();
            }
            if !broker.error.is_empty() {
                return broker.error.clone();
            }
        }
        if !self.description.is_empty() {
            return self.description.clone();
        }
        if !self.error.is_empty() {
            return self.error.clone();
        }
        format!("service manager request failed with status {}", self.status_code)
    }
}

impl fmt::Display for ServiceManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {}: {}", self.status_code, self.message())
    }
}

#[derive(Debug, Clone, Error)]
pub enum SmError {
    #[error("service manager error: {0}")]
    Api(ServiceManagerError),
    #[error("service manager unreachable: {0}")]
    Transport(String),
    #[error("{0}")]
    Unexpected(String),
}

impl SmError {
    #[must_use]
    pub fn classify(&self) -> ErrorClass {
        match self {
            SmError::Api(e) => e.classify(),
            SmError::Transport(_) => ErrorClass::Transient,
            SmError::Unexpected(_) => ErrorClass::NonTransient,
        }
    }

    /// Text placed into condition messages
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            SmError::Api(e) => e.message(),
            SmError::Transport(msg) | SmError::Unexpected(msg) => msg.clone(),
        }
    }

    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            SmError::Api(e) => Some(e.status_code),
            _ => None,
        }
    }

    /// The addressed instance or operation does not exist (any more)
    #[must_use]
    pub fn is_gone(&self) -> bool {
        matches!(self.status_code(), Some(404 | 410))
    }
}

impl From<ServiceManagerError> for SmError {
    fn from(e: ServiceManagerError) -> Self {
        SmError::Api(e)
    }
}

impl From<reqwest::Error> for SmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() || e.is_builder() {
            SmError::Unexpected(e.to_string())
        } else {
            SmError::Transport(e.to_string())
        }
    }
}
