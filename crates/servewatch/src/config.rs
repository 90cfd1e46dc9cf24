//! Monitor configuration.

use crate::record::PodRef;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_URL: &str = "http://localhost/applicationstate";
pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("The service name or labels must be supplied")]
    MissingService,
    #[error("The pod name must be supplied")]
    MissingPod,
}

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Namespace of both the pod and the monitored services.
    pub namespace: String,
    /// Name of the local pod.
    pub pod_name: String,
    pub service_name: Option<String>,
    /// Comma-delimited `k=v` label selector for services.
    pub service_labels: Option<String>,
    /// Receives a POST on every settled state change.
    pub url: String,
    pub disable_notifier: bool,
    /// Debounce window applied to membership changes.
    pub debounce: Duration,
    pub reconnection: ReconnectionConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            pod_name: String::new(),
            service_name: None,
            service_labels: None,
            url: DEFAULT_URL.to_string(),
            disable_notifier: false,
            debounce: DEFAULT_DEBOUNCE,
            reconnection: ReconnectionConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Normalise empty values and check required settings.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        self.service_name = self.service_name.filter(|s| !s.is_empty());
        self.service_labels = self.service_labels.filter(|s| !s.is_empty());
        if self.service_name.is_none() && self.service_labels.is_none() {
            return Err(ConfigError::MissingService);
        }
        if self.pod_name.is_empty() {
            return Err(ConfigError::MissingPod);
        }
        if self.url.is_empty() {
            self.url = DEFAULT_URL.to_string();
        }
        Ok(self)
    }

    pub fn pod(&self) -> PodRef {
        PodRef::new(self.namespace.as_str(), self.pod_name.as_str())
    }
}

/// Backoff between subscriptions that fail before delivering any event.
#[derive(Debug, Clone)]
pub struct ReconnectionConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}
