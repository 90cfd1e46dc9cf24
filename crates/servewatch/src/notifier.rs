//! Notifier: publishes the settled state and POSTs it to the application.
//!
//! Delivery is best-effort. Any HTTP response, whatever its status, ends the retry loop;
//! only transport failures are retried.

use crate::monitor::MonitorState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

pub const CONTENT_TYPE: &str = "application/json; charset=utf-8";
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Active,
    Inactive,
}

/// Body of the state-change POST and of `GET /deploymentstate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub status: Status,
    pub active_services: Vec<String>,
}

impl Default for NotificationPayload {
    fn default() -> Self {
        Self {
            status: Status::Inactive,
            active_services: Vec::new(),
        }
    }
}

impl From<&MonitorState> for NotificationPayload {
    fn from(state: &MonitorState) -> Self {
        Self {
            status: if state.is_active {
                Status::Active
            } else {
                Status::Inactive
            },
            active_services: state
                .active_services
                .iter()
                .map(|s| s.name.clone())
                .collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("notification failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: BoxError,
    },
    #[error("invalid notifier configuration: {0}")]
    Config(String),
}

/// Outbound POST. Returns the response status; `Err` only when no response was obtained.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_json(&self, url: &str, body: Vec<u8>) -> Result<u16, BoxError>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_json(&self, url: &str, body: Vec<u8>) -> Result<u16, BoxError> {
        let resp = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(body)
            .send()
            .await?;
        Ok(resp.status().as_u16())
    }
}

/// Builder for the notifier.
pub struct NotifierBuilder {
    transport: Option<Box<dyn Transport>>,
    retry_attempts: u32,
    retry_interval: Duration,
}

impl NotifierBuilder {
    pub fn new() -> Self {
        Self {
            transport: None,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Replace the default reqwest transport.
    pub fn transport(mut self, t: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(t));
        self
    }

    pub fn retry_attempts(mut self, n: u32) -> Self {
        self.retry_attempts = n;
        self
    }

    pub fn retry_interval(mut self, d: Duration) -> Self {
        self.retry_interval = d;
        self
    }

    pub fn build(self) -> Result<Notifier, NotifyError> {
        if self.retry_attempts == 0 {
            return Err(NotifyError::Config("retry_attempts must be at least 1".into()));
        }
        let transport = match self.transport {
            Some(t) => t,
            None => {
                let client = reqwest::Client::builder()
                    .build()
                    .map_err(|e| NotifyError::Config(e.to_string()))?;
                Box::new(HttpTransport::new(client))
            }
        };
        let (state, _) = watch::channel(NotificationPayload::default());
        Ok(Notifier {
            transport,
            state,
            retry_attempts: self.retry_attempts,
            retry_interval: self.retry_interval,
        })
    }
}

impl Default for NotifierBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the last settled payload and delivers it.
pub struct Notifier {
    transport: Box<dyn Transport>,
    state: watch::Sender<NotificationPayload>,
    retry_attempts: u32,
    retry_interval: Duration,
}

impl Notifier {
    pub fn builder() -> NotifierBuilder {
        NotifierBuilder::new()
    }

    /// Receiver for the current payload (used by the status surface).
    pub fn subscribe(&self) -> watch::Receiver<NotificationPayload> {
        self.state.subscribe()
    }

    /// Current payload.
    pub fn payload(&self) -> NotificationPayload {
        self.state.borrow().clone()
    }

    /// Overwrite the shared payload from a monitor state. Returns the new payload.
    pub fn set_state(&self, state: &MonitorState) -> NotificationPayload {
        let payload = NotificationPayload::from(state);
        tracing::debug!(status = ?payload.status, "state changed");
        self.state.send_replace(payload.clone());
        payload
    }

    /// POST the payload to `url`, retrying transport failures.
    pub async fn notify_state_change(
        &self,
        url: &str,
        payload: &NotificationPayload,
    ) -> Result<(), NotifyError> {
        let body = serde_json::to_vec(payload)?;

        let mut attempt = 1;
        loop {
            match self.transport.post_json(url, body.clone()).await {
                Ok(status) => {
                    tracing::debug!(status, attempt, "notification result");
                    return Ok(());
                }
                Err(e) if attempt >= self.retry_attempts => {
                    return Err(NotifyError::Exhausted {
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    tracing::debug!(reason = %e, attempt, "notification attempt failed, retrying");
                }
            }
            attempt += 1;
            tokio::time::sleep(self.retry_interval).await;
        }
    }
}
