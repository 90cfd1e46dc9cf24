//! Event source boundary: a restartable subscription over membership records.

use crate::record::MembershipEvent;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

/// Events of one subscription. An `Err` item or the end of the stream means the subscription
/// failed and must be re-established; dropping the stream cancels it.
pub type EventStream = BoxStream<'static, Result<MembershipEvent, SourceError>>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected API status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("watch expired: {0}")]
    Expired(String),
    #[error("credentials: {0}")]
    Credentials(#[from] crate::kube::CredentialsError),
    #[error("subscription closed: {0}")]
    Closed(String),
}

/// Supplies add/update/delete events for membership records. Delivery is at-least-once and
/// not necessarily ordered; every call to `subscribe` starts over with a full listing.
#[async_trait]
pub trait EventSource: Send {
    async fn subscribe(&mut self) -> Result<EventStream, SourceError>;
}
