//! Sidecar runtime: follows the EndpointSlices of one or more services and tells the
//! co-located application whether this pod is currently receiving traffic.
//!
//! - **Monitor**: owns the [MembershipCache], recomputes membership on every real change,
//!   debounces flicker and hands settled states to the [Notifier]. Resubscribes to the
//!   [EventSource] whenever it fails, until stopped.
//! - **Notifier**: publishes the settled state (served by [server]) and POSTs it to the
//!   application with bounded retries.
//! - **EndpointSliceSource**: list + watch of EndpointSlices via the cluster API.

pub mod cache;
pub mod config;
pub mod debounce;
pub mod kube;
pub mod monitor;
pub mod notifier;
pub mod record;
pub mod server;
pub mod source;
pub mod watcher;

pub use cache::{MembershipCache, ServiceMembers, ServicesView};
pub use config::{ConfigError, MonitorConfig, ReconnectionConfig};
pub use debounce::{debounce, debounce_with_buffer};
pub use kube::{Credentials, CredentialsError};
pub use monitor::{Monitor, MonitorState, StopHandle};
pub use notifier::{
    HttpTransport, NotificationPayload, Notifier, NotifierBuilder, NotifyError, Status, Transport,
};
pub use record::{
    Endpoint, MembershipEvent, MembershipRecord, ObjectReference, PodRef, RecordError, ServiceName,
};
pub use source::{EventSource, EventStream, SourceError};
pub use watcher::{label_selector, EndpointSliceSource};
