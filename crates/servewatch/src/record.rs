//! Membership records: the slices of service membership published by the cluster.
//!
//! A service's members may be spread across several records (EndpointSlices), and a
//! member can move between them. The cache therefore keys on the record identity and
//! replaces records wholesale.

use std::fmt;
use thiserror::Error;

/// Kind carried by a target reference that points at a pod.
pub const POD_KIND: &str = "Pod";

/// Namespaced name of a logical service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceName {
    pub namespace: String,
    pub name: String,
}

impl ServiceName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Back-reference from a member entry to the object serving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// One member entry of a record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    /// Readiness condition; `None` means ready.
    pub ready: Option<bool>,
    pub target_ref: Option<ObjectReference>,
}

impl Endpoint {
    pub fn is_ready(&self) -> bool {
        self.ready.unwrap_or(true)
    }
}

/// Identity of the local pod, matched against endpoint target references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

impl PodRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// True if the reference points at this pod.
    pub fn matches(&self, target: &ObjectReference) -> bool {
        target.kind == POD_KIND && target.namespace == self.namespace && target.name == self.name
    }

    /// True if the endpoint is ready and served by this pod.
    pub fn is_ready_member(&self, endpoint: &Endpoint) -> bool {
        endpoint.is_ready()
            && endpoint
                .target_ref
                .as_ref()
                .is_some_and(|target| self.matches(target))
    }
}

/// One slice of membership for a service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipRecord {
    pub namespace: String,
    /// Record identity, unique within the owning service.
    pub name: String,
    /// Owning service name (the `kubernetes.io/service-name` label).
    pub service_name: Option<String>,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("no service name set on record: {0}")]
    MissingService(String),
    #[error("expected record name and namespace to be set (namespace={namespace:?}, name={name:?})")]
    MissingIdentity { namespace: String, name: String },
}

impl MembershipRecord {
    /// Cache keys for this record: owning service and record name.
    pub fn cache_keys(&self) -> Result<(ServiceName, &str), RecordError> {
        let service = match self.service_name.as_deref() {
            Some(s) if !s.is_empty() => s,
            _ => return Err(RecordError::MissingService(self.name.clone())),
        };
        if self.namespace.is_empty() || self.name.is_empty() {
            return Err(RecordError::MissingIdentity {
                namespace: self.namespace.clone(),
                name: self.name.clone(),
            });
        }
        Ok((ServiceName::new(self.namespace.as_str(), service), self.name.as_str()))
    }
}

/// Event delivered by a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Added(MembershipRecord),
    Updated(MembershipRecord),
    Removed(MembershipRecord),
}

impl MembershipEvent {
    pub fn record(&self) -> &MembershipRecord {
        match self {
            Self::Added(r) | Self::Updated(r) | Self::Removed(r) => r,
        }
    }

    pub fn is_removal(&self) -> bool {
        matches!(self, Self::Removed(_))
    }
}
