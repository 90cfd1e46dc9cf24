//! EndpointSliceSource: membership events from the cluster's EndpointSlice API.
//!
//! Each subscription lists the matching slices, then watches from the listed resource version.
//! Slices known from an earlier subscription but missing from the new listing are reported
//! as removed, so nothing stays stale across a resubscription.

use crate::kube::Credentials;
use crate::record::{Endpoint, MembershipEvent, MembershipRecord, ObjectReference};
use crate::source::{EventSource, EventStream, SourceError};
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Label linking an EndpointSlice to its service.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Server-side watch timeout; the watch is re-issued from the last seen version afterwards.
pub const DEFAULT_WATCH_TIMEOUT_SECS: u64 = 290;

/// Pause before re-issuing a watch that closed without delivering anything.
pub const DEFAULT_REWATCH_DELAY: Duration = Duration::from_secs(1);

/// Last known record per slice (`namespace/name`), shared across subscriptions.
type KnownSlices = Arc<Mutex<HashMap<String, MembershipRecord>>>;

/// Label selector for the monitored service name and/or labels.
pub fn label_selector(service: Option<&str>, labels: Option<&str>) -> String {
    let mut parts = Vec::new();
    if let Some(service) = service.filter(|s| !s.is_empty()) {
        parts.push(format!("{SERVICE_NAME_LABEL}={service}"));
    }
    if let Some(labels) = labels {
        parts.extend(
            labels
                .split(',')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string),
        );
    }
    parts.join(",")
}

/// Event source over EndpointSlices in one namespace.
pub struct EndpointSliceSource {
    credentials: Credentials,
    namespace: String,
    selector: String,
    watch_timeout_secs: u64,
    rewatch_delay: Duration,
    known: KnownSlices,
}

impl EndpointSliceSource {
    pub fn new(credentials: Credentials, namespace: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            credentials,
            namespace: namespace.into(),
            selector: selector.into(),
            watch_timeout_secs: DEFAULT_WATCH_TIMEOUT_SECS,
            rewatch_delay: DEFAULT_REWATCH_DELAY,
            known: Arc::default(),
        }
    }

    pub fn watch_timeout_secs(mut self, secs: u64) -> Self {
        self.watch_timeout_secs = secs;
        self
    }

    pub fn rewatch_delay(mut self, delay: Duration) -> Self {
        self.rewatch_delay = delay;
        self
    }

    fn url(&self) -> String {
        format!(
            "{}/apis/discovery.k8s.io/v1/namespaces/{}/endpointslices",
            self.credentials.server().trim_end_matches('/'),
            self.namespace
        )
    }
}

#[async_trait]
impl EventSource for EndpointSliceSource {
    async fn subscribe(&mut self) -> Result<EventStream, SourceError> {
        let client = self.credentials.http_client()?;
        let token = self.credentials.bearer_token()?;
        let url = self.url();

        let resp = get(&client, &url, token.as_deref(), &[("labelSelector", self.selector.as_str())]).await?;
        let list: EndpointSliceList = serde_json::from_slice(&resp.bytes().await?)?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        tracing::debug!(
            count = list.items.len(),
            resource_version = %resource_version,
            selector = %self.selector,
            "listed endpoint slices"
        );

        let initial = relist(&self.known, list.items);
        let watch = watch(
            client,
            url,
            token,
            self.selector.clone(),
            resource_version,
            self.watch_timeout_secs,
            self.rewatch_delay,
            Arc::clone(&self.known),
        );
        Ok(futures_util::stream::iter(initial.into_iter().map(Ok))
            .chain(watch)
            .boxed())
    }
}

async fn get(
    client: &reqwest::Client,
    url: &str,
    token: Option<&str>,
    query: &[(&str, &str)],
) -> Result<reqwest::Response, SourceError> {
    let mut req = client.get(url).query(query);
    if let Some(token) = token {
        req = req.bearer_auth(token);
    }
    let resp = req.send().await?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::GONE {
        return Err(SourceError::Expired(body));
    }
    Err(SourceError::Status {
        status: status.as_u16(),
        body,
    })
}

fn watch(
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    selector: String,
    mut resource_version: String,
    timeout_secs: u64,
    rewatch_delay: Duration,
    known: KnownSlices,
) -> impl Stream<Item = Result<MembershipEvent, SourceError>> + Send + 'static {
    try_stream! {
        let timeout = timeout_secs.to_string();
        loop {
            let query = [
                ("labelSelector", selector.as_str()),
                ("watch", "true"),
                ("allowWatchBookmarks", "true"),
                ("resourceVersion", resource_version.as_str()),
                ("timeoutSeconds", timeout.as_str()),
            ];
            let resp = get(&client, &url, token.as_deref(), &query).await?;
            let mut body = resp.bytes_stream();
            let mut buf: Vec<u8> = Vec::new();
            let mut received = false;
            while let Some(chunk) = body.next().await {
                buf.extend_from_slice(&chunk?);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    received |= !line.iter().all(u8::is_ascii_whitespace);
                    if let Some(event) = apply_watch_line(&known, &line, &mut resource_version)? {
                        yield event;
                    }
                }
            }
            if received {
                tracing::debug!(resource_version = %resource_version, "watch closed by server, re-watching");
            } else {
                tracing::debug!(
                    resource_version = %resource_version,
                    delay = ?rewatch_delay,
                    "watch closed without events, re-watching after delay"
                );
                tokio::time::sleep(rewatch_delay).await;
            }
        }
    }
}

/// Full-listing events: Added/Updated for every listed slice, Removed for slices that vanished.
fn relist(known: &Mutex<HashMap<String, MembershipRecord>>, items: Vec<EndpointSlice>) -> Vec<MembershipEvent> {
    let mut known = known.lock();
    let mut seen = HashSet::with_capacity(items.len());
    let mut events = Vec::with_capacity(items.len());

    for item in items {
        let record = MembershipRecord::from(item);
        let key = slice_key(&record);
        seen.insert(key.clone());
        let event = if known.insert(key, record.clone()).is_some() {
            MembershipEvent::Updated(record)
        } else {
            MembershipEvent::Added(record)
        };
        events.push(event);
    }

    let stale: Vec<String> = known.keys().filter(|k| !seen.contains(*k)).cloned().collect();
    for key in stale {
        if let Some(record) = known.remove(&key) {
            events.push(MembershipEvent::Removed(record));
        }
    }
    events
}

/// Decode one watch line. Returns the membership event it carries, if any.
fn apply_watch_line(
    known: &Mutex<HashMap<String, MembershipRecord>>,
    line: &[u8],
    resource_version: &mut String,
) -> Result<Option<MembershipEvent>, SourceError> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let event: WatchEvent = serde_json::from_slice(line)?;
    let slice = match event {
        WatchEvent::Error(status) if status.code == 410 => {
            return Err(SourceError::Expired(status.message));
        }
        WatchEvent::Error(status) => {
            return Err(SourceError::Status {
                status: status.code,
                body: status.message,
            });
        }
        WatchEvent::Bookmark(object) => {
            if let Some(rv) = object.metadata.resource_version.filter(|rv| !rv.is_empty()) {
                *resource_version = rv;
            }
            return Ok(None);
        }
        WatchEvent::Added(slice) | WatchEvent::Modified(slice) | WatchEvent::Deleted(slice)
            if slice.metadata.name.is_empty() =>
        {
            tracing::warn!("watch event without slice name, ignoring");
            return Ok(None);
        }
        WatchEvent::Deleted(slice) => {
            update_version(resource_version, &slice);
            let record = MembershipRecord::from(slice);
            known.lock().remove(&slice_key(&record));
            return Ok(Some(MembershipEvent::Removed(record)));
        }
        WatchEvent::Added(slice) | WatchEvent::Modified(slice) => slice,
    };

    update_version(resource_version, &slice);
    let record = MembershipRecord::from(slice);
    let previous = known.lock().insert(slice_key(&record), record.clone());
    Ok(Some(if previous.is_some() {
        MembershipEvent::Updated(record)
    } else {
        MembershipEvent::Added(record)
    }))
}

fn update_version(resource_version: &mut String, slice: &EndpointSlice) {
    if let Some(rv) = slice.metadata.resource_version.as_ref().filter(|rv| !rv.is_empty()) {
        resource_version.clone_from(rv);
    }
}

fn slice_key(record: &MembershipRecord) -> String {
    format!("{}/{}", record.namespace, record.name)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    resource_version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EndpointSlice {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    endpoints: Option<Vec<SliceEndpoint>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SliceEndpoint {
    #[serde(default)]
    conditions: Conditions,
    #[serde(default)]
    target_ref: Option<TargetRef>,
}

#[derive(Debug, Default, Deserialize)]
struct Conditions {
    #[serde(default)]
    ready: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct TargetRef {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMeta {
    #[serde(default)]
    resource_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndpointSliceList {
    #[serde(default)]
    metadata: ListMeta,
    #[serde(default)]
    items: Vec<EndpointSlice>,
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
enum WatchEvent {
    Added(EndpointSlice),
    Modified(EndpointSlice),
    Deleted(EndpointSlice),
    Bookmark(EndpointSlice),
    Error(ApiStatus),
}

impl From<EndpointSlice> for MembershipRecord {
    fn from(slice: EndpointSlice) -> Self {
        let EndpointSlice { mut metadata, endpoints } = slice;
        Self {
            service_name: metadata.labels.remove(SERVICE_NAME_LABEL),
            namespace: metadata.namespace,
            name: metadata.name,
            endpoints: endpoints
                .unwrap_or_default()
                .into_iter()
                .map(|e| Endpoint {
                    ready: e.conditions.ready,
                    target_ref: e.target_ref.map(|t| ObjectReference {
                        kind: t.kind,
                        namespace: t.namespace,
                        name: t.name,
                    }),
                })
                .collect(),
        }
    }
}
