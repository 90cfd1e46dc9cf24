//! Common helpers for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use futures_util::StreamExt;
use servewatch::{
    Endpoint, EventSource, EventStream, MembershipEvent, MembershipRecord, NotificationPayload,
    ObjectReference, SourceError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub type EventSender = mpsc::UnboundedSender<Result<MembershipEvent, SourceError>>;
type Subscription = Result<mpsc::UnboundedReceiver<Result<MembershipEvent, SourceError>>, SourceError>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("servewatch=debug")
        .with_test_writer()
        .try_init();
}

/// Event source driven by the test. Each `subscribe` waits for the next scripted subscription.
pub struct ScriptedSource {
    subscriptions: mpsc::UnboundedReceiver<Subscription>,
    subscribe_calls: Arc<AtomicUsize>,
}

/// Test side of a [`ScriptedSource`].
pub struct Script {
    subscriptions: mpsc::UnboundedSender<Subscription>,
    subscribe_calls: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new() -> (Self, Script) {
        let (tx, rx) = mpsc::unbounded_channel();
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                subscriptions: rx,
                subscribe_calls: Arc::clone(&calls),
            },
            Script {
                subscriptions: tx,
                subscribe_calls: calls,
            },
        )
    }
}

impl Script {
    /// Make the next `subscribe` succeed; events sent on the returned sender flow into it.
    /// Dropping the sender ends the subscription.
    pub fn open(&self) -> EventSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.send(Ok(rx)).expect("source dropped");
        tx
    }

    /// Make the next `subscribe` fail.
    pub fn fail(&self, reason: &str) {
        self.subscriptions
            .send(Err(SourceError::Closed(reason.into())))
            .expect("source dropped");
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn subscribe(&mut self) -> Result<EventStream, SourceError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let Some(next) = self.subscriptions.recv().await else {
            return std::future::pending().await;
        };
        let mut events = next?;
        Ok(futures_util::stream::poll_fn(move |cx| events.poll_recv(cx)).boxed())
    }
}

pub fn pod(name: &str) -> ObjectReference {
    ObjectReference {
        kind: "Pod".into(),
        namespace: "ns".into(),
        name: name.into(),
    }
}

/// Record for `service` whose members are the given pods, all ready.
pub fn record(service: &str, slice: &str, pods: &[&str]) -> MembershipRecord {
    MembershipRecord {
        namespace: "ns".into(),
        name: slice.into(),
        service_name: Some(service.into()),
        endpoints: pods
            .iter()
            .map(|p| Endpoint {
                ready: Some(true),
                target_ref: Some(pod(p)),
            })
            .collect(),
    }
}

/// One POST received by the fake application.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub content_type: String,
    pub payload: NotificationPayload,
}

/// Fake application receiving state-change POSTs. Returns its URL and the deliveries.
pub async fn spawn_receiver() -> (String, mpsc::UnboundedReceiver<Delivery>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/applicationstate", post(receive))
        .with_state(tx);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind receiver");
    let addr = listener.local_addr().expect("receiver addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/applicationstate"), rx)
}

async fn receive(
    State(tx): State<mpsc::UnboundedSender<Delivery>>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let payload = serde_json::from_str(&body).expect("payload json");
    let _ = tx.send(Delivery {
        content_type,
        payload,
    });
    // Status codes are not interpreted by the notifier.
    StatusCode::INTERNAL_SERVER_ERROR
}

/// Next delivery, failing the test after 5s.
pub async fn next_delivery(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("receiver closed")
}

/// Asserts nothing is delivered within `wait`.
pub async fn assert_no_delivery(rx: &mut mpsc::UnboundedReceiver<Delivery>, wait: Duration) {
    if let Ok(Some(d)) = timeout(wait, rx.recv()).await {
        panic!("unexpected notification: {d:?}");
    }
}
