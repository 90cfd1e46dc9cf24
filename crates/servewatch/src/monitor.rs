//! Monitor: reconciles membership events into a settled active/inactive state.
//!
//! Three tasks cooperate:
//! - dispatch (this loop): drives the subscription, feeds the cache, recomputes membership and
//!   sends changed states to the debouncer. Never waits on notification I/O.
//! - the debouncer (see [`crate::debounce`]).
//! - delivery: drains debounced states, publishes them and POSTs them to the application.
//!
//! Shutdown: [`StopHandle::stop`] cancels the subscription, dispatch exits, its sender to the
//! debouncer is dropped (flushing any pending state), and delivery drains and exits.

use crate::cache::MembershipCache;
use crate::config::MonitorConfig;
use crate::debounce::debounce;
use crate::notifier::{NotificationPayload, Notifier};
use crate::record::{MembershipEvent, PodRef, ServiceName};
use crate::source::{EventSource, EventStream};
use futures_util::StreamExt;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// Capacity of the dispatch → debouncer channel. The debouncer drains continuously.
const STATE_BUFFER: usize = 16;

/// Whether this pod is serving, and for which services (sorted, no duplicates).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorState {
    pub is_active: bool,
    pub active_services: Vec<ServiceName>,
}

/// Requests a monitor stop. Cloneable; repeated calls have no further effect.
#[derive(Debug, Clone)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    pub fn stop(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!("monitor stop requested");
        }
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Subscription lifecycle.
enum Subscription {
    Subscribing,
    Running { stream: EventStream, delivered: bool },
    Failed { delivered: bool },
    Stopped,
}

/// Follows membership events for the configured pod.
pub struct Monitor<S> {
    config: MonitorConfig,
    pod: PodRef,
    source: S,
    cache: MembershipCache,
    state: MonitorState,
    notifier: Arc<Notifier>,
    stop: CancellationToken,
}

impl<S: EventSource> Monitor<S> {
    pub fn new(config: MonitorConfig, source: S, notifier: Notifier) -> Self {
        let pod = config.pod();
        Self {
            config,
            pod,
            source,
            cache: MembershipCache::new(),
            state: MonitorState::default(),
            notifier: Arc::new(notifier),
            stop: CancellationToken::new(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            token: self.stop.clone(),
        }
    }

    /// Last computed (not yet necessarily delivered) state.
    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    /// Receiver for the last delivered payload.
    pub fn status(&self) -> watch::Receiver<NotificationPayload> {
        self.notifier.subscribe()
    }

    /// Run until stopped. Returns the final computed state once delivery has drained.
    pub async fn run(mut self) -> MonitorState {
        let (tx, rx) = mpsc::channel(STATE_BUFFER);
        let debounced = debounce(self.config.debounce, rx);
        let delivery = tokio::spawn(deliver(
            debounced,
            Arc::clone(&self.notifier),
            self.config.url.clone(),
            self.config.disable_notifier,
        ));

        self.dispatch(&tx).await;

        drop(tx);
        if let Err(e) = delivery.await {
            tracing::error!(reason = %e, "delivery task failed");
        }
        self.state
    }

    async fn dispatch(&mut self, tx: &mpsc::Sender<MonitorState>) {
        let reconnection = self.config.reconnection.clone();
        let mut backoff = reconnection.initial_backoff;
        let mut subscription = Subscription::Subscribing;

        loop {
            subscription = match subscription {
                Subscription::Subscribing => {
                    let res = tokio::select! {
                        biased;
                        () = self.stop.cancelled() => None,
                        res = self.source.subscribe() => Some(res),
                    };
                    match res {
                        None => Subscription::Stopped,
                        Some(Ok(stream)) => {
                            tracing::debug!("subscription established");
                            Subscription::Running {
                                stream,
                                delivered: false,
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(reason = %e, "subscribe failed");
                            Subscription::Failed { delivered: false }
                        }
                    }
                }
                Subscription::Running {
                    mut stream,
                    delivered,
                } => {
                    let item = tokio::select! {
                        biased;
                        () = self.stop.cancelled() => None,
                        item = stream.next() => Some(item),
                    };
                    match item {
                        None => Subscription::Stopped,
                        Some(Some(Ok(event))) => {
                            if let Some(state) = self.handle_event(&event) {
                                if tx.send(state).await.is_err() {
                                    tracing::warn!("debouncer closed, dropping state");
                                }
                            }
                            Subscription::Running {
                                stream,
                                delivered: true,
                            }
                        }
                        Some(Some(Err(e))) => {
                            tracing::warn!(reason = %e, "subscription failed, resubscribing...");
                            Subscription::Failed { delivered }
                        }
                        Some(None) => {
                            tracing::warn!("subscription ended, resubscribing...");
                            Subscription::Failed { delivered }
                        }
                    }
                }
                Subscription::Failed { delivered: true } => {
                    backoff = reconnection.initial_backoff;
                    Subscription::Subscribing
                }
                Subscription::Failed { delivered: false } => {
                    let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
                    let wait = backoff + Duration::from_millis(jitter_ms);
                    backoff = std::cmp::min(backoff * 2, reconnection.max_backoff);
                    tokio::select! {
                        biased;
                        () = self.stop.cancelled() => Subscription::Stopped,
                        () = sleep(wait) => Subscription::Subscribing,
                    }
                }
                Subscription::Stopped => break,
            };
        }
        tracing::debug!("monitor stopped");
    }

    /// Apply one event. Returns the new state if the settled membership changed.
    pub(crate) fn handle_event(&mut self, event: &MembershipEvent) -> Option<MonitorState> {
        let record = event.record();
        let changed = self.cache.update(record, event.is_removal());
        tracing::debug!(record = %record.name, changed, removal = event.is_removal(), "membership event");
        if !changed {
            return None;
        }

        let services = self.active_services();
        if services == self.state.active_services {
            return None;
        }

        let was_active = self.state.is_active;
        self.state = MonitorState {
            is_active: !services.is_empty(),
            active_services: services,
        };

        let names: Vec<String> = self.state.active_services.iter().map(ToString::to_string).collect();
        match (was_active, self.state.is_active) {
            (false, true) => {
                tracing::info!(pod = %self.pod.name, ns = %self.pod.namespace, svc = ?names, "Activated");
            }
            (true, false) => {
                tracing::info!(pod = %self.pod.name, ns = %self.pod.namespace, "Deactivated");
            }
            _ => {
                tracing::info!(pod = %self.pod.name, ns = %self.pod.namespace, svc = ?names, "Active services changed");
            }
        }
        Some(self.state.clone())
    }

    /// Services with at least one ready member backed by this pod, sorted.
    pub fn active_services(&self) -> Vec<ServiceName> {
        let view = self.cache.services();
        let mut services: Vec<ServiceName> = view
            .iter()
            .filter(|(_, members)| members.iter().any(|e| self.pod.is_ready_member(e)))
            .map(|(service, _)| service.clone())
            .collect();
        services.sort();
        services
    }
}

/// Drain debounced states: publish each, then POST it unless notification is disabled.
async fn deliver(
    mut states: mpsc::Receiver<MonitorState>,
    notifier: Arc<Notifier>,
    url: String,
    disabled: bool,
) {
    while let Some(state) = states.recv().await {
        let payload = notifier.set_state(&state);
        if disabled {
            continue;
        }
        if let Err(e) = notifier.notify_state_change(&url, &payload).await {
            tracing::error!(reason = %e, url = %url, "error notifying state change");
        }
    }
    tracing::debug!("delivery drained");
}
