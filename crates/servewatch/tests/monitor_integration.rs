//! Integration test: scripted event source → Monitor → debounce → Notifier → fake application.

mod common;

use common::{assert_no_delivery, init_tracing, next_delivery, record, spawn_receiver, ScriptedSource};
use servewatch::notifier::CONTENT_TYPE;
use servewatch::{
    MembershipEvent, Monitor, MonitorConfig, MonitorState, Notifier, ReconnectionConfig,
    ServiceName, SourceError, Status,
};
use std::time::Duration;
use tokio::time::timeout;

const DEBOUNCE: Duration = Duration::from_millis(50);

fn config(url: &str) -> MonitorConfig {
    MonitorConfig {
        namespace: "ns".into(),
        pod_name: "p".into(),
        service_name: Some("S".into()),
        url: url.into(),
        debounce: DEBOUNCE,
        reconnection: ReconnectionConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        },
        ..Default::default()
    }
}

fn notifier() -> Notifier {
    Notifier::builder()
        .retry_interval(Duration::from_millis(10))
        .build()
        .expect("notifier")
}

#[tokio::test]
async fn activation_then_deactivation_is_posted() {
    init_tracing();
    let (url, mut deliveries) = spawn_receiver().await;
    let (source, script) = ScriptedSource::new();
    let monitor = Monitor::new(config(&url), source, notifier());
    let stop = monitor.stop_handle();
    let status = monitor.status();
    let task = tokio::spawn(monitor.run());

    let events = script.open();
    let rec = record("S", "S-abc", &["p"]);
    events.send(Ok(MembershipEvent::Added(rec.clone()))).unwrap();

    let d = next_delivery(&mut deliveries).await;
    assert_eq!(d.content_type, CONTENT_TYPE);
    assert_eq!(
        serde_json::to_string(&d.payload).unwrap(),
        r#"{"status":"active","activeServices":["S"]}"#
    );
    assert_eq!(status.borrow().status, Status::Active);

    events.send(Ok(MembershipEvent::Removed(rec))).unwrap();
    let d = next_delivery(&mut deliveries).await;
    assert_eq!(
        serde_json::to_string(&d.payload).unwrap(),
        r#"{"status":"inactive","activeServices":[]}"#
    );
    assert_eq!(status.borrow().status, Status::Inactive);

    stop.stop();
    let state = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert_eq!(state, MonitorState::default());
}

#[tokio::test]
async fn redelivered_records_do_not_notify() {
    init_tracing();
    let (url, mut deliveries) = spawn_receiver().await;
    let (source, script) = ScriptedSource::new();
    let monitor = Monitor::new(config(&url), source, notifier());
    let stop = monitor.stop_handle();
    let task = tokio::spawn(monitor.run());

    let events = script.open();
    let rec = record("S", "S-abc", &["p"]);
    events.send(Ok(MembershipEvent::Added(rec.clone()))).unwrap();
    assert_eq!(next_delivery(&mut deliveries).await.payload.status, Status::Active);

    for _ in 0..5 {
        events.send(Ok(MembershipEvent::Updated(rec.clone()))).unwrap();
    }
    // Another pod joining changes the cache but not this pod's membership.
    events
        .send(Ok(MembershipEvent::Updated(record("S", "S-abc", &["p", "q"]))))
        .unwrap();
    assert_no_delivery(&mut deliveries, DEBOUNCE * 4).await;

    stop.stop();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn flicker_within_window_is_coalesced() {
    init_tracing();
    let (url, mut deliveries) = spawn_receiver().await;
    let (source, script) = ScriptedSource::new();
    let mut cfg = config(&url);
    cfg.debounce = Duration::from_millis(200);
    let monitor = Monitor::new(cfg, source, notifier());
    let stop = monitor.stop_handle();
    let task = tokio::spawn(monitor.run());

    let events = script.open();
    let rec = record("S", "S-abc", &["p"]);
    events.send(Ok(MembershipEvent::Added(rec.clone()))).unwrap();
    events.send(Ok(MembershipEvent::Removed(rec.clone()))).unwrap();
    events.send(Ok(MembershipEvent::Added(rec))).unwrap();

    let d = next_delivery(&mut deliveries).await;
    assert_eq!(d.payload.status, Status::Active);
    assert_no_delivery(&mut deliveries, Duration::from_millis(400)).await;

    stop.stop();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn multiple_services_are_sorted() {
    init_tracing();
    let (url, mut deliveries) = spawn_receiver().await;
    let (source, script) = ScriptedSource::new();
    let mut cfg = config(&url);
    cfg.service_name = None;
    cfg.service_labels = Some("app=web".into());
    let monitor = Monitor::new(cfg, source, notifier());
    let stop = monitor.stop_handle();
    let task = tokio::spawn(monitor.run());

    let events = script.open();
    events.send(Ok(MembershipEvent::Added(record("zeta", "zeta-1", &["p"])))).unwrap();
    events.send(Ok(MembershipEvent::Added(record("alpha", "alpha-1", &["p"])))).unwrap();
    events.send(Ok(MembershipEvent::Added(record("mid", "mid-1", &["q"])))).unwrap();

    let d = next_delivery(&mut deliveries).await;
    assert_eq!(d.payload.active_services, ["alpha", "zeta"]);

    stop.stop();
    let state = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert_eq!(
        state.active_services,
        vec![ServiceName::new("ns", "alpha"), ServiceName::new("ns", "zeta")]
    );
}

#[tokio::test]
async fn failed_subscription_is_replaced_and_cache_kept() {
    init_tracing();
    let (url, mut deliveries) = spawn_receiver().await;
    let (source, script) = ScriptedSource::new();
    let monitor = Monitor::new(config(&url), source, notifier());
    let stop = monitor.stop_handle();
    let task = tokio::spawn(monitor.run());

    let first = script.open();
    let rec = record("S", "S-abc", &["p"]);
    first.send(Ok(MembershipEvent::Added(rec.clone()))).unwrap();
    first.send(Err(SourceError::Closed("connection reset".into()))).unwrap();
    assert_eq!(next_delivery(&mut deliveries).await.payload.status, Status::Active);

    // The replacement subscription replays the listing; nothing changed, nothing is posted.
    let second = script.open();
    second.send(Ok(MembershipEvent::Added(rec.clone()))).unwrap();
    assert_no_delivery(&mut deliveries, DEBOUNCE * 4).await;
    assert_eq!(script.subscribe_calls(), 2);

    second.send(Ok(MembershipEvent::Removed(rec))).unwrap();
    assert_eq!(next_delivery(&mut deliveries).await.payload.status, Status::Inactive);

    // A subscription that simply ends is replaced too.
    drop(second);
    let third = script.open();
    third.send(Ok(MembershipEvent::Added(record("S", "S-abc", &["p"])))).unwrap();
    assert_eq!(next_delivery(&mut deliveries).await.payload.status, Status::Active);
    assert_eq!(script.subscribe_calls(), 3);

    stop.stop();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn subscribe_errors_are_retried() {
    init_tracing();
    let (url, mut deliveries) = spawn_receiver().await;
    let (source, script) = ScriptedSource::new();
    let monitor = Monitor::new(config(&url), source, notifier());
    let stop = monitor.stop_handle();
    let task = tokio::spawn(monitor.run());

    script.fail("forbidden");
    script.fail("forbidden");
    let events = script.open();
    events.send(Ok(MembershipEvent::Added(record("S", "S-abc", &["p"])))).unwrap();
    assert_eq!(next_delivery(&mut deliveries).await.payload.status, Status::Active);
    assert_eq!(script.subscribe_calls(), 3);

    stop.stop();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn stop_flushes_pending_state() {
    init_tracing();
    let (url, mut deliveries) = spawn_receiver().await;
    let (source, script) = ScriptedSource::new();
    let mut cfg = config(&url);
    cfg.debounce = Duration::from_secs(30);
    let monitor = Monitor::new(cfg, source, notifier());
    let stop = monitor.stop_handle();
    let task = tokio::spawn(monitor.run());

    let events = script.open();
    events.send(Ok(MembershipEvent::Added(record("S", "S-abc", &["p"])))).unwrap();
    // Let dispatch process the event before stopping.
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop.stop();

    let d = next_delivery(&mut deliveries).await;
    assert_eq!(d.payload.status, Status::Active);
    let state = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert!(state.is_active);
}

#[tokio::test]
async fn stop_while_subscribing_exits() {
    init_tracing();
    let (source, _script) = ScriptedSource::new();
    let monitor = Monitor::new(config("http://127.0.0.1:9/unused"), source, notifier());
    let stop = monitor.stop_handle();
    let task = tokio::spawn(monitor.run());

    tokio::time::sleep(Duration::from_millis(20)).await;
    stop.stop();
    stop.stop();
    let state = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert_eq!(state, MonitorState::default());
}

#[tokio::test]
async fn disabled_notifier_only_publishes_state() {
    init_tracing();
    let (url, mut deliveries) = spawn_receiver().await;
    let (source, script) = ScriptedSource::new();
    let mut cfg = config(&url);
    cfg.disable_notifier = true;
    let monitor = Monitor::new(cfg, source, notifier());
    let stop = monitor.stop_handle();
    let mut status = monitor.status();
    let task = tokio::spawn(monitor.run());

    let events = script.open();
    events.send(Ok(MembershipEvent::Added(record("S", "S-abc", &["p"])))).unwrap();

    timeout(Duration::from_secs(5), status.wait_for(|p| p.status == Status::Active))
        .await
        .unwrap()
        .unwrap();
    assert_no_delivery(&mut deliveries, DEBOUNCE * 4).await;

    stop.stop();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn unreachable_receiver_does_not_stall_monitor() {
    init_tracing();
    let (source, script) = ScriptedSource::new();
    // Nothing listens on the discard port.
    let monitor = Monitor::new(config("http://127.0.0.1:9/applicationstate"), source, notifier());
    let stop = monitor.stop_handle();
    let mut status = monitor.status();
    let task = tokio::spawn(monitor.run());

    let events = script.open();
    let rec = record("S", "S-abc", &["p"]);
    events.send(Ok(MembershipEvent::Added(rec.clone()))).unwrap();
    timeout(Duration::from_secs(5), status.wait_for(|p| p.status == Status::Active))
        .await
        .unwrap()
        .unwrap();

    events.send(Ok(MembershipEvent::Removed(rec))).unwrap();
    timeout(Duration::from_secs(5), status.wait_for(|p| p.status == Status::Inactive))
        .await
        .unwrap()
        .unwrap();

    stop.stop();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}
