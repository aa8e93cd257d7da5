#[path = "support/mod.rs"]
mod support;

use questlink::connectivity::monitor::HEALTH_CHECK_HEADER;
use questlink::connectivity::{ChangeReason, ConnectivityEvent};
use questlink::health::OutcomeKind;
use questlink::store::{KeyValueStore, MemoryStore};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::mocks::Scripted;
use support::{harness, harness_with_store, test_config, FALLBACK_A, FALLBACK_B, PRIMARY};

fn record_events(
    monitor: &questlink::connectivity::ConnectivityMonitor,
) -> (Arc<Mutex<Vec<ConnectivityEvent>>>, questlink::events::Subscription) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let subscription = monitor.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
    (events, subscription)
}

#[tokio::test(start_paused = true)]
async fn reported_failures_walk_the_ring_and_wrap() {
    let h = harness(test_config());
    let monitor = h.access.monitor();

    let mut visited = vec![monitor.current_endpoint().url];
    for _ in 0..3 {
        let failed = monitor.current_endpoint();
        visited.push(monitor.report_failure(&failed).url);
    }
    assert_eq!(visited, vec![PRIMARY, FALLBACK_A, FALLBACK_B, PRIMARY]);
}

#[tokio::test(start_paused = true)]
async fn stale_failure_reports_do_not_move_selection() {
    let h = harness(test_config());
    let monitor = h.access.monitor();
    let primary = monitor.current_endpoint();

    let next = monitor.report_failure(&primary);
    assert_eq!(next.url, FALLBACK_A);
    let again = monitor.report_failure(&primary);
    assert_eq!(again.url, FALLBACK_A, "second report about the old endpoint is ignored");
}

#[tokio::test(start_paused = true)]
async fn probe_failures_within_threshold_keep_the_endpoint() {
    let h = harness(test_config());
    let monitor = h.access.monitor();
    let (events, _subscription) = record_events(monitor);

    monitor.record_success(&monitor.current_endpoint());
    assert!(monitor.is_server_reachable());

    assert!(!monitor.check_reachability().await);
    assert_eq!(monitor.current_endpoint().url, PRIMARY);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(!monitor.is_server_reachable());
    assert!(!monitor.check_reachability().await);
    assert_eq!(monitor.current_endpoint().url, FALLBACK_A);

    let events = events.lock().unwrap();
    assert!(events
        .iter()
        .any(|event| matches!(event, ConnectivityEvent::ServerUnreachable { endpoint } if endpoint.url == PRIMARY)));
    assert!(events.iter().any(|event| matches!(
        event,
        ConnectivityEvent::EndpointChanged { reason: ChangeReason::Unreachable, to, .. } if to.url == FALLBACK_A
    )));
}

#[tokio::test(start_paused = true)]
async fn repeated_successful_probes_keep_the_same_health() {
    let h = harness(test_config());
    h.backend
        .push("/api/health", Scripted::Reply(200, json!({ "status": "ok" })));
    h.backend
        .push("/api/health", Scripted::Reply(200, json!({ "status": "ok" })));
    let monitor = h.access.monitor();

    assert!(monitor.check_reachability().await);
    let first = monitor.snapshot();
    assert!(monitor.check_reachability().await);
    let second = monitor.snapshot();

    assert!(first.healthy);
    assert_eq!(first.healthy, second.healthy);
    assert_eq!(first.selected_endpoint, second.selected_endpoint);
}

#[tokio::test(start_paused = true)]
async fn repeated_failed_probes_within_threshold_keep_the_same_health() {
    let h = harness(test_config());
    let monitor = h.access.monitor();
    h.backend
        .push("/api/health", Scripted::Reply(200, json!({ "status": "ok" })));
    assert!(monitor.check_reachability().await);

    assert!(!monitor.check_reachability().await);
    let first = monitor.snapshot();
    assert!(!monitor.check_reachability().await);
    let second = monitor.snapshot();

    assert_eq!(first.healthy, second.healthy);
    assert_eq!(first.selected_endpoint.url, PRIMARY);
    assert_eq!(second.selected_endpoint.url, PRIMARY);
}

#[tokio::test(start_paused = true)]
async fn successful_probe_sends_health_header_and_reports_reachable() {
    let h = harness(test_config());
    h.backend
        .push("/api/health", Scripted::Reply(200, json!({ "status": "ok" })));
    let monitor = h.access.monitor();
    let (events, _subscription) = record_events(monitor);

    assert!(monitor.check_reachability().await);

    let probe = &h.backend.calls_to("/api/health")[0].call;
    assert_eq!(probe.url, format!("{PRIMARY}/api/health"));
    assert_eq!(probe.header(HEALTH_CHECK_HEADER), Some("true"));
    assert!(monitor.snapshot().healthy);
    assert!(monitor.snapshot().last_success_at.is_some());
    assert_eq!(events.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn device_transitions_emit_once_per_change() {
    let h = harness(test_config());
    let monitor = h.access.monitor();
    let offline = Arc::new(Mutex::new(0));
    let _subscription = {
        let offline = offline.clone();
        monitor.subscribe_topic("offline", move |_| *offline.lock().unwrap() += 1)
    };

    monitor.set_device_online(false);
    monitor.set_device_online(false);
    assert!(!monitor.is_device_online());
    assert!(!*monitor.device_signal().borrow());
    assert_eq!(*offline.lock().unwrap(), 1);

    assert!(!monitor.check_reachability().await, "no probe while offline");
    assert!(h.backend.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn persisted_endpoint_is_restored() {
    let store = Arc::new(MemoryStore::new());
    store.set("server_url", json!(FALLBACK_B)).unwrap();
    let h = harness_with_store(test_config(), store);
    assert_eq!(h.access.monitor().current_endpoint().url, FALLBACK_B);

    let store = Arc::new(MemoryStore::new());
    store.set("server_url", json!("http://retired.test")).unwrap();
    let h = harness_with_store(test_config(), store);
    assert_eq!(h.access.monitor().current_endpoint().url, PRIMARY);
}

#[tokio::test(start_paused = true)]
async fn unhealthy_selection_is_deprioritised() {
    let h = harness(test_config());
    let monitor = h.access.monitor();
    let (events, _subscription) = record_events(monitor);

    h.access
        .aggregator()
        .record_sample(PRIMARY, OutcomeKind::ServerError, Duration::from_millis(40));

    assert_eq!(monitor.current_endpoint().url, FALLBACK_A);
    assert!(events.lock().unwrap().iter().any(|event| matches!(
        event,
        ConnectivityEvent::EndpointChanged { reason: ChangeReason::Unhealthy, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn probe_loop_pauses_while_offline() {
    let h = harness(test_config());
    let monitor = h.access.monitor();
    monitor.spawn_probe_loop(h.access.timers());

    tokio::time::sleep(Duration::from_millis(12_500)).await;
    assert_eq!(h.backend.calls_to("/api/health").len(), 2);

    monitor.set_device_online(false);
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(h.backend.calls_to("/api/health").len(), 2);

    monitor.set_device_online(true);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.backend.calls_to("/api/health").len(), 3, "probe runs as soon as the device is back");

    h.access.timers().shutdown();
}
