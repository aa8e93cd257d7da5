#[path = "support/mod.rs"]
mod support;

use questlink::channel::{ChannelEvent, ChannelManager, ChannelState, CloseInfo, ConnectionStatus};
use questlink::events::Subscription;
use questlink::transport::ErrorKind;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::mocks::ConnectScript;
use support::{harness, test_config};
use tokio::time::{sleep, Instant};

type Events = Arc<Mutex<Vec<ChannelEvent>>>;

fn record(channel: &ChannelManager) -> (Events, Subscription) {
    let events: Events = Arc::default();
    let sink = events.clone();
    let subscription = channel.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
    (events, subscription)
}

fn reconnect_delays(events: &Events) -> Vec<Duration> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            ChannelEvent::Reconnect { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect()
}

fn errors(events: &Events) -> Vec<(String, bool)> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            ChannelEvent::Error { message, fatal, .. } => Some((message.clone(), *fatal)),
            _ => None,
        })
        .collect()
}

fn secs(values: &[u64]) -> Vec<Duration> {
    values.iter().copied().map(Duration::from_secs).collect()
}

#[tokio::test(start_paused = true)]
async fn connect_authenticates_and_handshakes() {
    let h = harness(test_config());
    let channel = h.access.channel().clone();
    let (events, _subscription) = record(&channel);

    channel.connect().await;
    sleep(Duration::from_millis(10)).await;

    assert_eq!(channel.state(), ChannelState::Connected);
    assert_eq!(h.connector.attempts()[0].url, "ws://primary.test/ws?token=test-token");
    assert!(events
        .lock()
        .unwrap()
        .contains(&ChannelEvent::Connection(ConnectionStatus::Connected)));

    assert!(channel.mark_notification_read("n-1"));
    assert!(channel.mark_notification_displayed("n-2"));
    sleep(Duration::from_millis(10)).await;

    let sent: Vec<Value> = h
        .connector
        .sent()
        .iter()
        .map(|text| serde_json::from_str(text).unwrap())
        .collect();
    assert_eq!(sent[0]["type"], "handshake");
    assert!(sent[0]["data"]["clientTime"].is_i64());
    assert_eq!(
        sent[1],
        json!({ "type": "mark_notification_read", "data": { "notificationId": "n-1" } })
    );
    assert_eq!(sent[2]["type"], "mark_notification_displayed");

    channel.connect().await;
    assert_eq!(h.connector.attempts().len(), 1, "connect while connected is a no-op");
}

#[tokio::test(start_paused = true)]
async fn send_requires_an_open_connection() {
    let h = harness(test_config());
    let channel = h.access.channel();
    assert_eq!(channel.state(), ChannelState::Disconnected);
    assert!(!channel.send("ping", Value::Null));
    assert!(!channel.mark_notification_read("n-1"));
}

#[tokio::test(start_paused = true)]
async fn short_lived_connections_use_longer_base_delay() {
    let h = harness(test_config());
    h.connector
        .set_fallback(ConnectScript::closes_after(Duration::from_millis(400), 1006, "abnormal"));
    let channel = h.access.channel().clone();
    let (events, _subscription) = record(&channel);

    channel.connect().await;
    sleep(Duration::from_secs(12)).await;

    let delays = reconnect_delays(&events);
    assert!(delays.len() >= 3);
    assert_eq!(delays[..3], secs(&[3, 3, 3])[..]);
    assert!(h.access.counters().snapshot().channel_connects >= 3);
}

#[tokio::test(start_paused = true)]
async fn connect_timeouts_back_off_exponentially_until_failed() {
    let h = harness(test_config());
    h.connector.set_fallback(ConnectScript::Hang);
    let channel = h.access.channel().clone();
    let (events, _subscription) = record(&channel);

    channel.connect().await;
    sleep(Duration::from_secs(450)).await;

    assert_eq!(
        reconnect_delays(&events),
        secs(&[1, 2, 4, 8, 16, 32, 60, 60, 60, 60])
    );
    assert_eq!(h.connector.attempts().len(), 11);
    assert_eq!(channel.state(), ChannelState::Failed);
    assert_eq!(
        errors(&events),
        vec![(
            "Max reconnection attempts reached. Please refresh the page.".to_string(),
            true
        )]
    );
    assert!(events.lock().unwrap().contains(&ChannelEvent::Error {
        message: "Max reconnection attempts reached. Please refresh the page.".to_string(),
        fatal: true,
        kind: Some(ErrorKind::ChannelFailed),
    }));
    assert!(events.lock().unwrap().contains(&ChannelEvent::Connection(
        ConnectionStatus::Disconnected {
            code: 4000,
            reason: "Connection timeout".to_string()
        }
    )));
    assert_eq!(h.access.counters().snapshot().channel_failures, 1);

    sleep(Duration::from_secs(600)).await;
    assert_eq!(h.connector.attempts().len(), 11, "failed channel stays down");

    h.connector.set_fallback(ConnectScript::stays_open());
    channel.connect().await;
    sleep(Duration::from_millis(10)).await;
    assert_eq!(channel.state(), ChannelState::Connected);
    assert_eq!(channel.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn normal_and_flagged_closes_do_not_reconnect() {
    let h = harness(test_config());
    h.connector
        .push(ConnectScript::closes_after(Duration::from_secs(2), 1000, "server shutdown"));
    let channel = h.access.channel().clone();
    let (events, _subscription) = record(&channel);

    channel.connect().await;
    sleep(Duration::from_secs(10)).await;
    assert_eq!(channel.state(), ChannelState::Disconnected);
    assert_eq!(h.connector.attempts().len(), 1);

    h.connector
        .push(ConnectScript::closes_after(Duration::from_secs(2), 4003, "banned; no-reconnect"));
    channel.connect().await;
    sleep(Duration::from_secs(10)).await;
    assert_eq!(channel.state(), ChannelState::Disconnected);
    assert_eq!(h.connector.attempts().len(), 2);
    assert!(reconnect_delays(&events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn repeated_instant_failures_are_treated_as_rejection() {
    let h = harness(test_config());
    h.connector
        .set_fallback(ConnectScript::Fail("handshake refused".to_string()));
    let channel = h.access.channel().clone();
    let (events, _subscription) = record(&channel);

    channel.connect().await;
    sleep(Duration::from_secs(60)).await;

    assert_eq!(reconnect_delays(&events), secs(&[3, 6, 12]));
    assert_eq!(h.connector.attempts().len(), 4);
    assert_eq!(channel.state(), ChannelState::Disconnected);
    let errors = errors(&events);
    assert_eq!(errors.len(), 1);
    assert!(!errors[0].1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_closes_with_normal_code() {
    let h = harness(test_config());
    let channel = h.access.channel().clone();
    let (events, _subscription) = record(&channel);

    channel.connect().await;
    sleep(Duration::from_millis(10)).await;
    channel.disconnect();
    sleep(Duration::from_millis(10)).await;

    assert_eq!(channel.state(), ChannelState::Disconnected);
    assert_eq!(
        h.connector.client_closes(),
        vec![CloseInfo::new(1000, "User disconnected")]
    );
    assert!(events.lock().unwrap().contains(&ChannelEvent::Connection(
        ConnectionStatus::Disconnected {
            code: 1000,
            reason: "User disconnected".to_string()
        }
    )));

    sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connector.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_is_refused_offline_or_without_token() {
    let h = harness(test_config());
    let channel = h.access.channel().clone();
    let (events, _subscription) = record(&channel);

    h.access.monitor().set_device_online(false);
    channel.connect().await;
    assert!(events
        .lock()
        .unwrap()
        .contains(&ChannelEvent::Connection(ConnectionStatus::Offline)));

    h.access.monitor().set_device_online(true);
    h.auth.clear_token();
    channel.connect().await;
    assert_eq!(
        errors(&events),
        vec![("Authentication token not available".to_string(), false)]
    );
    assert!(h.connector.attempts().is_empty());
    assert_eq!(channel.state(), ChannelState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn coming_back_online_skips_the_remaining_backoff() {
    let h = harness(test_config());
    h.connector
        .push(ConnectScript::closes_after(Duration::from_secs(5), 1006, "abnormal"));
    h.connector
        .set_fallback(ConnectScript::Fail("refused".to_string()));
    let channel = h.access.channel().clone();
    let (events, _subscription) = record(&channel);
    channel.spawn_network_watch();

    let started = Instant::now();
    channel.connect().await;
    sleep(Duration::from_secs(7)).await;
    assert_eq!(h.connector.attempts().len(), 2);
    assert_eq!(channel.state(), ChannelState::Reconnecting);
    assert_eq!(reconnect_delays(&events), secs(&[1, 6]));

    h.access.monitor().set_device_online(false);
    sleep(Duration::from_millis(10)).await;
    h.access.monitor().set_device_online(true);
    sleep(Duration::from_millis(10)).await;

    let attempts = h.connector.attempts();
    assert_eq!(attempts.len(), 3);
    assert!(attempts[2].at - started < Duration::from_secs(8));

    let network: Vec<bool> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            ChannelEvent::Network { online } => Some(*online),
            _ => None,
        })
        .collect();
    assert_eq!(network, vec![false, true]);
}

#[tokio::test(start_paused = true)]
async fn online_during_first_backoff_reconnects_immediately() {
    let h = harness(test_config());
    h.connector
        .push(ConnectScript::closes_after(Duration::from_millis(400), 1006, "abnormal"));
    let channel = h.access.channel().clone();
    let (events, _subscription) = record(&channel);
    channel.spawn_network_watch();

    channel.connect().await;
    sleep(Duration::from_millis(450)).await;
    assert_eq!(channel.state(), ChannelState::Reconnecting);
    assert_eq!(channel.attempts(), 0);
    assert_eq!(reconnect_delays(&events), secs(&[3]));

    h.access.monitor().set_device_online(false);
    sleep(Duration::from_millis(10)).await;
    let back_online = Instant::now();
    h.access.monitor().set_device_online(true);
    sleep(Duration::from_millis(20)).await;

    let attempts = h.connector.attempts();
    assert_eq!(attempts.len(), 2);
    assert!(attempts[1].at - back_online < Duration::from_millis(20));
    assert_eq!(channel.state(), ChannelState::Connected);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(h.connector.attempts().len(), 2, "cancelled backoff timer does not fire");
}

#[tokio::test(start_paused = true)]
async fn server_frames_are_dispatched_by_type() {
    let h = harness(test_config());
    h.connector.push(ConnectScript::Open {
        inbound: vec![
            r#"{"type":"quest_completed","data":{"questId":7}}"#.to_string(),
            "definitely not json".to_string(),
            r#"{"type":"notification","data":{"title":"Level up"}}"#.to_string(),
        ],
        close_after: None,
        close: CloseInfo::new(1000, ""),
    });
    let channel = h.access.channel().clone();
    let received: Arc<Mutex<Vec<Value>>> = Arc::default();
    let _subscription = {
        let received = received.clone();
        channel.subscribe_topic("quest_completed", move |event| {
            if let ChannelEvent::Message { data, .. } = event {
                received.lock().unwrap().push(data.clone());
            }
        })
    };

    channel.connect().await;
    sleep(Duration::from_millis(10)).await;

    assert_eq!(*received.lock().unwrap(), vec![json!({ "questId": 7 })]);
    assert_eq!(channel.state(), ChannelState::Connected);
}

#[tokio::test(start_paused = true)]
async fn panicking_listener_does_not_starve_others() {
    let h = harness(test_config());
    let channel = h.access.channel().clone();
    let _faulty = channel.subscribe_topic("connection", |_| panic!("listener bug"));
    let (events, _subscription) = record(&channel);

    channel.connect().await;
    sleep(Duration::from_millis(10)).await;

    assert!(events
        .lock()
        .unwrap()
        .contains(&ChannelEvent::Connection(ConnectionStatus::Connected)));
}

#[tokio::test(start_paused = true)]
async fn keep_alive_pings_while_connected() {
    let h = harness(test_config());
    let channel = h.access.channel().clone();

    channel.connect().await;
    sleep(Duration::from_secs(61)).await;

    let pings = h
        .connector
        .sent()
        .iter()
        .filter_map(|text| serde_json::from_str::<Value>(text).ok())
        .filter(|frame| frame["type"] == "ping" && frame["timestamp"].is_i64())
        .count();
    assert_eq!(pings, 2);
}
