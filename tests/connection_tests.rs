#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Integration tests for `RtaConnection`.
//!
//! Each test plays the service through the `ServerEnd` handed out by
//! `MockConnector`: it reads the client's frames, answers them, and drops the
//! socket to force reconnects.

mod common;

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rta_client::{
    ActivationLimiter, HandlerDispatch, RtaConnection, RtaConnectionState, RtaError, RtaEvent,
    Subscription, SubscriptionError, SubscriptionHandler, SubscriptionState,
    DEFAULT_MAX_CONNECTIONS_PER_USER,
};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_test::assert_ok;

use common::{accept, eventually, new_connection, test_config, MockConnector, RecordingHandler};

use SubscriptionState::{Closed, PendingSubscribe, PendingUnsubscribe, Subscribed};

// ════════════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════════════

async fn wait_for_event(rx: &mut broadcast::Receiver<RtaEvent>, expected: RtaEvent) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if event == expected => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {expected:?}"));
}

// ════════════════════════════════════════════════════════════════════
// Subscribe / event flow
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn subscribe_ack_delivers_initial_payload_then_events() {
    let (connector, mut accepted) = MockConnector::new();
    let connection = new_connection(
        "100",
        connector,
        Arc::new(ActivationLimiter::default()),
        test_config(),
    );
    assert_ok!(connection.activate());
    let mut server = accept(&mut accepted).await;

    let handler = RecordingHandler::new();
    let sub = Subscription::new("stats/Stat", handler.clone());
    assert_ok!(connection.add_subscription(&sub));
    assert_eq!(sub.state(), PendingSubscribe);

    let (seq, uri) = server.expect_subscribe().await;
    assert_eq!(seq, 1);
    assert_eq!(uri, "stats/Stat");

    server.push_raw(r#"[1,1,0,42,{"value":"31"}]"#);
    eventually(|| handler.payloads().len() == 1).await;
    assert_eq!(sub.state(), Subscribed);
    assert_eq!(sub.subscription_id(), Some(42));
    assert_eq!(handler.payloads()[0], json!({"value": "31"}));

    server.push_raw(r#"[3,42,{"value":"32"}]"#);
    eventually(|| handler.payloads().len() == 2).await;
    assert_eq!(handler.payloads()[1], json!({"value": "32"}));
    assert_eq!(handler.states(), vec![PendingSubscribe, Subscribed]);
}

#[tokio::test]
async fn rejected_subscribe_closes_and_notifies() {
    let (connector, mut accepted) = MockConnector::new();
    let connection = new_connection(
        "100",
        connector,
        Arc::new(ActivationLimiter::default()),
        test_config(),
    );
    let mut events = connection.events();
    assert_ok!(connection.activate());
    let mut server = accept(&mut accepted).await;

    let handler = RecordingHandler::new();
    let sub = Subscription::new("stats/Stat", handler.clone());
    assert_ok!(connection.add_subscription(&sub));
    let (seq, _) = server.expect_subscribe().await;
    server.push_raw(format!(r#"[1,{seq},1,"error"]"#));

    wait_for_event(
        &mut events,
        RtaEvent::SubscriptionError {
            resource_uri: "stats/Stat".into(),
            error: SubscriptionError::TooManySubscriptions,
        },
    )
    .await;
    assert_eq!(sub.state(), Closed);
    assert_eq!(handler.states(), vec![PendingSubscribe, Closed]);
    assert_eq!(
        *handler.errors.lock(),
        vec![SubscriptionError::TooManySubscriptions]
    );
    assert_eq!(connection.subscription_count(), 0);
}

#[tokio::test]
async fn access_denied_and_generic_statuses_are_classified() {
    let (connector, mut accepted) = MockConnector::new();
    let connection = new_connection(
        "100",
        connector,
        Arc::new(ActivationLimiter::default()),
        test_config(),
    );
    assert_ok!(connection.activate());
    let mut server = accept(&mut accepted).await;

    let denied = RecordingHandler::new();
    let other = RecordingHandler::new();
    let a = Subscription::new("a", denied.clone());
    let b = Subscription::new("b", other.clone());
    assert_ok!(connection.add_subscription(&a));
    assert_ok!(connection.add_subscription(&b));
    let (seq_a, _) = server.expect_subscribe().await;
    let (seq_b, _) = server.expect_subscribe().await;
    server.reject_subscribe(seq_a, 2);
    server.reject_subscribe(seq_b, 77);

    eventually(|| a.state() == Closed && b.state() == Closed).await;
    assert_eq!(*denied.errors.lock(), vec![SubscriptionError::AccessDenied]);
    assert_eq!(*other.errors.lock(), vec![SubscriptionError::Generic(77)]);
}

#[tokio::test]
async fn success_ack_without_subscription_id_fails_the_subscribe() {
    let (connector, mut accepted) = MockConnector::new();
    let connection = new_connection(
        "100",
        connector,
        Arc::new(ActivationLimiter::default()),
        test_config(),
    );
    assert_ok!(connection.activate());
    let mut server = accept(&mut accepted).await;

    let handler = RecordingHandler::new();
    let sub = Subscription::new("stats/Stat", handler.clone());
    assert_ok!(connection.add_subscription(&sub));
    let (seq, _) = server.expect_subscribe().await;
    server.push_raw(format!("[1,{seq},0]"));

    eventually(|| sub.state() == Closed).await;
    assert_eq!(handler.states(), vec![PendingSubscribe, Closed]);
    assert_eq!(*handler.errors.lock(), vec![SubscriptionError::Generic(0)]);
    assert!(handler.payloads().is_empty());
    assert_eq!(connection.subscription_count(), 0);
}

#[tokio::test]
async fn malformed_frames_and_unknown_ids_are_dropped() {
    let (connector, mut accepted) = MockConnector::new();
    let connection = new_connection(
        "100",
        connector,
        Arc::new(ActivationLimiter::default()),
        test_config(),
    );
    assert_ok!(connection.activate());
    let mut server = accept(&mut accepted).await;

    let handler = RecordingHandler::new();
    let sub = Subscription::new("stats/Stat", handler.clone());
    assert_ok!(connection.add_subscription(&sub));
    let (seq, _) = server.expect_subscribe().await;

    server.push_raw("not json");
    server.push_raw("[99]");
    server.push_raw(r#"{"op":1}"#);
    server.event(12345, json!({"value": "stray"}));
    server.ack_subscribe(seq, 5, json!({"value": "1"}));

    eventually(|| sub.state() == Subscribed).await;
    assert_eq!(handler.payloads(), vec![json!({"value": "1"})]);
    assert_eq!(connection.state(), RtaConnectionState::Connected);
}

#[tokio::test]
async fn resync_is_broadcast_without_touching_subscriptions() {
    let (connector, mut accepted) = MockConnector::new();
    let connection = new_connection(
        "100",
        connector,
        Arc::new(ActivationLimiter::default()),
        test_config(),
    );
    let mut first = connection.events();
    let mut second = connection.events();
    assert_ok!(connection.activate());
    let mut server = accept(&mut accepted).await;

    let handler = RecordingHandler::new();
    let sub = Subscription::new("stats/Stat", handler.clone());
    assert_ok!(connection.add_subscription(&sub));
    let (seq, _) = server.expect_subscribe().await;
    server.ack_subscribe(seq, 9, json!(null));
    server.push_raw("[4]");

    wait_for_event(&mut first, RtaEvent::Resync).await;
    wait_for_event(&mut second, RtaEvent::Resync).await;
    assert_eq!(handler.states(), vec![PendingSubscribe, Subscribed]);
}

// ════════════════════════════════════════════════════════════════════
// Argument and lifecycle errors
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn invalid_subscriptions_are_rejected() {
    let (connector, _accepted) = MockConnector::new();
    let connection = new_connection(
        "100",
        connector,
        Arc::new(ActivationLimiter::default()),
        test_config(),
    );
    assert_ok!(connection.activate());

    let empty = Subscription::new("", RecordingHandler::new());
    assert!(matches!(
        connection.add_subscription(&empty),
        Err(RtaError::InvalidArgument(_))
    ));
    assert!(matches!(
        connection.remove_subscription(&empty),
        Err(RtaError::InvalidArgument(_))
    ));

    let sub = Subscription::new("stats/Stat", RecordingHandler::new());
    assert_ok!(connection.add_subscription(&sub));
    assert!(matches!(
        connection.add_subscription(&sub),
        Err(RtaError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn activation_reports_state_changes() {
    let (connector, mut accepted) = MockConnector::new();
    let connection = new_connection(
        "100",
        connector,
        Arc::new(ActivationLimiter::default()),
        test_config(),
    );
    let mut events = connection.events();
    assert_eq!(connection.state(), RtaConnectionState::Disconnected);

    assert_ok!(connection.activate());
    let _server = accept(&mut accepted).await;
    assert_eq!(
        events.recv().await.unwrap(),
        RtaEvent::StateChanged(RtaConnectionState::Connecting)
    );
    assert_eq!(
        events.recv().await.unwrap(),
        RtaEvent::StateChanged(RtaConnectionState::Connected)
    );

    connection.deactivate();
    assert_eq!(
        events.recv().await.unwrap(),
        RtaEvent::StateChanged(RtaConnectionState::Disconnected)
    );
}

// ════════════════════════════════════════════════════════════════════
// Removal
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn remove_subscribed_waits_for_unsubscribe_ack() {
    let (connector, mut accepted) = MockConnector::new();
    let connection = new_connection(
        "100",
        connector,
        Arc::new(ActivationLimiter::default()),
        test_config(),
    );
    assert_ok!(connection.activate());
    let mut server = accept(&mut accepted).await;

    let handler = RecordingHandler::new();
    let sub = Subscription::new("stats/Stat", handler.clone());
    assert_ok!(connection.add_subscription(&sub));
    let (seq, _) = server.expect_subscribe().await;
    server.ack_subscribe(seq, 42, json!({"value": "1"}));
    eventually(|| sub.state() == Subscribed).await;

    assert_ok!(connection.remove_subscription(&sub));
    assert_eq!(sub.state(), PendingUnsubscribe);
    let (unsubscribe_seq, id) = server.expect_unsubscribe().await;
    assert_eq!(id, 42);
    assert!(unsubscribe_seq > seq);

    // Still pending: a second remove sends nothing.
    assert_ok!(connection.remove_subscription(&sub));
    server.event(42, json!({"value": "late"}));
    server.ack_unsubscribe(unsubscribe_seq);

    eventually(|| sub.state() == Closed).await;
    assert_eq!(
        handler.states(),
        vec![PendingSubscribe, Subscribed, PendingUnsubscribe, Closed]
    );
    assert!(server.try_next_frame().is_none());
    assert_eq!(connection.subscription_count(), 0);
}

#[tokio::test]
async fn remove_twice_while_pending_closes_once() {
    let (connector, mut accepted) = MockConnector::new();
    let connection = new_connection(
        "100",
        connector,
        Arc::new(ActivationLimiter::default()),
        test_config(),
    );
    assert_ok!(connection.activate());
    let mut server = accept(&mut accepted).await;

    let handler = RecordingHandler::new();
    let sub = Subscription::new("stats/Stat", handler.clone());
    assert_ok!(connection.add_subscription(&sub));
    let (seq, _) = server.expect_subscribe().await;

    assert_ok!(connection.remove_subscription(&sub));
    assert_ok!(connection.remove_subscription(&sub));
    assert_eq!(handler.states(), vec![PendingSubscribe, Closed]);

    // The service still acknowledges the in-flight request; the client
    // cleans up the orphan with exactly one unsubscribe.
    server.ack_subscribe(seq, 8, json!({"value": "ignored"}));
    let (_, id) = server.expect_unsubscribe().await;
    assert_eq!(id, 8);
    assert!(handler.payloads().is_empty());
    assert_eq!(handler.states(), vec![PendingSubscribe, Closed]);
}

#[tokio::test]
async fn remove_while_queued_never_reaches_the_wire() {
    let (connector, mut accepted) = MockConnector::new();
    connector.set_refusing(true);
    let connection = new_connection(
        "100",
        Arc::clone(&connector),
        Arc::new(ActivationLimiter::default()),
        test_config(),
    );
    assert_ok!(connection.activate());

    let handler = RecordingHandler::new();
    let sub = Subscription::new("stats/Stat", handler.clone());
    assert_ok!(connection.add_subscription(&sub));
    assert_ok!(connection.remove_subscription(&sub));
    assert_ok!(connection.remove_subscription(&sub));
    assert_eq!(handler.states(), vec![PendingSubscribe, Closed]);

    connector.set_refusing(false);
    let mut server = accept(&mut accepted).await;
    eventually(|| connection.state() == RtaConnectionState::Connected).await;
    tokio::task::yield_now().await;
    assert!(server.try_next_frame().is_none());
}

// ════════════════════════════════════════════════════════════════════
// Reconnect
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn repeated_reconnects_neither_lose_nor_duplicate_subscriptions() {
    let (connector, mut accepted) = MockConnector::new();
    let connection = new_connection(
        "100",
        connector,
        Arc::new(ActivationLimiter::default()),
        test_config(),
    );
    assert_ok!(connection.activate());
    let mut server = accept(&mut accepted).await;

    let live = RecordingHandler::new();
    let pending = RecordingHandler::new();
    let a = Subscription::new("stats/A", live.clone());
    let b = Subscription::new("stats/B", pending.clone());
    assert_ok!(connection.add_subscription(&a));
    assert_ok!(connection.add_subscription(&b));
    let (seq_a, _) = server.expect_subscribe().await;
    let _ = server.expect_subscribe().await;
    server.ack_subscribe(seq_a, 1, json!(null));
    eventually(|| a.state() == Subscribed).await;
    // `b` is still pending when the socket drops.

    let mut last_seq = seq_a;
    for cycle in 0..3u64 {
        drop(server);
        server = accept(&mut accepted).await;

        let (seq_1, uri_1) = server.expect_subscribe().await;
        let (seq_2, uri_2) = server.expect_subscribe().await;
        assert_eq!((uri_1.as_str(), uri_2.as_str()), ("stats/A", "stats/B"));
        assert!(seq_1 > last_seq && seq_2 > seq_1);
        last_seq = seq_2;

        let base = 100 * (cycle + 1);
        server.ack_subscribe(seq_1, base + 1, json!(null));
        server.ack_subscribe(seq_2, base + 2, json!(null));
        eventually(|| connection.live_subscription_count() == 2).await;
        assert_eq!(a.subscription_id(), Some(base + 1));
        assert_eq!(b.subscription_id(), Some(base + 2));
        assert!(server.try_next_frame().is_none());
    }

    assert_eq!(live.states(), vec![PendingSubscribe, Subscribed]);
    assert_eq!(pending.states(), vec![PendingSubscribe, Subscribed]);
    assert_eq!(connection.subscription_count(), 2);
}

#[tokio::test]
async fn resubscribes_go_out_before_newly_queued_subscriptions() {
    let (connector, mut accepted) = MockConnector::new();
    let connection = new_connection(
        "100",
        Arc::clone(&connector),
        Arc::new(ActivationLimiter::default()),
        test_config(),
    );
    assert_ok!(connection.activate());
    let mut server = accept(&mut accepted).await;

    let a = Subscription::new("stats/A", RecordingHandler::new());
    assert_ok!(connection.add_subscription(&a));
    let (seq, _) = server.expect_subscribe().await;
    server.ack_subscribe(seq, 1, json!(null));
    eventually(|| a.state() == Subscribed).await;

    connector.set_refusing(true);
    drop(server);
    eventually(|| connection.state() == RtaConnectionState::Connecting).await;

    let c = Subscription::new("stats/C", RecordingHandler::new());
    assert_ok!(connection.add_subscription(&c));
    assert_eq!(a.state(), Subscribed);

    connector.set_refusing(false);
    let mut server = accept(&mut accepted).await;
    let (_, first) = server.expect_subscribe().await;
    let (_, second) = server.expect_subscribe().await;
    assert_eq!(first, "stats/A");
    assert_eq!(second, "stats/C");
}

#[tokio::test]
async fn event_ids_from_an_old_socket_are_not_reused() {
    let (connector, mut accepted) = MockConnector::new();
    let connection = new_connection(
        "100",
        connector,
        Arc::new(ActivationLimiter::default()),
        test_config(),
    );
    assert_ok!(connection.activate());
    let mut server = accept(&mut accepted).await;

    let handler = RecordingHandler::new();
    let sub = Subscription::new("stats/A", handler.clone());
    assert_ok!(connection.add_subscription(&sub));
    let (seq, _) = server.expect_subscribe().await;
    server.ack_subscribe(seq, 1, json!("first"));
    eventually(|| handler.payloads().len() == 1).await;

    drop(server);
    let mut server = accept(&mut accepted).await;
    let (seq, _) = server.expect_subscribe().await;
    server.event(1, json!("stale id"));
    server.ack_subscribe(seq, 2, json!("second"));
    server.event(2, json!("update"));

    eventually(|| handler.payloads().len() == 3).await;
    assert_eq!(
        handler.payloads(),
        vec![json!("first"), json!("second"), json!("update")]
    );
}

#[tokio::test]
async fn rejected_resubscribe_after_reconnect_closes_through_unsubscribe() {
    let (connector, mut accepted) = MockConnector::new();
    let connection = new_connection(
        "100",
        connector,
        Arc::new(ActivationLimiter::default()),
        test_config(),
    );
    assert_ok!(connection.activate());
    let mut server = accept(&mut accepted).await;

    let handler = RecordingHandler::new();
    let sub = Subscription::new("stats/A", handler.clone());
    assert_ok!(connection.add_subscription(&sub));
    let (seq, _) = server.expect_subscribe().await;
    server.ack_subscribe(seq, 1, json!(null));
    eventually(|| sub.state() == Subscribed).await;

    drop(server);
    let mut server = accept(&mut accepted).await;
    let (seq, uri) = server.expect_subscribe().await;
    assert_eq!(uri, "stats/A");
    server.reject_subscribe(seq, 4);

    eventually(|| sub.state() == Closed).await;
    assert_eq!(
        handler.states(),
        vec![PendingSubscribe, Subscribed, PendingUnsubscribe, Closed]
    );
    assert_eq!(*handler.errors.lock(), vec![SubscriptionError::Generic(4)]);
    assert_eq!(sub.subscription_id(), None);
    assert_eq!(connection.subscription_count(), 0);
}

#[tokio::test]
async fn unsubscribe_in_flight_closes_when_the_socket_drops() {
    let (connector, mut accepted) = MockConnector::new();
    let connection = new_connection(
        "100",
        connector,
        Arc::new(ActivationLimiter::default()),
        test_config(),
    );
    assert_ok!(connection.activate());
    let mut server = accept(&mut accepted).await;

    let handler = RecordingHandler::new();
    let sub = Subscription::new("stats/A", handler.clone());
    assert_ok!(connection.add_subscription(&sub));
    let (seq, _) = server.expect_subscribe().await;
    server.ack_subscribe(seq, 1, json!(null));
    eventually(|| sub.state() == Subscribed).await;

    assert_ok!(connection.remove_subscription(&sub));
    assert_eq!(sub.state(), PendingUnsubscribe);
    let (_, id) = server.expect_unsubscribe().await;
    assert_eq!(id, 1);

    drop(server);
    let mut server = accept(&mut accepted).await;
    eventually(|| sub.state() == Closed).await;
    eventually(|| connection.state() == RtaConnectionState::Connected).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(server.try_next_frame().is_none());
    assert_eq!(
        handler.states(),
        vec![PendingSubscribe, Subscribed, PendingUnsubscribe, Closed]
    );
    assert_eq!(connection.subscription_count(), 0);
}

/// Removes its own subscription when it sees a `"leave"` payload.
#[derive(Default)]
struct LeavesOnRequest {
    connection: OnceLock<Weak<RtaConnection>>,
    subscription: OnceLock<Weak<Subscription>>,
    states: Mutex<Vec<SubscriptionState>>,
}

impl SubscriptionHandler for LeavesOnRequest {
    fn on_event_received(&self, payload: &Value) {
        if payload != &json!("leave") {
            return;
        }
        let connection = self.connection.get().and_then(Weak::upgrade);
        let subscription = self.subscription.get().and_then(Weak::upgrade);
        if let (Some(connection), Some(subscription)) = (connection, subscription) {
            connection.remove_subscription(&subscription).unwrap();
        }
    }

    fn on_state_changed(&self, state: SubscriptionState) {
        self.states.lock().push(state);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_may_remove_its_own_subscription() {
    let (connector, mut accepted) = MockConnector::new();
    let connection = Arc::new(new_connection(
        "100",
        connector,
        Arc::new(ActivationLimiter::default()),
        test_config(),
    ));
    assert_ok!(connection.activate());
    let mut server = accept(&mut accepted).await;

    let handler = Arc::new(LeavesOnRequest::default());
    let sub = Subscription::new("stats/A", handler.clone());
    let _ = handler.connection.set(Arc::downgrade(&connection));
    let _ = handler.subscription.set(Arc::downgrade(&sub));
    assert_ok!(connection.add_subscription(&sub));
    let (seq, _) = server.expect_subscribe().await;
    server.ack_subscribe(seq, 1, json!(null));
    eventually(|| sub.state() == Subscribed).await;

    server.event(1, json!("leave"));
    let (seq, id) = server.expect_unsubscribe().await;
    assert_eq!(id, 1);
    assert_eq!(sub.state(), PendingUnsubscribe);

    server.ack_unsubscribe(seq);
    eventually(|| handler.states.lock().len() == 4).await;
    assert_eq!(
        *handler.states.lock(),
        vec![PendingSubscribe, Subscribed, PendingUnsubscribe, Closed]
    );
    assert_eq!(connection.subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn reconnect_window_elapsing_closes_everything() {
    let (connector, mut accepted) = MockConnector::new();
    let connection = new_connection(
        "100",
        Arc::clone(&connector),
        Arc::new(ActivationLimiter::default()),
        test_config(),
    );
    let mut events = connection.events();
    assert_ok!(connection.activate());
    let mut server = accept(&mut accepted).await;

    let subscribed = RecordingHandler::new();
    let pending = RecordingHandler::new();
    let a = Subscription::new("stats/A", subscribed.clone());
    let b = Subscription::new("stats/B", pending.clone());
    assert_ok!(connection.add_subscription(&a));
    assert_ok!(connection.add_subscription(&b));
    let (seq, _) = server.expect_subscribe().await;
    let _ = server.expect_subscribe().await;
    server.ack_subscribe(seq, 1, json!(null));
    eventually(|| a.state() == Subscribed).await;

    connector.set_refusing(true);
    drop(server);

    wait_for_event(&mut events, RtaEvent::ConnectionLost).await;
    wait_for_event(
        &mut events,
        RtaEvent::StateChanged(RtaConnectionState::Disconnected),
    )
    .await;
    assert_eq!(
        subscribed.states(),
        vec![PendingSubscribe, Subscribed, PendingUnsubscribe, Closed]
    );
    assert_eq!(pending.states(), vec![PendingSubscribe, Closed]);
    assert_eq!(connection.subscription_count(), 0);
    assert!(connector.attempts() > 2);

    // Still activated: a new subscription starts connecting again.
    assert!(connection.is_activated());
    connector.set_refusing(false);
    let c = Subscription::new("stats/C", RecordingHandler::new());
    assert_ok!(connection.add_subscription(&c));
    let mut server = accept(&mut accepted).await;
    assert_eq!(server.expect_subscribe().await.1, "stats/C");
}

#[tokio::test(start_paused = true)]
async fn connections_are_recycled_after_their_lifetime() {
    let (connector, mut accepted) = MockConnector::new();
    let config = test_config().with_max_connection_lifetime(Duration::from_secs(1));
    let connection = new_connection(
        "100",
        connector,
        Arc::new(ActivationLimiter::default()),
        config,
    );
    assert_ok!(connection.activate());
    let mut server = accept(&mut accepted).await;

    let handler = RecordingHandler::new();
    let sub = Subscription::new("stats/A", handler.clone());
    assert_ok!(connection.add_subscription(&sub));
    let (seq, _) = server.expect_subscribe().await;
    server.ack_subscribe(seq, 1, json!(null));
    eventually(|| sub.state() == Subscribed).await;

    let mut next = accept(&mut accepted).await;
    assert!(server.client_closed());
    let (_, uri) = next.expect_subscribe().await;
    assert_eq!(uri, "stats/A");
    assert_eq!(handler.states(), vec![PendingSubscribe, Subscribed]);
}

#[tokio::test(start_paused = true)]
async fn transient_status_is_retried() {
    let (connector, mut accepted) = MockConnector::new();
    let connection = new_connection(
        "100",
        connector,
        Arc::new(ActivationLimiter::default()),
        test_config(),
    );
    assert_ok!(connection.activate());
    let mut server = accept(&mut accepted).await;

    let handler = RecordingHandler::new();
    let sub = Subscription::new("stats/A", handler.clone());
    assert_ok!(connection.add_subscription(&sub));
    let (first, _) = server.expect_subscribe().await;
    server.reject_subscribe(first, 1001);

    let started = tokio::time::Instant::now();
    let (second, uri) = server.expect_subscribe().await;
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(second > first);
    assert_eq!(uri, "stats/A");
    assert_eq!(sub.state(), PendingSubscribe);

    server.ack_subscribe(second, 3, json!({"value": "ok"}));
    eventually(|| sub.state() == Subscribed).await;
    assert_eq!(handler.states(), vec![PendingSubscribe, Subscribed]);
    assert!(handler.errors.lock().is_empty());
}

// ════════════════════════════════════════════════════════════════════
// Deactivation and activation cap
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn deactivate_closes_locally_and_releases_the_slot() {
    let (connector, mut accepted) = MockConnector::new();
    let limiter = Arc::new(ActivationLimiter::default());
    let connection = new_connection("100", connector, Arc::clone(&limiter), test_config());
    assert_ok!(connection.activate());
    assert_ok!(connection.activate());
    assert_eq!(limiter.slots_in_use("100"), 1);
    let mut server = accept(&mut accepted).await;

    let subscribed = RecordingHandler::new();
    let pending = RecordingHandler::new();
    let a = Subscription::new("stats/A", subscribed.clone());
    let b = Subscription::new("stats/B", pending.clone());
    assert_ok!(connection.add_subscription(&a));
    assert_ok!(connection.add_subscription(&b));
    let (seq, _) = server.expect_subscribe().await;
    let _ = server.expect_subscribe().await;
    server.ack_subscribe(seq, 1, json!(null));
    eventually(|| a.state() == Subscribed).await;

    connection.deactivate();
    assert_eq!(limiter.slots_in_use("100"), 0);
    assert!(!connection.is_activated());
    assert_eq!(connection.state(), RtaConnectionState::Disconnected);
    assert_eq!(
        subscribed.states(),
        vec![PendingSubscribe, Subscribed, PendingUnsubscribe, Closed]
    );
    assert_eq!(pending.states(), vec![PendingSubscribe, Closed]);
    eventually(|| server.client_closed()).await;

    // Deactivating again is harmless.
    connection.deactivate();
    assert_eq!(limiter.slots_in_use("100"), 0);
}

#[tokio::test]
async fn dropping_a_connection_releases_its_slot() {
    let (connector, _accepted) = MockConnector::new();
    let limiter = Arc::new(ActivationLimiter::default());
    let handler = RecordingHandler::new();
    let sub = Subscription::new("stats/A", handler.clone());
    {
        let connection =
            new_connection("100", connector, Arc::clone(&limiter), test_config());
        assert_ok!(connection.activate());
        assert_ok!(connection.add_subscription(&sub));
        assert_eq!(limiter.slots_in_use("100"), 1);
    }
    assert_eq!(limiter.slots_in_use("100"), 0);
    assert_eq!(handler.states(), vec![PendingSubscribe, Closed]);
}

#[tokio::test]
async fn activation_cap_applies_per_user() {
    let (connector, _accepted) = MockConnector::new();
    let limiter = Arc::new(ActivationLimiter::default());

    let connections: Vec<_> = (0..DEFAULT_MAX_CONNECTIONS_PER_USER)
        .map(|_| {
            let c = new_connection(
                "100",
                Arc::clone(&connector),
                Arc::clone(&limiter),
                test_config(),
            );
            assert_ok!(c.activate());
            c
        })
        .collect();

    let extra = new_connection(
        "100",
        Arc::clone(&connector),
        Arc::clone(&limiter),
        test_config(),
    );
    assert!(matches!(
        extra.activate(),
        Err(RtaError::LimitExceeded { max: 5, .. })
    ));
    assert!(!extra.is_activated());
    assert_eq!(limiter.slots_in_use("100"), DEFAULT_MAX_CONNECTIONS_PER_USER);

    let other_user = new_connection("200", Arc::clone(&connector), Arc::clone(&limiter), test_config());
    assert_ok!(other_user.activate());

    connections[0].deactivate();
    assert_ok!(extra.activate());
    assert_eq!(limiter.slots_in_use("100"), DEFAULT_MAX_CONNECTIONS_PER_USER);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_activations_never_exceed_the_cap() {
    let (connector, _accepted) = MockConnector::new();
    let limiter = Arc::new(ActivationLimiter::default());
    let extra = 4;

    let tasks: Vec<_> = (0..DEFAULT_MAX_CONNECTIONS_PER_USER + extra)
        .map(|_| {
            let connector = Arc::clone(&connector);
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                let connection = new_connection("100", connector, limiter, test_config());
                let result = connection.activate();
                (connection, result)
            })
        })
        .collect();

    let mut held = Vec::new();
    let mut rejected = 0;
    for task in tasks {
        let (connection, result) = task.await.unwrap();
        match result {
            Ok(()) => held.push(connection),
            Err(RtaError::LimitExceeded { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(held.len(), DEFAULT_MAX_CONNECTIONS_PER_USER);
    assert_eq!(rejected, extra);
    assert_eq!(limiter.slots_in_use("100"), DEFAULT_MAX_CONNECTIONS_PER_USER);

    let deactivations: Vec<_> = held
        .into_iter()
        .map(|connection| tokio::spawn(async move { connection.deactivate() }))
        .collect();
    for task in deactivations {
        task.await.unwrap();
    }
    assert_eq!(limiter.slots_in_use("100"), 0);
    assert_eq!(limiter.tracked_users(), 0);
}

// ════════════════════════════════════════════════════════════════════
// Handler dispatch
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn dedicated_dispatch_preserves_callback_order() {
    let (connector, mut accepted) = MockConnector::new();
    let config = test_config().with_handler_dispatch(HandlerDispatch::Dedicated);
    let connection = new_connection(
        "100",
        connector,
        Arc::new(ActivationLimiter::default()),
        config,
    );
    assert_ok!(connection.activate());
    let mut server = accept(&mut accepted).await;

    let handler = RecordingHandler::new();
    let sub = Subscription::new("stats/A", handler.clone());
    assert_ok!(connection.add_subscription(&sub));
    let (seq, _) = server.expect_subscribe().await;
    server.ack_subscribe(seq, 1, json!(0));
    for i in 1..20 {
        server.event(1, json!(i));
    }

    eventually(|| handler.payloads().len() == 20).await;
    let expected: Vec<_> = (0..20).map(|i| json!(i)).collect();
    assert_eq!(handler.payloads(), expected);
    assert_eq!(handler.states(), vec![PendingSubscribe, Subscribed]);
}
