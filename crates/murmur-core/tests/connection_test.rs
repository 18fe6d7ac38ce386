//! Connection manager lifecycle under scripted transport failures.
//!
//! All tests run on tokio's paused clock, so backoff delays are exact and
//! the suite does not sleep for real.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use murmur_core::{
    ConnectionConfig, ConnectionManager, ConnectionState, PublishOutcome, RealtimeMetrics,
    StateTransition, SyncError, SystemEnv, TransportError,
};
use murmur_harness::{SimTransport, TransitionRecorder, init_test_tracing};
use murmur_proto::{Broadcast, ConversationId, EventKind, ReadReceiptEvent, TypingStatus};
use tokio::time::{Instant, sleep};

fn manager(transport: &SimTransport) -> ConnectionManager<SystemEnv> {
    init_test_tracing();
    ConnectionManager::new(
        SystemEnv,
        Arc::new(transport.clone()),
        ConnectionConfig::default(),
        Arc::new(RealtimeMetrics::default()),
    )
}

fn network_down() -> TransportError {
    TransportError::Network("connection reset".into())
}

fn typing(user: &str, is_typing: bool) -> Broadcast {
    Broadcast::Typing(TypingStatus {
        user_id: user.into(),
        conversation_id: "c1".into(),
        is_typing,
        timestamp_ms: 1,
    })
}

fn receipt(user: &str, ids: &[&str]) -> Broadcast {
    Broadcast::ReadReceipt(ReadReceiptEvent {
        conversation_id: "c1".into(),
        user_id: user.into(),
        message_ids: ids.iter().map(|id| (*id).into()).collect(),
        timestamp_ms: 1,
    })
}

#[tokio::test(start_paused = true)]
async fn subscribe_is_idempotent() {
    let transport = SimTransport::new();
    let manager = manager(&transport);
    let c1 = ConversationId::from("c1");

    let first = manager.subscribe(&c1).await.unwrap();
    let second = manager.subscribe(&c1).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.name(), "chat:c1");
    assert_eq!(transport.subscribe_attempts(), 1);
    assert_eq!(transport.opened_channels(), 1);
    assert!(manager.is_subscribed(&c1));
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_until_polling_fallback() {
    let transport = SimTransport::new();
    transport.fail_all_subscribes(network_down());
    let manager = manager(&transport);
    let c1 = ConversationId::from("c1");
    let start = Instant::now();

    let result = manager.subscribe(&c1).await;
    assert!(matches!(result, Err(SyncError::Transport(TransportError::Network(_)))));
    assert_eq!(manager.state_of(&c1), ConnectionState::Error("Network error".into()));
    assert!(manager.is_reconnect_pending(&c1));

    sleep(Duration::from_secs(120)).await;

    let offsets: Vec<u64> = transport
        .subscribe_attempt_times()
        .iter()
        .map(|at| (*at - start).as_secs())
        .collect();
    assert_eq!(offsets, [0, 2, 6, 14, 30]);

    assert!(manager.is_using_polling_fallback(&c1));
    assert!(manager.is_any_using_polling_fallback());
    assert!(!manager.is_reconnect_pending(&c1));
    assert_eq!(manager.state_of(&c1), ConnectionState::Disconnected);
    assert_eq!(manager.reconnect_attempts(&c1), 5);

    let metrics = manager.metrics().snapshot();
    assert_eq!(metrics.polling_fallback_activations, 1);
    assert_eq!(metrics.failed_reconnections, 4);
}

#[tokio::test(start_paused = true)]
async fn explicit_reconnect_restarts_the_cycle() {
    let transport = SimTransport::new();
    transport.fail_all_subscribes(network_down());
    let manager = manager(&transport);
    let c1 = ConversationId::from("c1");

    let _ = manager.subscribe(&c1).await;
    sleep(Duration::from_secs(60)).await;
    assert!(manager.is_using_polling_fallback(&c1));

    // Still failing: the budget starts over from attempt zero
    let start = Instant::now();
    assert!(manager.reconnect(&c1).await.is_err());
    assert!(!manager.is_using_polling_fallback(&c1));
    assert_eq!(manager.reconnect_attempts(&c1), 1);

    sleep(Duration::from_secs(3)).await;
    let retried_at = transport.subscribe_attempt_times().last().copied().unwrap();
    assert_eq!((retried_at - start).as_secs(), 2);

    transport.heal();
    sleep(Duration::from_secs(4)).await;

    assert!(manager.is_subscribed(&c1));
    assert_eq!(manager.reconnect_attempts(&c1), 0);
    assert!(!manager.is_reconnect_pending(&c1));
}

#[tokio::test(start_paused = true)]
async fn reconnect_all_reports_successes() {
    let transport = SimTransport::new();
    let manager = manager(&transport);
    let c1 = ConversationId::from("c1");
    let c2 = ConversationId::from("c2");

    manager.subscribe(&c1).await.unwrap();
    manager.subscribe(&c2).await.unwrap();

    assert_eq!(manager.reconnect_all().await, 2);
    assert_eq!(transport.subscribe_attempts(), 4);
    assert_eq!(transport.live_channels(), 2);
    assert_eq!(manager.metrics().snapshot().successful_reconnections, 2);
}

#[tokio::test(start_paused = true)]
async fn fallback_queues_and_replays_coalesced() {
    let transport = SimTransport::new();
    transport.fail_all_subscribes(network_down());
    let manager = manager(&transport);
    let c1 = ConversationId::from("c1");

    let _ = manager.subscribe(&c1).await;
    sleep(Duration::from_secs(60)).await;
    let attempts = transport.subscribe_attempts();

    for broadcast in [
        typing("u1", true),
        receipt("u1", &["m1", "m2"]),
        typing("u1", false),
        receipt("u1", &["m2", "m3"]),
    ] {
        assert_eq!(manager.publish(&c1, broadcast).await.unwrap(), PublishOutcome::Queued);
    }

    assert_eq!(transport.subscribe_attempts(), attempts);
    assert!(transport.published().is_empty());
    assert_eq!(manager.queued_count(&c1), 3);
    assert_eq!(manager.metrics().snapshot().queued_events, 3);

    transport.heal();
    manager.reconnect(&c1).await.unwrap();

    assert_eq!(
        transport.published_broadcasts(),
        [receipt("u1", &["m1", "m2", "m3"]), typing("u1", false)]
    );
    assert_eq!(manager.queued_count(&c1), 0);
    assert_eq!(manager.metrics().snapshot().queued_events, 0);
}

#[tokio::test(start_paused = true)]
async fn publishes_during_backoff_wait_for_the_scheduled_attempt() {
    let transport = SimTransport::new();
    transport.fail_all_subscribes(network_down());
    let manager = manager(&transport);
    let c1 = ConversationId::from("c1");
    let start = Instant::now();

    assert!(manager.subscribe(&c1).await.is_err());
    for broadcast in [
        typing("u1", true),
        receipt("u1", &["m1"]),
        typing("u1", false),
        receipt("u1", &["m2"]),
    ] {
        assert_eq!(manager.publish(&c1, broadcast).await.unwrap(), PublishOutcome::Queued);
    }

    // The burst neither hit the transport nor spent the attempt budget
    assert_eq!(transport.subscribe_attempts(), 1);
    assert_eq!(manager.reconnect_attempts(&c1), 1);
    assert!(manager.is_reconnect_pending(&c1));
    assert!(!manager.is_using_polling_fallback(&c1));
    assert_eq!(manager.metrics().snapshot().failed_typing, 0);

    transport.heal();
    sleep(Duration::from_secs(3)).await;

    let offsets: Vec<u64> = transport
        .subscribe_attempt_times()
        .iter()
        .map(|at| (*at - start).as_secs())
        .collect();
    assert_eq!(offsets, [0, 2]);
    assert!(manager.is_subscribed(&c1));
    assert_eq!(
        transport.published_broadcasts(),
        [receipt("u1", &["m1", "m2"]), typing("u1", false)]
    );
    assert_eq!(manager.queued_count(&c1), 0);
}

#[tokio::test(start_paused = true)]
async fn publish_failure_reconnects_without_retrying_payload() {
    let transport = SimTransport::new();
    let manager = manager(&transport);
    let c1 = ConversationId::from("c1");

    manager.subscribe(&c1).await.unwrap();
    transport.fail_next_publishes(1, TransportError::Timeout { elapsed: Duration::from_secs(10) });

    assert!(manager.publish(&c1, typing("u1", true)).await.is_err());
    assert_eq!(manager.state_of(&c1), ConnectionState::Error("Connection timeout".into()));
    assert_eq!(manager.metrics().snapshot().failed_typing, 1);

    sleep(Duration::from_secs(3)).await;

    assert!(manager.is_subscribed(&c1));
    assert_eq!(transport.subscribe_attempts(), 2);
    assert!(transport.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn publish_subscribes_on_demand() {
    let transport = SimTransport::new();
    let manager = manager(&transport);
    let c1 = ConversationId::from("c1");

    let outcome = manager.publish(&c1, typing("u1", true)).await.unwrap();

    assert_eq!(outcome, PublishOutcome::Sent);
    assert_eq!(transport.subscribe_attempts(), 1);
    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].channel, "chat:c1");
    assert_eq!(published[0].event, "typing");
    assert_eq!(manager.metrics().snapshot().typing_events_sent, 1);
}

#[tokio::test(start_paused = true)]
async fn lost_channel_recovers_and_keeps_listeners() {
    let transport = SimTransport::new();
    let manager = manager(&transport);
    let c1 = ConversationId::from("c1");

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    manager.listen(
        &c1,
        EventKind::Typing,
        Arc::new(move |broadcast: Broadcast| sink.lock().unwrap().push(broadcast)),
    );
    manager.subscribe(&c1).await.unwrap();

    manager.handle_channel_lost(&c1, network_down()).await;
    assert!(manager.state_of(&c1).is_error());

    sleep(Duration::from_secs(3)).await;
    assert!(manager.is_subscribed(&c1));
    assert_eq!(transport.closed_channels(), 1);
    assert_eq!(transport.live_channels(), 1);

    assert_eq!(transport.deliver_broadcast(&typing("u2", true)), 1);
    assert_eq!(*received.lock().unwrap(), [typing("u2", true)]);
}

#[tokio::test(start_paused = true)]
async fn channel_lost_is_ignored_unless_connected() {
    let transport = SimTransport::new();
    let manager = manager(&transport);
    let c1 = ConversationId::from("c1");

    manager.handle_channel_lost(&c1, network_down()).await;

    assert_eq!(manager.state_of(&c1), ConnectionState::Disconnected);
    assert!(!manager.is_reconnect_pending(&c1));
}

#[tokio::test(start_paused = true)]
async fn undecodable_inbound_payload_is_dropped() {
    let transport = SimTransport::new();
    let manager = manager(&transport);
    let c1 = ConversationId::from("c1");

    let received = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&received);
    manager.listen(&c1, EventKind::Typing, Arc::new(move |_: Broadcast| *sink.lock().unwrap() += 1));
    manager.subscribe(&c1).await.unwrap();

    transport.deliver("chat:c1", "typing", &bytes::Bytes::from_static(b"\xff\x00garbage"));

    assert_eq!(*received.lock().unwrap(), 0);
    assert!(manager.is_subscribed(&c1));
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_cancels_pending_reconnect() {
    let transport = SimTransport::new();
    transport.fail_next_subscribes(1, TransportError::Unauthorized("expired token".into()));
    let manager = manager(&transport);
    let c1 = ConversationId::from("c1");

    assert!(manager.subscribe(&c1).await.is_err());
    assert_eq!(manager.state_of(&c1), ConnectionState::Error("Authentication error".into()));
    assert!(manager.is_reconnect_pending(&c1));

    manager.unsubscribe(&c1).await;
    sleep(Duration::from_secs(30)).await;

    assert_eq!(transport.subscribe_attempts(), 1);
    assert!(!manager.is_reconnect_pending(&c1));
    assert!(manager.tracked_conversations().is_empty());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn global_state_follows_remaining_channels() {
    let transport = SimTransport::new();
    let manager = manager(&transport);
    let c1 = ConversationId::from("c1");
    let c2 = ConversationId::from("c2");
    let mut states = manager.state_stream();

    manager.subscribe(&c1).await.unwrap();
    manager.subscribe(&c2).await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);

    manager.unsubscribe(&c1).await;
    assert_eq!(manager.state(), ConnectionState::Connected);

    manager.unsubscribe(&c2).await;
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);
    assert_eq!(transport.closed_channels(), 2);
}

#[tokio::test(start_paused = true)]
async fn observers_see_every_transition_despite_a_panicking_peer() {
    let transport = SimTransport::new();
    let manager = manager(&transport);
    let c1 = ConversationId::from("c1");
    let recorder = TransitionRecorder::new();

    manager.add_observer(Arc::new(|_: &StateTransition| panic!("observer bug")));
    let id = manager.add_observer(recorder.observer());

    manager.subscribe(&c1).await.unwrap();
    manager.unsubscribe(&c1).await;

    assert_eq!(
        recorder.states_of(&c1),
        [ConnectionState::Connecting, ConnectionState::Connected, ConnectionState::Disconnected]
    );
    let first = &recorder.transitions()[0];
    assert_eq!(first.from, ConnectionState::Disconnected);

    assert!(manager.remove_observer(id));
    recorder.clear();
    manager.subscribe(&c1).await.unwrap();
    assert!(recorder.transitions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn health_tracks_last_success() {
    let transport = SimTransport::new();
    let manager = manager(&transport);
    let c1 = ConversationId::from("c1");

    assert!(!manager.is_connection_healthy());
    assert_eq!(manager.time_since_last_connection(), None);

    manager.subscribe(&c1).await.unwrap();
    assert!(manager.is_connection_healthy());

    sleep(Duration::from_secs(11)).await;
    assert!(!manager.is_connection_healthy());

    manager.publish(&c1, typing("u1", true)).await.unwrap();
    assert!(manager.is_connection_healthy());
    assert!(manager.time_since_last_connection().unwrap() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_nothing_running() {
    let transport = SimTransport::new();
    transport.fail_next_subscribes(1, network_down());
    let manager = manager(&transport);
    let recorder = TransitionRecorder::new();
    manager.add_observer(recorder.observer());

    let _ = manager.subscribe(&ConversationId::from("c1")).await;
    manager.subscribe(&ConversationId::from("c2")).await.unwrap();

    manager.shutdown().await;
    recorder.clear();
    sleep(Duration::from_secs(60)).await;

    assert_eq!(transport.subscribe_attempts(), 2);
    assert_eq!(transport.live_channels(), 0);
    assert!(manager.tracked_conversations().is_empty());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(recorder.transitions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn connection_time_follows_the_environment_clock() {
    let transport = SimTransport::new();
    let manager = manager(&transport);
    let c1 = ConversationId::from("c1");
    let c2 = ConversationId::from("c2");

    manager.subscribe(&c1).await.unwrap();
    sleep(Duration::from_millis(1_000)).await;
    manager.subscribe(&c2).await.unwrap();
    manager.unsubscribe(&c1).await;
    sleep(Duration::from_millis(500)).await;
    manager.unsubscribe(&c2).await;

    // Idle time is not counted
    sleep(Duration::from_secs(5)).await;
    assert_eq!(manager.metrics().snapshot().total_connection_time, Duration::from_millis(1_500));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_subscribes_settle_on_connected() {
    for round in 0..20 {
        let transport = SimTransport::new();
        let manager = manager(&transport);

        let tasks: Vec<_> = (0..8)
            .map(|n| {
                let manager = manager.clone();
                let conversation = ConversationId::new(format!("c{round}-{n}"));
                tokio::spawn(async move { manager.subscribe(&conversation).await.map(|_| ()) })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(*manager.state_stream().borrow(), ConnectionState::Connected);
    }
}
