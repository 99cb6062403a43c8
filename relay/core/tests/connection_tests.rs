//! Connection Manager Integration Tests
//!
//! Drive a real [`ConnectionManager`] against the in-process transport with
//! Tokio's clock paused, so reconnect backoff and heartbeat timing run
//! deterministically and instantly.
//!
//! Coverage:
//! - Store-and-forward: payloads sent while down flush in submission order
//! - Reconnect with exponential backoff, bounded by the ceiling
//! - Exhaustion after the configured number of attempts, and explicit recovery
//! - Heartbeat: ping/pong keepalive and stale-link detection
//! - Inbound control handling: ping echo, status, id promotion, raw passthrough
//! - Dispose: idempotent, closes the link, releases subscribers

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::time::{sleep, timeout};

use relay_core::messages::{Inbound, RawPayload};
use relay_core::transport::{CLOSE_NORMAL, CLOSE_STALE};
use relay_core::{
    AssistantStatus, ConnectionConfig, ConnectionManager, ConnectionPhase, InProcessListener,
    InProcessTransport, LinkError, LinkEvent, OverflowPolicy, Subscription, Topic,
};

// =============================================================================
// Helpers
// =============================================================================

/// Long enough that heartbeats never interfere unless a test wants them
const QUIET_PING: Duration = Duration::from_secs(3600);

fn test_config() -> ConnectionConfig {
    ConnectionConfig::for_testing().with_ping_interval(QUIET_PING)
}

fn spawn_link(config: ConnectionConfig) -> (ConnectionManager, InProcessListener) {
    let (transport, listener) = InProcessTransport::new_pair();
    let link = ConnectionManager::spawn(Arc::new(transport), config);
    (link, listener)
}

/// Receive events until one matches
async fn next_matching<F>(subscription: &mut Subscription, predicate: F) -> LinkEvent
where
    F: Fn(&LinkEvent) -> bool,
{
    loop {
        let event = timeout(Duration::from_secs(600), subscription.recv())
            .await
            .expect("timed out waiting for event")
            .expect("bus closed");
        if predicate(&event) {
            return event;
        }
    }
}

async fn wait_phase(link: &ConnectionManager, phase: ConnectionPhase) {
    timeout(
        Duration::from_secs(600),
        link.wait_for(|snapshot| snapshot.phase == phase),
    )
    .await
    .expect("timed out waiting for phase")
    .expect("manager stopped");
}

// =============================================================================
// Store-and-forward
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_sends_before_connect_flush_in_order() {
    let (link, mut listener) = spawn_link(test_config());

    for n in 1..=3 {
        link.send(json!({ "type": "note", "n": n })).unwrap();
    }
    link.connect().unwrap();

    let mut remote = listener.accept().await.unwrap();
    for n in 1..=3 {
        let received = remote.recv_json().await.unwrap();
        assert_eq!(received["n"], n);
    }

    // Sends after the flush go straight out, still in order
    link.send(json!({ "type": "note", "n": 4 })).unwrap();
    assert_eq!(remote.recv_json().await.unwrap()["n"], 4);

    let snapshot = link.wait_for(|s| s.queued == 0).await.unwrap();
    assert_eq!(snapshot.phase, ConnectionPhase::Open);
}

#[tokio::test(start_paused = true)]
async fn test_queue_overflow_drops_oldest() {
    let config = test_config().with_queue(2, OverflowPolicy::DropOldest);
    let (link, mut listener) = spawn_link(config);

    for n in 1..=3 {
        link.send(json!({ "n": n })).unwrap();
    }
    let snapshot = link.wait_for(|s| s.dropped == 1).await.unwrap();
    assert_eq!(snapshot.queued, 2);

    link.connect().unwrap();
    let mut remote = listener.accept().await.unwrap();
    assert_eq!(remote.recv_json().await.unwrap()["n"], 2);
    assert_eq!(remote.recv_json().await.unwrap()["n"], 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_transmit_is_resent_after_reconnect() {
    let (link, mut listener) = spawn_link(test_config());
    link.connect().unwrap();

    let mut first = listener.accept().await.unwrap();
    wait_phase(&link, ConnectionPhase::Open).await;

    // The backend vanishes without a close frame
    first.sever();
    link.send(json!({ "type": "note", "n": 1 })).unwrap();

    let mut second = listener.accept().await.unwrap();
    assert_eq!(second.id(), 2);
    assert_eq!(second.recv_json().await.unwrap()["n"], 1);
}

// =============================================================================
// Reconnect and backoff
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_server_close() {
    let (link, mut listener) = spawn_link(test_config());
    let mut events = link.subscribe(Topic::Connection);
    link.connect().unwrap();

    let mut first = listener.accept().await.unwrap();
    first.close(1011, "restarting").await;

    let lost = next_matching(&mut events, |e| matches!(e, LinkEvent::Disconnected { .. })).await;
    match lost {
        LinkEvent::Disconnected { code, reason, .. } => {
            assert_eq!(code, Some(1011));
            assert_eq!(reason, "restarting");
        }
        other => panic!("unexpected event {other:?}"),
    }

    let scheduled =
        next_matching(&mut events, |e| matches!(e, LinkEvent::ReconnectScheduled { .. })).await;
    assert!(matches!(
        scheduled,
        LinkEvent::ReconnectScheduled { attempt: 1, delay } if delay == Duration::from_millis(100)
    ));

    let second = listener.accept().await.unwrap();
    assert_eq!(second.id(), 2);

    let snapshot = link
        .wait_for(|s| s.phase == ConnectionPhase::Open && s.epoch == 2)
        .await
        .unwrap();
    assert_eq!(snapshot.reconnect_attempts, 0);
    assert_eq!(snapshot.assistant_status, AssistantStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delays_never_exceed_ceiling() {
    let config = test_config().with_max_reconnect_attempts(10);
    let (link, mut listener) = spawn_link(config);
    let mut events = link.subscribe(Topic::Connection);

    for _ in 0..8 {
        listener.fail_next_open("refused");
    }
    link.connect().unwrap();

    let mut delays = Vec::new();
    loop {
        match next_matching(&mut events, |_| true).await {
            LinkEvent::ReconnectScheduled { delay, .. } => delays.push(delay),
            LinkEvent::Connected { .. } => break,
            _ => {}
        }
    }

    let ms: Vec<u64> = delays.iter().map(|d| d.as_millis() as u64).collect();
    assert_eq!(ms, vec![100, 200, 400, 800, 1600, 1600, 1600, 1600]);
    assert_eq!(listener.open_count(), 9);
    assert!(listener.accept().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_after_max_attempts() {
    let config = test_config().with_max_reconnect_attempts(3);
    let (link, mut listener) = spawn_link(config);
    let mut events = link.subscribe(Topic::Connection);

    for _ in 0..3 {
        listener.fail_next_open("refused");
    }
    link.connect().unwrap();

    let exhausted =
        next_matching(&mut events, |e| matches!(e, LinkEvent::MaxAttemptsReached { .. })).await;
    assert!(matches!(exhausted, LinkEvent::MaxAttemptsReached { attempts: 3 }));

    let snapshot = link
        .wait_for(|s| s.phase == ConnectionPhase::Exhausted)
        .await
        .unwrap();
    assert_eq!(snapshot.assistant_status, AssistantStatus::Error);
    assert_eq!(listener.open_count(), 3);

    // No further attempts without an explicit connect
    sleep(Duration::from_secs(60)).await;
    assert_eq!(listener.open_count(), 3);

    // Explicit connect starts over
    link.connect().unwrap();
    assert!(listener.accept().await.is_some());
    let snapshot = link.wait_for(|s| s.phase == ConnectionPhase::Open).await.unwrap();
    assert_eq!(snapshot.reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_open_is_ignored() {
    let (link, mut listener) = spawn_link(test_config());
    link.connect().unwrap();
    let _remote = listener.accept().await.unwrap();
    wait_phase(&link, ConnectionPhase::Open).await;

    link.connect().unwrap();
    link.connect().unwrap();
    sleep(Duration::from_millis(50)).await;

    assert_eq!(listener.open_count(), 1);
    assert_eq!(link.snapshot().epoch, 1);
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_closes_and_reconnects() {
    let (link, mut listener) = spawn_link(test_config());
    link.connect().unwrap();

    let first = listener.accept().await.unwrap();
    wait_phase(&link, ConnectionPhase::Open).await;
    first.send_error("socket reset").await.unwrap();

    let second = listener.accept().await.unwrap();
    assert_eq!(second.id(), 2);
    assert_eq!(
        first.client_close(),
        Some((CLOSE_NORMAL, "transport error".to_string()))
    );
}

// =============================================================================
// Heartbeat
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_stale_link_is_closed_and_replaced() {
    let config = test_config().with_ping_interval(Duration::from_secs(1));
    let (link, mut listener) = spawn_link(config);
    let mut events = link.subscribe(Topic::Connection);
    link.connect().unwrap();

    let mut first = listener.accept().await.unwrap();
    let probe = first.recv_json().await.unwrap();
    assert_eq!(probe["type"], "ping");
    assert!(probe["timestamp"].is_i64());

    // Stay silent until the client gives up on this link
    let lost = next_matching(&mut events, |e| matches!(e, LinkEvent::Disconnected { .. })).await;
    assert!(matches!(
        lost,
        LinkEvent::Disconnected { code: Some(CLOSE_STALE), .. }
    ));
    assert_eq!(
        first.client_close(),
        Some((CLOSE_STALE, "heartbeat timeout".to_string()))
    );

    let second = listener.accept().await.unwrap();
    assert_eq!(second.id(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_answered_pings_keep_link_alive() {
    let config = test_config().with_ping_interval(Duration::from_secs(1));
    let (link, mut listener) = spawn_link(config);
    link.connect().unwrap();

    let mut remote = listener.accept().await.unwrap();
    let responder = tokio::spawn(async move {
        let mut pings = 0;
        while let Some(frame) = remote.recv_json().await {
            if frame["type"] == "ping" {
                pings += 1;
                let reply = json!({ "type": "pong", "timestamp": frame["timestamp"] });
                if remote.send_json(&reply).await.is_err() {
                    break;
                }
            }
        }
        pings
    });

    sleep(Duration::from_secs(10)).await;
    assert_eq!(listener.open_count(), 1);
    assert_eq!(link.snapshot().phase, ConnectionPhase::Open);

    link.dispose();
    let pings = responder.await.unwrap();
    assert!(pings >= 9, "expected a ping per interval, got {pings}");
}

// =============================================================================
// Inbound handling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_backend_ping_is_answered_with_echo() {
    let (link, mut listener) = spawn_link(test_config());
    let mut messages = link.subscribe(Topic::Messages);
    link.connect().unwrap();

    let mut remote = listener.accept().await.unwrap();
    remote
        .send_json(&json!({ "type": "heartbeat", "timestamp": 42 }))
        .await
        .unwrap();

    let reply = remote.recv_json().await.unwrap();
    assert_eq!(reply["type"], "pong");
    assert_eq!(reply["echo"], 42);

    // Control traffic is not forwarded
    remote.send_json(&json!({ "type": "pong" })).await.unwrap();
    remote
        .send_json(&json!({ "type": "notice", "text": "hi" }))
        .await
        .unwrap();
    let forwarded = next_matching(&mut messages, |_| true).await;
    match forwarded {
        LinkEvent::Message(inbound) => assert_eq!(inbound.kind(), Some("notice")),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_reported_status_is_always_forwarded() {
    let (link, mut listener) = spawn_link(test_config());
    let mut events = link.subscribe(Topic::All);
    link.connect().unwrap();

    let remote = listener.accept().await.unwrap();
    let thinking = json!({ "type": "status", "state": "thinking" });
    remote.send_json(&thinking).await.unwrap();
    remote.send_json(&thinking).await.unwrap();
    remote
        .send_json(&json!({ "type": "status", "state": "daydreaming" }))
        .await
        .unwrap();

    let mut statuses = Vec::new();
    let forwarded = loop {
        match next_matching(&mut events, |_| true).await {
            LinkEvent::Status(status) => statuses.push(status),
            LinkEvent::Message(inbound) => break inbound,
            _ => {}
        }
    };

    assert_eq!(statuses, vec![AssistantStatus::Thinking, AssistantStatus::Thinking]);
    assert_eq!(link.assistant_status(), AssistantStatus::Thinking);
    assert_eq!(
        forwarded.as_parsed().and_then(|m| m.state.as_deref()),
        Some("daydreaming")
    );
}

#[tokio::test(start_paused = true)]
async fn test_echoed_frontend_id_is_promoted() {
    let (link, mut listener) = spawn_link(test_config());
    let mut echoes = link.subscribe(Topic::message_type("user_message"));
    link.connect().unwrap();

    let mut remote = listener.accept().await.unwrap();
    let local_id = link.send_user_message("hello").unwrap();

    let sent = remote.recv_json().await.unwrap();
    assert_eq!(sent["type"], "user_message");
    assert_eq!(sent["frontendGeneratedId"], local_id.as_str());
    assert_eq!(sent["text"], "hello");

    remote
        .send_json(&json!({
            "type": "user_message",
            "id": "srv_77",
            "frontendGeneratedId": local_id.as_str(),
            "text": "hello",
        }))
        .await
        .unwrap();

    let LinkEvent::Message(inbound) = next_matching(&mut echoes, |_| true).await else {
        panic!("expected a message");
    };
    let message = inbound.as_parsed().unwrap();
    assert_eq!(message.id.as_deref(), Some(local_id.as_str()));
    assert_eq!(message.backend_id.as_deref(), Some("srv_77"));
    assert!(message.frontend_generated_id.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_frontend_id_is_left_alone() {
    let (link, mut listener) = spawn_link(test_config());
    let mut messages = link.subscribe(Topic::Messages);
    link.connect().unwrap();

    let remote = listener.accept().await.unwrap();
    remote
        .send_json(&json!({ "type": "user_message", "id": "srv_1", "frontendGeneratedId": "local_other" }))
        .await
        .unwrap();

    let LinkEvent::Message(inbound) = next_matching(&mut messages, |_| true).await else {
        panic!("expected a message");
    };
    let message = inbound.as_parsed().unwrap();
    assert_eq!(message.id.as_deref(), Some("srv_1"));
    assert_eq!(message.frontend_generated_id.as_deref(), Some("local_other"));
}

#[tokio::test(start_paused = true)]
async fn test_unparseable_frames_pass_through_raw() {
    let (link, mut listener) = spawn_link(test_config());
    let mut messages = link.subscribe(Topic::Messages);
    link.connect().unwrap();

    let remote = listener.accept().await.unwrap();
    remote.send_text("not json {").await.unwrap();
    remote.send_binary(vec![0, 1, 2]).await.unwrap();

    let mut raw = Vec::new();
    for _ in 0..2 {
        let LinkEvent::Message(inbound) = next_matching(&mut messages, |_| true).await else {
            panic!("expected a message");
        };
        match inbound.as_ref() {
            Inbound::Raw(payload) => raw.push(payload.clone()),
            Inbound::Parsed(message) => panic!("unexpected parse {message:?}"),
        }
    }

    assert_eq!(
        raw,
        vec![
            RawPayload::Text("not json {".to_string()),
            RawPayload::Binary(vec![0, 1, 2]),
        ]
    );
}

// =============================================================================
// Dispose
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_dispose_closes_link_and_releases_subscribers() {
    let (link, mut listener) = spawn_link(test_config());
    let mut events = link.subscribe(Topic::All);
    link.connect().unwrap();

    let remote = listener.accept().await.unwrap();
    wait_phase(&link, ConnectionPhase::Open).await;

    link.dispose();
    link.dispose();
    assert!(link.is_disposed());
    assert_eq!(link.send(json!({ "n": 1 })), Err(LinkError::Disposed));
    assert_eq!(link.connect(), Err(LinkError::Disposed));

    // The bus closes, so every subscription drains and ends
    while timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("subscription never ended")
        .is_some()
    {}

    assert_eq!(link.snapshot().phase, ConnectionPhase::Disposed);
    assert_eq!(remote.client_close(), Some((CLOSE_NORMAL, "disposed".to_string())));
}

#[tokio::test(start_paused = true)]
async fn test_dispose_cancels_pending_reconnect() {
    let (link, listener) = spawn_link(test_config());
    listener.fail_next_open("refused");
    link.connect().unwrap();

    wait_phase(&link, ConnectionPhase::Waiting).await;
    link.send(json!({ "n": 1 })).unwrap();
    link.dispose();

    sleep(Duration::from_secs(60)).await;
    assert_eq!(listener.open_count(), 1);

    let snapshot = link.snapshot();
    assert_eq!(snapshot.phase, ConnectionPhase::Disposed);
    assert_eq!(snapshot.queued, 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_handle_disposes() {
    let (link, mut listener) = spawn_link(test_config());
    link.connect().unwrap();
    let remote = listener.accept().await.unwrap();
    wait_phase(&link, ConnectionPhase::Open).await;

    drop(link);
    sleep(Duration::from_millis(10)).await;

    assert_eq!(remote.client_close(), Some((CLOSE_NORMAL, "disposed".to_string())));
}
