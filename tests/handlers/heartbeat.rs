//! Heartbeat emission around long-running handlers.

use std::sync::Arc;
use std::time::Duration;

use routed_rust::envelope::HEARTBEAT_URI;
use routed_rust::transport::memory::InMemoryBroker;
use routed_rust::{handler_fn, Envelope, ResponseSender, Service, ServiceConfig, Subscriber};

use crate::support::{completed_for, eventually, replies, send_request};

fn config(heartbeat_ms: u64) -> ServiceConfig {
    ServiceConfig {
        heartbeat_interval: Duration::from_millis(heartbeat_ms),
        ..ServiceConfig::default()
    }
}

// ============================================================================
// Test 1: Heartbeats stop after the first completed reply
// ============================================================================

#[tokio::test]
async fn heartbeats_stop_after_completed_reply() {
    let broker = InMemoryBroker::new();
    let service = Service::with_config(
        "reports",
        broker.clone(),
        Subscriber::new(broker.clone(), "reports"),
        config(20),
    );
    service
        .add_handler(
            "report",
            handler_fn(|sender: Arc<dyn ResponseSender>, request: Envelope| async move {
                tokio::time::sleep(Duration::from_millis(130)).await;
                let reply = Envelope::routed_to("resource:///report").completed();
                sender.send(Envelope::reply_to(&request, reply)).await;
            }),
        )
        .unwrap();
    service.subscriber().run().await.unwrap();

    send_request(&broker, "report", "r-1").await;
    assert!(eventually(Duration::from_secs(2), || completed_for(&broker, "r-1") == 1).await);
    let at_completion = replies(&broker).len();

    tokio::time::sleep(Duration::from_millis(120)).await;
    let replies = replies(&broker);
    assert_eq!(replies.len(), at_completion, "no heartbeat after completion");

    let (last, heartbeats) = replies.split_last().unwrap();
    assert!(last.completed);
    assert!(heartbeats.len() >= 3, "saw {} heartbeats", heartbeats.len());
    for heartbeat in heartbeats {
        assert!(!heartbeat.completed);
        assert_eq!(heartbeat.id.as_deref(), Some("r-1"));
        assert_eq!(heartbeat.routing.route_from[0].uri, HEARTBEAT_URI);
        assert!(heartbeat.routing.route_to.is_empty());
    }
}

// ============================================================================
// Test 2: Intermediate replies pass through; only the completed one is final
// ============================================================================

#[tokio::test]
async fn intermediate_replies_are_forwarded() {
    let broker = InMemoryBroker::new();
    let service = Service::with_config(
        "stream",
        broker.clone(),
        Subscriber::new(broker.clone(), "stream"),
        config(1_000),
    );
    service
        .add_handler(
            "stream",
            handler_fn(|sender: Arc<dyn ResponseSender>, request: Envelope| async move {
                for chunk in ["a", "b"] {
                    let part = Envelope::routed_to("resource:///stream")
                        .with_payload(chunk.as_bytes().to_vec());
                    sender.send(Envelope::reply_to(&request, part)).await;
                }
                let done = Envelope::routed_to("resource:///stream").completed();
                sender.send(Envelope::reply_to(&request, done)).await;
            }),
        )
        .unwrap();
    service.subscriber().run().await.unwrap();

    send_request(&broker, "stream", "s-1").await;
    assert!(eventually(Duration::from_secs(2), || completed_for(&broker, "s-1") == 1).await);

    let payloads: Vec<Option<String>> = replies(&broker)
        .iter()
        .map(|r| r.payload_str().map(str::to_string))
        .collect();
    assert_eq!(
        payloads,
        vec![Some("a".to_string()), Some("b".to_string()), Some(String::new())]
    );
}

// ============================================================================
// Test 3: Requests run concurrently, each with its own heartbeat
// ============================================================================

#[tokio::test]
async fn concurrent_requests_complete_independently() {
    let broker = InMemoryBroker::new();
    let service = Service::with_config(
        "parallel",
        broker.clone(),
        Subscriber::new(broker.clone(), "parallel"),
        config(25),
    );
    service
        .add_handler(
            "work",
            handler_fn(|sender: Arc<dyn ResponseSender>, request: Envelope| async move {
                let millis = if request.id.as_deref() == Some("fast") { 10 } else { 120 };
                tokio::time::sleep(Duration::from_millis(millis)).await;
                let reply = Envelope::routed_to("resource:///work").completed();
                sender.send(Envelope::reply_to(&request, reply)).await;
            }),
        )
        .unwrap();
    service.subscriber().run().await.unwrap();

    send_request(&broker, "work", "slow").await;
    send_request(&broker, "work", "fast").await;

    assert!(eventually(Duration::from_secs(2), || completed_for(&broker, "fast") == 1).await);
    assert_eq!(completed_for(&broker, "slow"), 0);
    assert!(eventually(Duration::from_secs(2), || completed_for(&broker, "slow") == 1).await);

    let fast_heartbeats = replies(&broker)
        .iter()
        .filter(|r| !r.completed && r.id.as_deref() == Some("fast"))
        .count();
    assert_eq!(fast_heartbeats, 0);
}
