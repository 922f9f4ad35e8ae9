//! Reconnect loop: recovery, terminal close and bounded retries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use routed_rust::transport::memory::InMemoryBroker;
use routed_rust::transport::{CloseNotify, Publisher};
use routed_rust::{Channel, Connection, Dialer, Subscriber, SubscriberError, TransportError};
use tokio::sync::oneshot;

use crate::support::{eventually, fast_policy, init_tracing, Received};

const WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// Test 1: Connection loss re-declares the queue and re-binds every topic
// ============================================================================

#[tokio::test]
async fn connection_loss_rebinds_all_topics() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let subscriber =
        Subscriber::exclusive(broker.clone(), "replies").with_reconnect_policy(fast_policy());

    let a = Received::default();
    let b = Received::default();
    subscriber.subscribe("a.*", a.handler()).unwrap();
    subscriber.subscribe("b.*", b.handler()).unwrap();
    subscriber.run().await.unwrap();
    assert_eq!(broker.dial_count(), 1);

    // Exclusive queues vanish with their connection.
    broker.drop_connections();
    assert!(!broker.has_queue("replies"));

    assert!(eventually(WAIT, || broker.has_consumer("replies")).await);
    assert_eq!(broker.dial_count(), 2);
    assert_eq!(broker.bindings("replies"), vec!["a.*", "b.*"]);
    assert_eq!(broker.declared().len(), 2);

    broker.publish("a.after", b"1".to_vec()).await.unwrap();
    broker.publish("b.after", b"2".to_vec()).await.unwrap();
    assert!(eventually(WAIT, || a.len() == 1 && b.len() == 1).await);
}

// ============================================================================
// Test 2: Unacked messages on a durable queue survive a reconnect
// ============================================================================

#[tokio::test]
async fn queued_messages_are_delivered_after_reconnect() {
    let broker = InMemoryBroker::new();
    let subscriber = Subscriber::new(broker.clone(), "durable").with_reconnect_policy(fast_policy());
    let received = Received::default();
    subscriber.subscribe("work", received.handler()).unwrap();
    subscriber.run().await.unwrap();

    // Fail the reconnect a few times so messages pile up meanwhile.
    broker.fail_next_dials(2);
    broker.drop_connections();
    broker.publish("work", b"queued".to_vec()).await.unwrap();
    assert!(broker.has_queue("durable"));

    assert!(eventually(WAIT, || received.len() == 1).await);
    assert_eq!(received.all(), vec!["queued"]);
    assert_eq!(broker.dial_count(), 4);
}

// ============================================================================
// Test 3: Initial dial failures are retried with backoff
// ============================================================================

#[tokio::test]
async fn run_waits_through_dial_failures() {
    let broker = InMemoryBroker::new();
    broker.fail_next_dials(3);
    let subscriber = Subscriber::new(broker.clone(), "flaky").with_reconnect_policy(fast_policy());
    subscriber.subscribe("t", Received::default().handler()).unwrap();

    subscriber.run().await.unwrap();

    assert_eq!(broker.dial_count(), 4);
    assert!(broker.has_consumer("flaky"));
}

// ============================================================================
// Test 4: Bounded retries stop the loop with a reported error
// ============================================================================

#[tokio::test]
async fn retries_exhausted_is_reported() {
    let broker = InMemoryBroker::new();
    broker.fail_next_dials(100);
    let subscriber = Subscriber::new(broker.clone(), "unreachable")
        .with_reconnect_policy(fast_policy().with_max_attempts(3));
    subscriber.subscribe("t", Received::default().handler()).unwrap();

    let err = subscriber.run().await.unwrap_err();

    match err {
        SubscriberError::RetriesExhausted {
            queue,
            attempts,
            last,
        } => {
            assert_eq!(queue, "unreachable");
            assert_eq!(attempts, 3);
            assert!(matches!(last, TransportError::ConnectionFailed(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(broker.dial_count(), 3);
}

// ============================================================================
// Test 5: Close is terminal and never triggers a reconnect
// ============================================================================

#[tokio::test]
async fn close_is_terminal() {
    let broker = InMemoryBroker::new();
    let subscriber = Subscriber::new(broker.clone(), "closing").with_reconnect_policy(fast_policy());
    subscriber.subscribe("t", Received::default().handler()).unwrap();
    subscriber.run().await.unwrap();

    subscriber.close();
    subscriber.close();
    subscriber.join().await.unwrap();
    assert!(subscriber.is_closed());
    assert!(!subscriber.is_running());

    broker.drop_connections();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.dial_count(), 1);
}

// ============================================================================
// Test 6: Close interrupts a backoff sleep
// ============================================================================

#[tokio::test]
async fn close_during_backoff_returns_promptly() {
    let broker = InMemoryBroker::new();
    broker.fail_next_dials(100);
    let mut policy = fast_policy();
    policy.first = Duration::from_secs(30);
    policy.max = Duration::from_secs(30);
    let subscriber = Arc::new(Subscriber::new(broker.clone(), "sleepy").with_reconnect_policy(policy));
    subscriber.subscribe("t", Received::default().handler()).unwrap();

    let running = {
        let subscriber = Arc::clone(&subscriber);
        tokio::spawn(async move { subscriber.run().await })
    };
    assert!(eventually(WAIT, || broker.dial_count() == 1).await);

    let started = Instant::now();
    subscriber.close();
    let outcome = tokio::time::timeout(WAIT, running).await.unwrap().unwrap();

    assert!(matches!(outcome, Err(SubscriberError::Closed)));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(broker.dial_count(), 1);
}

// ============================================================================
// Test 7: A broker that drops every session right away is not hammered
// ============================================================================

/// Dials the in-memory broker but reports every connection as closed.
struct SlammingDoor(InMemoryBroker);

struct ClosedConnection(Box<dyn Connection>);

#[async_trait]
impl Dialer for SlammingDoor {
    async fn dial(&self) -> Result<Box<dyn Connection>, TransportError> {
        Ok(Box::new(ClosedConnection(self.0.dial().await?)))
    }
}

#[async_trait]
impl Connection for ClosedConnection {
    fn notify_close(&self) -> CloseNotify {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(TransportError::ConnectionFailed("closed on accept".into()));
        rx
    }

    async fn channel(&self) -> Result<Box<dyn Channel>, TransportError> {
        self.0.channel().await
    }
}

#[tokio::test]
async fn immediate_disconnects_back_off() {
    let broker = InMemoryBroker::new();
    let mut policy = fast_policy();
    policy.first = Duration::from_millis(25);
    let subscriber = Subscriber::new(SlammingDoor(broker.clone()), "slammed")
        .with_reconnect_policy(policy);
    subscriber.subscribe("t", Received::default().handler()).unwrap();

    subscriber.run().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    subscriber.close();
    subscriber.join().await.unwrap();

    let dials = broker.dial_count();
    assert!(dials >= 2, "never reconnected");
    assert!(dials <= 12, "reconnected {dials} times in 200ms");
}
