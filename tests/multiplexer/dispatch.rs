//! Topic dispatch and handler outcomes.

use std::time::Duration;

use routed_rust::transport::memory::InMemoryBroker;
use routed_rust::transport::Publisher;
use routed_rust::{HandlerError, Subscriber, SubscriberError};

use crate::support::{eventually, init_tracing, Received};

const WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// Test 1: Deliveries go to the first subscription whose pattern matches
// ============================================================================

#[tokio::test]
async fn delivery_goes_to_matching_subscription_only() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let subscriber = Subscriber::new(broker.clone(), "multiplexed");

    let a = Received::default();
    let b = Received::default();
    subscriber.subscribe("a.*", a.handler()).unwrap();
    subscriber.subscribe("b.*", b.handler()).unwrap();
    subscriber.run().await.unwrap();

    broker.publish("a.1", b"first".to_vec()).await.unwrap();

    assert!(eventually(WAIT, || a.len() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a.all(), vec!["first"]);
    assert!(b.all().is_empty());
    assert_eq!(broker.acked(), vec!["a.1".to_string()]);

    subscriber.close();
    subscriber.join().await.unwrap();
}

// ============================================================================
// Test 2: Overlapping patterns resolve in registration order
// ============================================================================

#[tokio::test]
async fn overlapping_patterns_use_registration_order() {
    let broker = InMemoryBroker::new();
    let subscriber = Subscriber::new(broker.clone(), "overlap");

    let specific = Received::default();
    let catch_all = Received::default();
    subscriber.subscribe("order.created", specific.handler()).unwrap();
    subscriber.subscribe("order.#", catch_all.handler()).unwrap();
    subscriber.run().await.unwrap();

    broker.publish("order.created", b"c".to_vec()).await.unwrap();
    broker.publish("order.shipped.eu", b"s".to_vec()).await.unwrap();

    assert!(eventually(WAIT, || specific.len() == 1 && catch_all.len() == 1).await);
    assert_eq!(specific.all(), vec!["c"]);
    assert_eq!(catch_all.all(), vec!["s"]);
}

// ============================================================================
// Test 3: A single subscription sees deliveries in broker order
// ============================================================================

#[tokio::test]
async fn subscription_preserves_delivery_order() {
    let broker = InMemoryBroker::new();
    let subscriber = Subscriber::new(broker.clone(), "ordered");

    let received = Received::default();
    subscriber.subscribe("seq", received.handler()).unwrap();
    subscriber.run().await.unwrap();

    let expected: Vec<String> = (0..8).map(|i| i.to_string()).collect();
    for body in &expected {
        broker.publish("seq", body.clone().into_bytes()).await.unwrap();
    }

    assert!(eventually(WAIT, || received.len() == expected.len()).await);
    assert_eq!(received.all(), expected);
}

// ============================================================================
// Test 4: Handler errors reject without requeue and the subscription survives
// ============================================================================

#[tokio::test]
async fn handler_error_rejects_without_requeue() {
    let broker = InMemoryBroker::new();
    let subscriber = Subscriber::new(broker.clone(), "failing");

    subscriber
        .subscribe_fn("job.*", |body: Vec<u8>| async move {
            if body == b"bad" {
                return Err(HandlerError::Rejected("bad job".into()));
            }
            Ok(())
        })
        .unwrap();
    subscriber.run().await.unwrap();

    broker.publish("job.1", b"bad".to_vec()).await.unwrap();
    broker.publish("job.2", b"good".to_vec()).await.unwrap();

    assert!(eventually(WAIT, || broker.acked().len() == 1).await);
    assert_eq!(broker.rejected(), vec![("job.1".to_string(), false)]);
    assert_eq!(broker.acked(), vec!["job.2".to_string()]);
    assert_eq!(broker.queue_depth("failing"), 0);
}

// ============================================================================
// Test 5: A panicking handler is contained
// ============================================================================

#[tokio::test]
async fn handler_panic_is_contained() {
    let broker = InMemoryBroker::new();
    let subscriber = Subscriber::new(broker.clone(), "panicky");

    subscriber
        .subscribe_fn("p", |body: Vec<u8>| async move {
            if body == b"boom" {
                panic!("consumer exploded");
            }
            Ok::<(), HandlerError>(())
        })
        .unwrap();
    subscriber.run().await.unwrap();

    broker.publish("p", b"boom".to_vec()).await.unwrap();
    broker.publish("p", b"fine".to_vec()).await.unwrap();

    assert!(eventually(WAIT, || broker.acked().len() == 1).await);
    assert_eq!(broker.rejected(), vec![("p".to_string(), false)]);
    assert!(subscriber.is_running());
}

// ============================================================================
// Test 6: Subscriptions are fixed once running
// ============================================================================

#[tokio::test]
async fn subscribe_after_run_is_refused() {
    let broker = InMemoryBroker::new();
    let subscriber = Subscriber::new(broker.clone(), "fixed");
    subscriber.subscribe("x", Received::default().handler()).unwrap();
    subscriber.run().await.unwrap();

    let err = subscriber
        .subscribe("y", Received::default().handler())
        .unwrap_err();
    assert!(matches!(err, SubscriberError::AlreadyRunning(queue) if queue == "fixed"));
    assert!(matches!(
        subscriber.run().await,
        Err(SubscriberError::AlreadyRunning(_))
    ));
    assert_eq!(broker.bindings("fixed"), vec!["x".to_string()]);
}
