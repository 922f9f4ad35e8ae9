//! Graceful shutdown: in-flight requests finish before `run_until` returns.

use std::sync::Arc;
use std::time::Duration;

use routed_rust::transport::memory::InMemoryBroker;
use routed_rust::{
    consumer_fn, handler_fn, Envelope, HandlerError, ResponseSender, Service, ServiceConfig,
    Subscriber,
};
use tokio::sync::oneshot;

use crate::support::{completed_for, eventually, send_request};

fn slow_service(broker: &InMemoryBroker) -> Arc<Service> {
    let config = ServiceConfig {
        heartbeat_interval: Duration::from_millis(50),
        drain_poll_interval: Duration::from_millis(10),
        ..ServiceConfig::default()
    };
    let service = Service::with_config(
        "slow",
        broker.clone(),
        Subscriber::new(broker.clone(), "slow"),
        config,
    );
    service
        .add_handler(
            "slow",
            handler_fn(|sender: Arc<dyn ResponseSender>, request: Envelope| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let reply = Envelope::routed_to("resource:///slow").completed();
                sender.send(Envelope::reply_to(&request, reply)).await;
            }),
        )
        .unwrap();
    Arc::new(service)
}

// ============================================================================
// Test 1: Three requests in flight at shutdown all complete before return
// ============================================================================

#[tokio::test]
async fn shutdown_waits_for_in_flight_requests() {
    let broker = InMemoryBroker::new();
    let service = slow_service(&broker);
    let (trigger, shutdown) = oneshot::channel::<()>();

    let running = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .run_until(async {
                    let _ = shutdown.await;
                })
                .await
        })
    };
    assert!(eventually(Duration::from_secs(2), || broker.has_consumer("slow")).await);

    for id in ["one", "two", "three"] {
        send_request(&broker, "slow", id).await;
    }
    assert!(eventually(Duration::from_secs(1), || service.drain().in_flight() == 3).await);

    trigger.send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!running.is_finished());
    assert!(!service.drain().is_consuming());

    tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(service.drain().in_flight(), 0);
    for id in ["one", "two", "three"] {
        assert_eq!(completed_for(&broker, id), 1, "request {id} not completed");
    }
}

// ============================================================================
// Test 2: An idle service shuts down immediately
// ============================================================================

#[tokio::test]
async fn idle_service_stops_right_away() {
    let broker = InMemoryBroker::new();
    let service = slow_service(&broker);

    tokio::time::timeout(Duration::from_secs(1), service.run_until(async {}))
        .await
        .unwrap()
        .unwrap();
    assert!(!service.drain().is_consuming());
    // Draining leaves the subscriber itself running.
    assert!(service.subscriber().is_running());
}

// ============================================================================
// Test 3: Raw listeners share the service's queue
// ============================================================================

#[tokio::test]
async fn listeners_receive_raw_bodies() {
    use routed_rust::transport::Publisher;

    let broker = InMemoryBroker::new();
    let service = slow_service(&broker);
    let (tx, rx) = oneshot::channel::<Vec<u8>>();
    let tx = parking_lot::Mutex::new(Some(tx));
    service
        .add_listener(
            "audit.*",
            consumer_fn(move |body: Vec<u8>| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(body);
                }
                async { Ok::<(), HandlerError>(()) }
            }),
        )
        .unwrap();
    service.subscriber().run().await.unwrap();

    broker.publish("audit.login", b"raw".to_vec()).await.unwrap();
    let body = tokio::time::timeout(Duration::from_secs(1), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body, b"raw");
}
