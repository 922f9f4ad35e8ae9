//! End-to-end demo over the in-memory broker.
//!
//! router ──"1_7"──► gateway listener ──"microservice-echo"──► echo handler
//!    ▲                                                             │
//!    └──────────────────── router_<uuid> (replies) ◄───────────────┘
//!
//! Run with `RUST_LOG=debug cargo run --example echo_service` to see the
//! heartbeats and courier traffic.

use std::sync::Arc;
use std::time::Duration;

use routed_rust::envelope::{self, Route, ERROR_REPLY_URI};
use routed_rust::transport::memory::InMemoryBroker;
use routed_rust::transport::Publisher;
use routed_rust::{
    consumer_fn, handler_fn, Envelope, ErrorReply, HandlerError, ResponseSender, Router, Service,
    ServiceConfig, StandardRouter, Subscriber,
};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

#[derive(Serialize, Deserialize, Debug)]
struct Echo {
    text: String,
    delay_ms: u64,
}

fn is_error_reply(reply: &Envelope) -> bool {
    reply
        .routing
        .route_from
        .last()
        .is_some_and(|route| route.uri == ERROR_REPLY_URI)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let broker = InMemoryBroker::new();
    let config = ServiceConfig::from_env()?;
    let service = Arc::new(Service::with_config(
        "echo",
        broker.clone(),
        Subscriber::new(broker.clone(), "echo"),
        config,
    ));

    service.add_handler(
        "echo",
        handler_fn(|sender: Arc<dyn ResponseSender>, request: Envelope| async move {
            let echo: Echo = match request.json() {
                Ok(echo) => echo,
                Err(err) => {
                    tracing::warn!(error = %err, "bad echo payload");
                    return;
                }
            };
            if echo.text == "panic" {
                panic!("asked to panic");
            }
            tokio::time::sleep(Duration::from_millis(echo.delay_ms)).await;
            let reply = Envelope::routed_to("resource:///echo")
                .with_payload(echo.text.to_uppercase().into_bytes())
                .completed();
            sender.send(Envelope::reply_to(&request, reply)).await;
        }),
    )?;

    // Stands in for the gateway: relays `1_7` requests to the echo handler
    // and records the router's reply topic as the return address.
    let relay = broker.clone();
    service.add_listener(
        "1_7",
        consumer_fn(move |body: Vec<u8>| {
            let relay = relay.clone();
            async move {
                let mut request = envelope::decode(&body)?;
                if let Some(reply_topic) = request.reply_topic.clone() {
                    request = request.push_route_from(Route::new(reply_topic));
                }
                relay
                    .publish("microservice-echo", envelope::encode(&request)?)
                    .await?;
                Ok::<(), HandlerError>(())
            }
        }),
    )?;

    let (stop, stopped) = oneshot::channel::<()>();
    let serving = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .run_until(async {
                    let _ = stopped.await;
                })
                .await
        })
    };
    while !broker.has_consumer("echo") {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let router = StandardRouter::start(
        broker.clone(),
        Subscriber::exclusive(broker.clone(), "demo-router"),
    )
    .await?;

    for (text, delay_ms) in [("hello", 0), ("slow and steady", 1_200), ("panic", 0)] {
        let request = Envelope::request(1, 7, Vec::new()).with_json(&Echo {
            text: text.to_string(),
            delay_ms,
        })?;
        match router.route(request, Duration::from_secs(3)).await {
            Ok(reply) if is_error_reply(&reply) => {
                let message = ErrorReply::from_bytes(&reply.payload)?.message;
                println!("{text:?} -> error: {message}");
            }
            Ok(reply) => println!("{text:?} -> {:?}", reply.payload_str().unwrap_or_default()),
            Err(err) => println!("{text:?} -> {err}"),
        }
    }

    let _ = stop.send(());
    serving.await??;
    router.close();
    Ok(())
}
