//! Service: handler execution with heartbeats, fault containment and drain.
//!
//! A [`Service`] turns a [`Subscriber`] into a request handler host. Every
//! handler registered under `path` listens on `microservice-{path}`. Up to
//! [`MAX_CONCURRENT_REQUESTS`] requests per path run at once, each with a
//! [`HeartbeatCourier`] keeping the caller informed until the handler sends
//! its completed reply. A request is acknowledged only after its handler
//! returns, so one cut off by a lost connection is redelivered.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use routed_rust::transport::memory::InMemoryBroker;
//! use routed_rust::{handler_fn, Envelope, ResponseSender, Service, Subscriber};
//!
//! # async fn demo() -> Result<(), routed_rust::SubscriberError> {
//! let broker = InMemoryBroker::new();
//! let service = Service::new("echo", broker.clone(), Subscriber::new(broker, "echo"));
//!
//! service.add_handler(
//!     "echo",
//!     handler_fn(|sender: Arc<dyn ResponseSender>, request: Envelope| async move {
//!         let reply = Envelope::routed_to("resource:///echo")
//!             .with_payload(request.payload.clone())
//!             .completed();
//!         sender.send(Envelope::reply_to(&request, reply)).await;
//!     }),
//! )?;
//!
//! service.run().await
//! # }
//! ```

mod courier;
mod drain;
mod panic;
mod signals;

pub use courier::{Courier, HeartbeatCourier, ResponseSender};
pub use drain::{Drain, WorkGuard};
pub use signals::wait_for_shutdown_signal;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::config::{ServiceConfig, ServiceEndpoint};
use crate::envelope::{self, Envelope, ErrorReply, ERROR_REPLY_URI};
use crate::error::{ConfigError, HandlerError, SubscriberError};
use crate::subscriber::{ConsumerHandler, Subscriber, INBOX_CAPACITY};
use crate::transport::{Dialer, Publisher};

/// Requests of one handler path that may run at the same time.
pub const MAX_CONCURRENT_REQUESTS: usize = INBOX_CAPACITY;

/// Handles one decoded request.
///
/// Replies go through `sender`; the last one should be marked completed.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, sender: Arc<dyn ResponseSender>, request: Envelope);
}

/// Closure adapter returned by [`handler_fn`].
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Arc<dyn ResponseSender>, Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, sender: Arc<dyn ResponseSender>, request: Envelope) {
        (self.0)(sender, request).await
    }
}

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Arc<dyn ResponseSender>, Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    HandlerFn(f)
}

/// Hosts request handlers on a subscriber.
pub struct Service {
    name: String,
    publisher: Arc<dyn Publisher>,
    subscriber: Subscriber,
    courier: Courier,
    config: ServiceConfig,
    drain: Arc<Drain>,
}

impl Service {
    /// Create a service with the default [`ServiceConfig`].
    ///
    /// Must be called inside a tokio runtime (the courier task is spawned here).
    pub fn new(
        name: impl Into<String>,
        publisher: impl Publisher + 'static,
        subscriber: Subscriber,
    ) -> Self {
        Self::with_config(name, publisher, subscriber, ServiceConfig::default())
    }

    pub fn with_config(
        name: impl Into<String>,
        publisher: impl Publisher + 'static,
        subscriber: Subscriber,
        config: ServiceConfig,
    ) -> Self {
        panic::install_location_hook();
        let publisher: Arc<dyn Publisher> = Arc::new(publisher);
        Self {
            name: name.into(),
            courier: Courier::spawn(Arc::clone(&publisher)),
            publisher,
            subscriber,
            config,
            drain: Arc::new(Drain::new()),
        }
    }

    /// A service on the broker at the `RABBITMQ_*` endpoint, with its
    /// settings read from the environment.
    ///
    /// `connect` turns the endpoint into a broker handle; the service
    /// publishes through it and consumes queue `name` from it.
    pub fn basic<B, F>(name: impl Into<String>, connect: F) -> Result<Self, ConfigError>
    where
        B: Dialer + Publisher + Clone + 'static,
        F: FnOnce(&ServiceEndpoint) -> B,
    {
        Self::basic_with_lookup(name, |key| std::env::var(key).ok(), connect)
    }

    /// [`basic`](Self::basic) over an arbitrary variable lookup.
    pub fn basic_with_lookup<L, B, F>(
        name: impl Into<String>,
        lookup: L,
        connect: F,
    ) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
        B: Dialer + Publisher + Clone + 'static,
        F: FnOnce(&ServiceEndpoint) -> B,
    {
        let name = name.into();
        let endpoint = ServiceEndpoint::basic_from_lookup(&lookup);
        let config = ServiceConfig::from_lookup(&lookup)?;
        info!(service = %name, endpoint = %endpoint.addr, "connecting basic service");
        let broker = connect(&endpoint);
        let subscriber = Subscriber::new(broker.clone(), name.clone());
        Ok(Self::with_config(name, broker, subscriber, config))
    }

    /// Register `handler` for requests on `microservice-{path}`.
    pub fn add_handler(
        &self,
        path: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> Result<(), SubscriberError> {
        let path = path.into();
        info!(service = %self.name, path = %path, "adding handler");

        let consumer = RequestConsumer {
            invocation: Arc::new(Invocation {
                path: path.clone(),
                handler: Arc::new(handler),
                courier: Arc::new(self.courier.clone()),
                publisher: Arc::clone(&self.publisher),
                config: self.config.clone(),
            }),
            drain: Arc::clone(&self.drain),
        };
        self.subscriber.subscribe_concurrent(
            format!("microservice-{path}"),
            Arc::new(consumer),
            MAX_CONCURRENT_REQUESTS,
        )
    }

    /// Register a raw consumer on `topic`.
    pub fn add_listener(
        &self,
        topic: impl Into<String>,
        consumer: impl ConsumerHandler + 'static,
    ) -> Result<(), SubscriberError> {
        self.subscriber.subscribe(topic, consumer)
    }

    /// Run until a termination signal arrives, then drain.
    pub async fn run(&self) -> Result<(), SubscriberError> {
        self.run_until(async {
            if let Err(err) = wait_for_shutdown_signal().await {
                error!(error = %err, "failed to listen for termination signals");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until `shutdown` completes, then drain.
    ///
    /// Draining stops counting new work as consumable and waits until every
    /// in-flight request has finished. The subscriber is left running.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), SubscriberError>
    where
        F: Future<Output = ()>,
    {
        info!(service = %self.name, queue = %self.subscriber.queue(), "starting service");
        self.subscriber.run().await?;

        shutdown.await;
        info!(
            service = %self.name,
            in_flight = self.drain.in_flight(),
            "received exit signal, waiting for work queue to empty"
        );
        self.drain.stop_consuming();
        self.drain.wait_idle(self.config.drain_poll_interval).await;
        info!(service = %self.name, "exiting");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn drain(&self) -> &Arc<Drain> {
        &self.drain
    }

    pub fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }
}

/// Subscription handler running one request to completion.
struct RequestConsumer {
    invocation: Arc<Invocation>,
    drain: Arc<Drain>,
}

#[async_trait]
impl ConsumerHandler for RequestConsumer {
    async fn handle(&self, body: Vec<u8>) -> Result<(), HandlerError> {
        let path = &self.invocation.path;
        let request = match envelope::decode(&body) {
            Ok(request) => request,
            Err(err) => {
                warn!(path = %path, error = %err, "failed to decode request, dropping");
                return Ok(());
            }
        };
        if !self.drain.is_consuming() {
            debug!(path = %path, id = %request.id_str(), "request received while draining");
        }
        debug!(path = %path, id = %request.id_str(), "handling request");

        let _guard = self.drain.enter();
        self.invocation.run(request, body).await;
        Ok(())
    }
}

/// Everything needed to run one handler invocation.
struct Invocation {
    path: String,
    handler: Arc<dyn Handler>,
    courier: Arc<Courier>,
    publisher: Arc<dyn Publisher>,
    config: ServiceConfig,
}

impl Invocation {
    async fn run(&self, request: Envelope, body: Vec<u8>) {
        let heartbeat = HeartbeatCourier::spawn(
            self.courier.clone(),
            &request,
            self.config.heartbeat_interval,
        );
        let sender: Arc<dyn ResponseSender> = heartbeat.clone();

        if !self.config.prevent_panics {
            self.handler.handle(sender, request).await;
            heartbeat.stop();
            return;
        }

        let outcome = AssertUnwindSafe(self.handler.handle(sender, request.clone()))
            .catch_unwind()
            .await;
        if let Err(payload) = outcome {
            let location = panic::take_location();
            let message = panic::describe(&self.path, location.as_deref(), payload.as_ref());
            error!(path = %self.path, id = %request.id_str(), "{message}");
            self.fault(&heartbeat, &request, message, body).await;
        }
        heartbeat.stop();
    }

    /// Reply with an error and publish the raw request as a panic event.
    async fn fault(
        &self,
        heartbeat: &HeartbeatCourier,
        request: &Envelope,
        message: String,
        body: Vec<u8>,
    ) {
        let payload = ErrorReply::new(message).to_bytes().unwrap_or_else(|err| {
            error!(path = %self.path, error = %err, "failed to marshal error reply");
            Vec::new()
        });
        let reply = Envelope::routed_to(ERROR_REPLY_URI)
            .with_payload(payload)
            .completed();
        heartbeat.send(Envelope::reply_to(request, reply)).await;

        let topic = format!("panic.{}", self.path);
        if let Err(err) = self.publisher.publish(&topic, body).await {
            warn!(path = %self.path, topic = %topic, error = %err, "failed to publish panic event");
        }
    }
}
