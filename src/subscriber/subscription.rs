//! A single topic subscription: filter, handler and bounded inbox.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::HandlerError;
use crate::topic;
use crate::transport::Delivery;

/// Capacity of every subscription inbox.
pub const INBOX_CAPACITY: usize = 10;

/// Handles the raw body of a delivery claimed by a subscription.
///
/// `Ok` acknowledges the delivery. `Err` rejects it without requeue; the
/// subscription keeps running either way.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn handle(&self, body: Vec<u8>) -> Result<(), HandlerError>;
}

/// Closure adapter returned by [`consumer_fn`].
pub struct ConsumerFn<F>(F);

#[async_trait]
impl<F, Fut> ConsumerHandler for ConsumerFn<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, body: Vec<u8>) -> Result<(), HandlerError> {
        (self.0)(body).await
    }
}

/// Wrap an async closure as a [`ConsumerHandler`].
///
/// ```
/// use routed_rust::consumer_fn;
///
/// let handler = consumer_fn(|body: Vec<u8>| async move {
///     assert!(!body.is_empty());
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn consumer_fn<F, Fut>(f: F) -> ConsumerFn<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    ConsumerFn(f)
}

/// Outcome of offering a delivery to a subscription inbox.
#[derive(Debug)]
pub(crate) enum Offer {
    Accepted,
    Full(Delivery),
}

pub(crate) struct Subscription {
    topic: String,
    handler: Arc<dyn ConsumerHandler>,
    /// Deliveries whose handler may run at the same time.
    concurrency: usize,
    inbox: mpsc::Sender<Delivery>,
    pending_rx: Mutex<Option<mpsc::Receiver<Delivery>>>,
}

impl Subscription {
    /// A subscription handling one delivery at a time, in inbox order.
    pub(crate) fn new(topic: impl Into<String>, handler: Arc<dyn ConsumerHandler>) -> Self {
        Self::with_concurrency(topic, handler, 1)
    }

    pub(crate) fn with_concurrency(
        topic: impl Into<String>,
        handler: Arc<dyn ConsumerHandler>,
        concurrency: usize,
    ) -> Self {
        let (inbox, rx) = mpsc::channel(INBOX_CAPACITY);
        Self {
            topic: topic.into(),
            handler,
            concurrency: concurrency.max(1),
            inbox,
            pending_rx: Mutex::new(Some(rx)),
        }
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn matches(&self, routing_key: &str) -> bool {
        topic::matches(&self.topic, routing_key)
    }

    /// Non-blocking delivery into the inbox.
    pub(crate) fn offer(&self, delivery: Delivery) -> Offer {
        match self.inbox.try_send(delivery) {
            Ok(()) => Offer::Accepted,
            Err(mpsc::error::TrySendError::Full(d)) | Err(mpsc::error::TrySendError::Closed(d)) => {
                Offer::Full(d)
            }
        }
    }

    /// Spawn the worker draining this inbox. Only the first call spawns.
    ///
    /// The worker takes a delivery only once a handler slot is free, so a
    /// busy subscription leaves work in its inbox and the dispatch loop
    /// requeues the overflow. Each delivery is settled when its handler
    /// resolves.
    pub(crate) fn start(&self, cancel: CancellationToken) {
        let Some(mut rx) = self.pending_rx.lock().take() else {
            return;
        };
        let handler = Arc::clone(&self.handler);
        let topic: Arc<str> = Arc::from(self.topic.as_str());
        let slots = Arc::new(Semaphore::new(self.concurrency));

        tokio::spawn(async move {
            loop {
                let slot = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    slot = Arc::clone(&slots).acquire_owned() => match slot {
                        Ok(slot) => slot,
                        Err(_) => break,
                    },
                };
                let delivery = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    delivery = rx.recv() => match delivery {
                        Some(d) => d,
                        None => break,
                    },
                };
                let handler = Arc::clone(&handler);
                let topic = Arc::clone(&topic);
                tokio::spawn(async move {
                    process(&topic, handler.as_ref(), delivery).await;
                    drop(slot);
                });
            }
            debug!(topic = %topic, "subscription worker stopped");
        });
    }
}

async fn process(topic: &str, handler: &dyn ConsumerHandler, delivery: Delivery) {
    let body = delivery.body.clone();
    let outcome = std::panic::AssertUnwindSafe(handler.handle(body))
        .catch_unwind()
        .await;

    let settled = match outcome {
        Ok(Ok(())) => delivery.ack(),
        Ok(Err(err)) => {
            warn!(topic = %topic, routing_key = %delivery.routing_key, error = %err, "consumer handler failed");
            delivery.reject(false)
        }
        Err(_) => {
            error!(topic = %topic, routing_key = %delivery.routing_key, "consumer handler panicked");
            delivery.reject(false)
        }
    };

    if let Err(err) = settled {
        warn!(topic = %topic, error = %err, "failed to settle delivery");
    }
}
