//! One logical subscriber spread over several brokers.
//!
//! A [`MultiSubscriber`] holds one [`Subscriber`] per dialer, all on the same
//! queue name. Every subscription is registered on each of them with the same
//! handler, so a message published to any broker reaches it.

use std::future::Future;
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{info, warn};

use super::{consumer_fn, ConsumerHandler, QueueOptions, Subscriber};
use crate::config::{ReconnectPolicy, ServiceEndpoint};
use crate::error::{HandlerError, SubscriberError};
use crate::transport::Dialer;

pub struct MultiSubscriber {
    queue: String,
    subscribers: Vec<Subscriber>,
}

impl MultiSubscriber {
    /// Durable shared queue `queue` on every dialer.
    pub fn new(dialers: Vec<Arc<dyn Dialer>>, queue: impl Into<String>) -> Self {
        Self::with_options(dialers, queue, QueueOptions::default())
    }

    pub fn with_options(
        dialers: Vec<Arc<dyn Dialer>>,
        queue: impl Into<String>,
        options: QueueOptions,
    ) -> Self {
        let queue = queue.into();
        let subscribers = dialers
            .into_iter()
            .map(|dialer| Subscriber::with_options(dialer, queue.clone(), options))
            .collect();
        Self { queue, subscribers }
    }

    /// One subscriber per discovered endpoint, dialed through `connect`.
    ///
    /// Pairs with [`EnvConfigManager::get_service_configs`](crate::EnvConfigManager::get_service_configs).
    pub fn from_endpoints<F>(
        endpoints: &[ServiceEndpoint],
        queue: impl Into<String>,
        connect: F,
    ) -> Self
    where
        F: Fn(&ServiceEndpoint) -> Arc<dyn Dialer>,
    {
        Self::new(endpoints.iter().map(connect).collect(), queue)
    }

    /// Apply `policy` to every reconnect loop. Builder style.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.subscribers = self
            .subscribers
            .into_iter()
            .map(|s| s.with_reconnect_policy(policy))
            .collect();
        self
    }

    /// Register `handler` for `topic` on every broker.
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: impl ConsumerHandler + 'static,
    ) -> Result<(), SubscriberError> {
        let topic = topic.into();
        let handler: Arc<dyn ConsumerHandler> = Arc::new(handler);
        for subscriber in &self.subscribers {
            subscriber.subscribe_arc(topic.clone(), Arc::clone(&handler))?;
        }
        Ok(())
    }

    pub fn subscribe_fn<F, Fut>(&self, topic: impl Into<String>, f: F) -> Result<(), SubscriberError>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.subscribe(topic, consumer_fn(f))
    }

    /// Start every reconnect loop; returns once all of them are bound.
    ///
    /// If any of them fails to start, the others are closed and its error
    /// is returned.
    pub async fn run(&self) -> Result<(), SubscriberError> {
        if self.subscribers.is_empty() {
            return Err(SubscriberError::NoDialers(self.queue.clone()));
        }
        info!(queue = %self.queue, brokers = self.subscribers.len(), "starting multi subscriber");
        match try_join_all(self.subscribers.iter().map(|s| s.run())).await {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(queue = %self.queue, error = %err, "multi subscriber failed to start");
                self.close();
                Err(err)
            }
        }
    }

    /// Close every subscriber. Idempotent.
    pub fn close(&self) {
        for subscriber in &self.subscribers {
            subscriber.close();
        }
    }

    /// Wait for every reconnect loop; the first failure wins.
    pub async fn join(&self) -> Result<(), SubscriberError> {
        let mut outcome = Ok(());
        for subscriber in &self.subscribers {
            if let Err(err) = subscriber.join().await {
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }
        outcome
    }

    /// Whether every underlying subscriber is running.
    pub fn is_running(&self) -> bool {
        !self.subscribers.is_empty() && self.subscribers.iter().all(Subscriber::is_running)
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn subscribers(&self) -> &[Subscriber] {
        &self.subscribers
    }
}
