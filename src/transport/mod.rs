//! Broker transport traits.
//!
//! The runtime never talks to a broker directly. It dials through a
//! [`Dialer`], opens a [`Channel`] on the resulting [`Connection`], and
//! publishes through a [`Publisher`]. Implementations might include:
//!
//! - `InMemoryBroker` - for testing and single-process scenarios (included)
//! - an AMQP 0-9-1 client - RabbitMQ and compatible brokers (external)
//!
//! ```text
//! Dialer::dial ──► Connection ──► Channel ──► queue_declare / queue_bind
//!                     │              │         consume ──► Delivery stream
//!                     ▼              ▼
//!               notify_close    notify_close
//! ```

#[cfg(feature = "memory")]
pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::TransportError;

/// The topic exchange every subscription binds on.
pub const TOPIC_EXCHANGE: &str = "amq.topic";

/// One-shot notification that a connection or channel closed.
///
/// Resolves with the close reason, or with a receive error when the
/// transport dropped the notifier. Both mean "closed".
pub type CloseNotify = oneshot::Receiver<TransportError>;

/// Queue declaration parameters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueDeclare {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub no_wait: bool,
}

/// Consumer parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Empty lets the broker pick one.
    pub consumer_tag: String,
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
}

/// Produces broker connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<Box<dyn Connection>, TransportError>;
}

/// A live broker connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Register for the close notification of this connection.
    fn notify_close(&self) -> CloseNotify;

    /// Open a channel on this connection.
    async fn channel(&self) -> Result<Box<dyn Channel>, TransportError>;
}

/// A logical session on a connection.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Register for the close notification of this channel.
    fn notify_close(&self) -> CloseNotify;

    async fn queue_declare(&self, name: &str, options: QueueDeclare) -> Result<(), TransportError>;

    async fn queue_bind(
        &self,
        queue: &str,
        topic: &str,
        exchange: &str,
        no_wait: bool,
    ) -> Result<(), TransportError>;

    /// Start consuming. The stream ends when the channel goes away.
    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<mpsc::Receiver<Delivery>, TransportError>;
}

/// Settles deliveries with the broker.
pub trait Acknowledger: Send + Sync {
    fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;
}

/// A message delivered by a consumer.
pub struct Delivery {
    pub delivery_tag: u64,
    /// Topic the message was published on.
    pub routing_key: String,
    pub body: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        routing_key: impl Into<String>,
        body: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            routing_key: routing_key.into(),
            body,
            acker,
        }
    }

    pub fn ack(&self) -> Result<(), TransportError> {
        self.acker.ack(self.delivery_tag)
    }

    /// Reject the delivery, optionally asking the broker to requeue it.
    pub fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker.reject(self.delivery_tag, requeue)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Fire-and-forget publishing.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), TransportError>;
}

#[async_trait]
impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), TransportError> {
        (**self).publish(topic, body).await
    }
}

#[async_trait]
impl<D: Dialer + ?Sized> Dialer for Arc<D> {
    async fn dial(&self) -> Result<Box<dyn Connection>, TransportError> {
        (**self).dial().await
    }
}
