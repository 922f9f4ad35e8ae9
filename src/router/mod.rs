//! Correlation router: request/reply over a topic broker.
//!
//! Every [`route`](Router::route) call tags the outbound envelope with a fresh
//! id and the router's private reply topic, registers a single-slot waiter
//! under that id, and waits for the matching reply or the deadline.
//!
//! ```text
//! route(msg) ──► pending[id] = waiter ──► publish "{method}_{resource}"
//!                                                   │
//! router_<uuid> ◄── reply (same id) ◄──── responder ┘
//!      │
//!      └─► pending.remove(id) ──► waiter resolved
//! ```
//!
//! Replies for ids that are not pending (timed out, or spurious) are dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::envelope::{self, Envelope, HEARTBEAT_URI};
use crate::error::{HandlerError, RouteError, SubscriberError};
use crate::subscriber::{ConsumerHandler, Subscriber};
use crate::transport::Publisher;

/// Sends a request and waits for its reply.
#[async_trait]
pub trait Router: Send + Sync {
    /// `message` must not carry an id; the router assigns one.
    async fn route(&self, message: Envelope, timeout: Duration) -> Result<Envelope, RouteError>;
}

type PendingTable = Arc<Mutex<HashMap<String, oneshot::Sender<Envelope>>>>;

/// Router correlating replies through its own subscription.
pub struct StandardRouter {
    publisher: Arc<dyn Publisher>,
    subscriber: Subscriber,
    topic: String,
    pending: PendingTable,
}

impl StandardRouter {
    /// Subscribe the reply handler on `subscriber` and run it.
    ///
    /// `subscriber` must not be running yet. Returns once the reply topic is
    /// bound.
    pub async fn start(
        publisher: impl Publisher + 'static,
        subscriber: Subscriber,
    ) -> Result<Self, SubscriberError> {
        let topic = format!("router_{}", Uuid::new_v4());
        let pending = PendingTable::default();

        subscriber.subscribe(
            topic.clone(),
            ReplyConsumer {
                pending: Arc::clone(&pending),
            },
        )?;
        subscriber.run().await?;
        info!(topic = %topic, queue = %subscriber.queue(), "router started");

        Ok(Self {
            publisher: Arc::new(publisher),
            subscriber,
            topic,
            pending,
        })
    }

    /// The private reply topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Number of requests waiting for a reply.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Close the reply subscription and fail every outstanding request.
    pub fn close(&self) {
        self.subscriber.close();
        self.pending.lock().clear();
    }
}

#[async_trait]
impl Router for StandardRouter {
    async fn route(&self, mut message: Envelope, timeout: Duration) -> Result<Envelope, RouteError> {
        if let Some(id) = message.id.as_ref() {
            return Err(RouteError::IdAlreadySet(id.clone()));
        }
        if self.subscriber.is_closed() {
            return Err(RouteError::Closed);
        }

        let id = Uuid::new_v4().to_string();
        message.id = Some(id.clone());
        message.reply_topic = Some(self.topic.clone());
        let body = envelope::encode(&message)?;
        let topic = message.request_topic();

        let (tx, rx) = oneshot::channel();
        let _waiter = Waiter::register(&self.pending, id.clone(), tx);

        debug!(id = %id, topic = %topic, "routing request");
        self.publisher.publish(&topic, body).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => {
                debug!(id = %id, "reply received");
                Ok(reply)
            }
            Ok(Err(_)) => Err(RouteError::Closed),
            Err(_) => {
                warn!(id = %id, topic = %topic, ?timeout, "request timed out");
                Err(RouteError::Timeout(timeout))
            }
        }
    }
}

/// Pending table entry for one exchange; removed on drop.
struct Waiter<'a> {
    pending: &'a PendingTable,
    id: String,
}

impl<'a> Waiter<'a> {
    fn register(pending: &'a PendingTable, id: String, tx: oneshot::Sender<Envelope>) -> Self {
        pending.lock().insert(id.clone(), tx);
        Self { pending, id }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// Resolves waiters from replies arriving on the router topic.
struct ReplyConsumer {
    pending: PendingTable,
}

#[async_trait]
impl ConsumerHandler for ReplyConsumer {
    async fn handle(&self, body: Vec<u8>) -> Result<(), HandlerError> {
        let reply = match envelope::decode(&body) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "failed to decode reply, dropping");
                return Ok(());
            }
        };

        if is_heartbeat(&reply) {
            debug!(id = %reply.id_str(), "heartbeat received");
            return Ok(());
        }

        let waiter = self.pending.lock().remove(reply.id_str());
        match waiter {
            Some(tx) => {
                if tx.send(reply).is_err() {
                    debug!("requester went away before its reply arrived");
                }
            }
            None => debug!(id = %reply.id_str(), "no pending request for reply, dropping"),
        }
        Ok(())
    }
}

fn is_heartbeat(reply: &Envelope) -> bool {
    !reply.completed
        && reply
            .routing
            .route_from
            .last()
            .is_some_and(|route| route.uri == HEARTBEAT_URI)
}
