//! In-memory topic broker for testing and single-process scenarios.
//!
//! Implements [`Dialer`] and [`Publisher`] over a shared in-process state
//! that behaves like a single AMQP topic exchange:
//!
//! - queues are declared with durable / auto-delete / exclusive flags
//! - bindings are topic patterns on [`TOPIC_EXCHANGE`]
//! - each queue has at most one consumer; unacked messages return to the
//!   queue when the consumer's connection goes away
//! - exclusive and auto-delete queues are deleted with their connection
//!
//! Fault injection ([`InMemoryBroker::drop_connections`],
//! [`InMemoryBroker::fail_next_dials`]) makes the reconnect path testable.
//!
//! ## Example
//!
//! ```
//! use routed_rust::transport::memory::InMemoryBroker;
//! use routed_rust::transport::Publisher;
//!
//! # tokio_test_block(async {
//! let broker = InMemoryBroker::new();
//! broker.publish("1_2", b"hello".to_vec()).await.unwrap();
//! assert_eq!(broker.published_to("1_2"), vec![b"hello".to_vec()]);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::{
    Acknowledger, Channel, CloseNotify, Connection, ConsumeOptions, Delivery, Dialer, Publisher,
    QueueDeclare, TOPIC_EXCHANGE,
};
use crate::error::TransportError;
use crate::topic;

/// Capacity of each consumer's delivery stream.
const PREFETCH: usize = 64;

/// A settled-or-not message sitting in a queue.
#[derive(Clone, Debug)]
struct Message {
    routing_key: String,
    body: Vec<u8>,
}

struct QueueState {
    options: QueueDeclare,
    bindings: Vec<String>,
    pending: VecDeque<Message>,
    unacked: HashMap<u64, Message>,
    consumer: Option<(u64, mpsc::Sender<Delivery>)>,
    /// Connection that declared an exclusive / auto-delete queue.
    owner: u64,
}

struct ConnectionState {
    open: bool,
    notifiers: Vec<oneshot::Sender<TransportError>>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, ConnectionState>,
    next_connection: u64,
    next_tag: u64,
    dials: u32,
    fail_dials: u32,
    published: Vec<(String, Vec<u8>)>,
    declared: Vec<(String, QueueDeclare)>,
    acked: Vec<String>,
    rejected: Vec<(String, bool)>,
}

/// In-memory topic broker.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    /// Create a new, empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Close every open connection, as if the broker restarted.
    ///
    /// Close notifications fire, consumer streams end, unacked messages go
    /// back to their queues and exclusive / auto-delete queues are dropped.
    pub fn drop_connections(&self) {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, c)| c.open)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            state.close_connection(id);
        }
    }

    /// Make the next `n` dial attempts fail.
    pub fn fail_next_dials(&self, n: u32) {
        self.state.lock().fail_dials = n;
    }

    /// Number of dial attempts so far, failed ones included.
    pub fn dial_count(&self) -> u32 {
        self.state.lock().dials
    }

    /// Every `(topic, body)` published so far, in order.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().published.clone()
    }

    /// Bodies published on exactly `topic`.
    pub fn published_to(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, body)| body.clone())
            .collect()
    }

    /// Every queue declaration so far, in order.
    pub fn declared(&self) -> Vec<(String, QueueDeclare)> {
        self.state.lock().declared.clone()
    }

    /// Current bindings of `queue`.
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.bindings.clone())
            .unwrap_or_default()
    }

    /// Whether `queue` currently exists.
    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    /// Whether `queue` currently has a consumer attached.
    pub fn has_consumer(&self, queue: &str) -> bool {
        self.state
            .lock()
            .queues
            .get(queue)
            .is_some_and(|q| q.consumer.is_some())
    }

    /// Routing keys of acknowledged deliveries.
    pub fn acked(&self) -> Vec<String> {
        self.state.lock().acked.clone()
    }

    /// `(routing_key, requeue)` for every rejected delivery.
    pub fn rejected(&self) -> Vec<(String, bool)> {
        self.state.lock().rejected.clone()
    }

    /// Number of messages waiting in `queue` (delivered-but-unacked excluded).
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.pending.len())
            .unwrap_or(0)
    }

    fn acker(&self, queue: &str) -> Arc<dyn Acknowledger> {
        Arc::new(MemoryAcker {
            broker: self.clone(),
            queue: queue.to_string(),
        })
    }

    fn pump(&self, state: &mut State, queue: &str) {
        let acker = self.acker(queue);
        let State {
            queues, next_tag, ..
        } = state;
        let Some(q) = queues.get_mut(queue) else {
            return;
        };
        let Some((_, consumer)) = q.consumer.clone() else {
            return;
        };
        while let Some(msg) = q.pending.pop_front() {
            *next_tag += 1;
            let tag = *next_tag;
            let delivery = Delivery::new(tag, msg.routing_key.clone(), msg.body.clone(), acker.clone());
            match consumer.try_send(delivery) {
                Ok(()) => {
                    q.unacked.insert(tag, msg);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    q.pending.push_front(msg);
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    q.pending.push_front(msg);
                    q.consumer = None;
                    break;
                }
            }
        }
    }
}

impl State {
    fn connection_open(&self, id: u64) -> bool {
        self.connections.get(&id).is_some_and(|c| c.open)
    }

    fn register_notifier(&mut self, id: u64) -> CloseNotify {
        let (tx, rx) = oneshot::channel();
        match self.connections.get_mut(&id) {
            Some(conn) if conn.open => conn.notifiers.push(tx),
            _ => {
                let _ = tx.send(TransportError::Closed);
            }
        }
        rx
    }

    fn close_connection(&mut self, id: u64) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.open = false;
            for notifier in conn.notifiers.drain(..) {
                let _ = notifier.send(TransportError::ConnectionFailed(
                    "connection closed by broker".into(),
                ));
            }
        }

        self.queues.retain(|_, q| {
            let owned = q.owner == id && (q.options.exclusive || q.options.auto_delete);
            if owned {
                return false;
            }
            if q.consumer.as_ref().is_some_and(|(conn, _)| *conn == id) {
                q.consumer = None;
                let mut returned: Vec<(u64, Message)> = q.unacked.drain().collect();
                returned.sort_by_key(|(tag, _)| *tag);
                for (_, msg) in returned.into_iter().rev() {
                    q.pending.push_front(msg);
                }
            }
            true
        });
    }
}

#[async_trait]
impl Dialer for InMemoryBroker {
    async fn dial(&self) -> Result<Box<dyn Connection>, TransportError> {
        let mut state = self.state.lock();
        state.dials += 1;
        if state.fail_dials > 0 {
            state.fail_dials -= 1;
            return Err(TransportError::ConnectionFailed(
                "connection refused".into(),
            ));
        }
        state.next_connection += 1;
        let id = state.next_connection;
        state.connections.insert(
            id,
            ConnectionState {
                open: true,
                notifiers: Vec::new(),
            },
        );
        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

#[async_trait]
impl Publisher for InMemoryBroker {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.published.push((topic.to_string(), body.clone()));

        let targets: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.bindings.iter().any(|b| topic::matches(b, topic)))
            .map(|(name, _)| name.clone())
            .collect();

        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.pending.push_back(Message {
                    routing_key: topic.to_string(),
                    body: body.clone(),
                });
            }
            self.pump(&mut state, &queue);
        }
        Ok(())
    }
}

struct MemoryConnection {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn notify_close(&self) -> CloseNotify {
        self.broker.state.lock().register_notifier(self.id)
    }

    async fn channel(&self) -> Result<Box<dyn Channel>, TransportError> {
        if !self.broker.state.lock().connection_open(self.id) {
            return Err(TransportError::ChannelFailed("connection is closed".into()));
        }
        Ok(Box::new(MemoryChannel {
            broker: self.broker.clone(),
            connection: self.id,
        }))
    }
}

struct MemoryChannel {
    broker: InMemoryBroker,
    connection: u64,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &State) -> Result<(), TransportError> {
        if state.connection_open(self.connection) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn notify_close(&self) -> CloseNotify {
        self.broker.state.lock().register_notifier(self.connection)
    }

    async fn queue_declare(&self, name: &str, options: QueueDeclare) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        self.ensure_open(&state)?;
        state.declared.push((name.to_string(), options));
        let connection = self.connection;
        let queue = state.queues.entry(name.to_string()).or_insert_with(|| QueueState {
            options,
            bindings: Vec::new(),
            pending: VecDeque::new(),
            unacked: HashMap::new(),
            consumer: None,
            owner: connection,
        });
        if queue.options.exclusive && queue.owner != connection {
            return Err(TransportError::DeclareFailed {
                queue: name.to_string(),
                reason: "queue is exclusive to another connection".into(),
            });
        }
        queue.options = options;
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        topic: &str,
        exchange: &str,
        _no_wait: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        self.ensure_open(&state)?;
        if exchange != TOPIC_EXCHANGE {
            return Err(TransportError::BindFailed {
                queue: queue.to_string(),
                topic: topic.to_string(),
                reason: format!("unknown exchange {exchange}"),
            });
        }
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(TransportError::BindFailed {
                queue: queue.to_string(),
                topic: topic.to_string(),
                reason: "no such queue".into(),
            });
        };
        if !q.bindings.iter().any(|b| b == topic) {
            q.bindings.push(topic.to_string());
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _options: ConsumeOptions,
    ) -> Result<mpsc::Receiver<Delivery>, TransportError> {
        let mut state = self.broker.state.lock();
        self.ensure_open(&state)?;
        let (tx, rx) = mpsc::channel(PREFETCH);
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(TransportError::ConsumeFailed {
                queue: queue.to_string(),
                reason: "no such queue".into(),
            });
        };
        if q.consumer.as_ref().is_some_and(|(_, c)| !c.is_closed()) {
            return Err(TransportError::ConsumeFailed {
                queue: queue.to_string(),
                reason: "queue already has a consumer".into(),
            });
        }
        q.consumer = Some((self.connection, tx));
        self.broker.pump(&mut state, queue);
        Ok(rx)
    }
}

struct MemoryAcker {
    broker: InMemoryBroker,
    queue: String,
}

impl Acknowledger for MemoryAcker {
    fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        let msg = state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&delivery_tag));
        if let Some(msg) = msg {
            state.acked.push(msg.routing_key);
        }
        self.broker.pump(&mut state, &self.queue);
        Ok(())
    }

    fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        let msg = state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&delivery_tag));
        if let Some(msg) = msg {
            state.rejected.push((msg.routing_key.clone(), requeue));
            if requeue {
                if let Some(q) = state.queues.get_mut(&self.queue) {
                    q.pending.push_back(msg);
                }
            }
        }
        self.broker.pump(&mut state, &self.queue);
        Ok(())
    }
}
