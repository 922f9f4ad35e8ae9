//! Subscription multiplexer: one queue, many topic subscriptions.
//!
//! A [`Subscriber`] owns one physical queue. Topic subscriptions are
//! registered with [`Subscriber::subscribe`] before [`Subscriber::run`];
//! every (re)connect declares the queue, binds every registered topic and
//! starts consuming.
//!
//! ```text
//!            ┌──────────────── reconnect loop ────────────────┐
//!            │                                                │
//!  dial ─► channel ─► declare ─► bind × N ─► consume ─► dispatch loop
//!    ▲                                                        │
//!    │        connection / channel closed (retry)             │
//!    └────────────────────────────────────────────────────────┤
//!                                                             │
//!                       close() (terminal) ◄──────────────────┘
//! ```
//!
//! ## Dispatch
//!
//! Each delivery goes to the first subscription (registration order) whose
//! topic pattern matches its routing key, via a non-blocking offer into that
//! subscription's inbox. A delivery that no subscription matches, or whose
//! matching inbox is full, is rejected with requeue. A subscription settles
//! each delivery once its handler resolves.
//!
//! ## Example
//!
//! ```ignore
//! let subscriber = Subscriber::new(broker.clone(), "orders");
//! subscriber.subscribe_fn("order.*", |body| async move { Ok(()) })?;
//! subscriber.run().await?;   // subscriptions are live from here
//! // ...
//! subscriber.close();
//! ```

mod multi;
mod subscription;

pub use multi::MultiSubscriber;
pub use subscription::{consumer_fn, ConsumerFn, ConsumerHandler, INBOX_CAPACITY};

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ReconnectPolicy;
use crate::error::{HandlerError, SubscriberError, TransportError};
use crate::topic;
use crate::transport::{ConsumeOptions, Delivery, Dialer, QueueDeclare, TOPIC_EXCHANGE};
use subscription::{Offer, Subscription};

/// Queue flags of a subscriber.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Declaration parameters: exclusive queues are never durable.
    pub fn declare(&self) -> QueueDeclare {
        QueueDeclare {
            durable: !self.exclusive,
            auto_delete: self.auto_delete,
            exclusive: self.exclusive,
            no_wait: false,
        }
    }

    /// Consumer parameters: explicit acks, broker-chosen tag.
    pub fn consume(&self) -> ConsumeOptions {
        ConsumeOptions {
            consumer_tag: String::new(),
            auto_ack: false,
            exclusive: self.exclusive,
            no_local: false,
            no_wait: true,
        }
    }
}

/// The subscription multiplexer.
pub struct Subscriber {
    dialer: Arc<dyn Dialer>,
    queue: String,
    options: QueueOptions,
    policy: ReconnectPolicy,
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
    running: AtomicBool,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<Result<(), SubscriberError>>>>,
}

impl Subscriber {
    /// A subscriber on a durable, shared queue.
    pub fn new(dialer: impl Dialer + 'static, queue: impl Into<String>) -> Self {
        Self::with_options(dialer, queue, QueueOptions::default())
    }

    /// A subscriber on an exclusive (non-durable) queue.
    pub fn exclusive(dialer: impl Dialer + 'static, queue: impl Into<String>) -> Self {
        Self::with_options(
            dialer,
            queue,
            QueueOptions {
                exclusive: true,
                auto_delete: false,
            },
        )
    }

    /// A subscriber on an auto-delete queue.
    pub fn auto_delete(dialer: impl Dialer + 'static, queue: impl Into<String>) -> Self {
        Self::with_options(
            dialer,
            queue,
            QueueOptions {
                exclusive: false,
                auto_delete: true,
            },
        )
    }

    pub fn with_options(
        dialer: impl Dialer + 'static,
        queue: impl Into<String>,
        options: QueueOptions,
    ) -> Self {
        Self {
            dialer: Arc::new(dialer),
            queue: queue.into(),
            options,
            policy: ReconnectPolicy::default(),
            subscriptions: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Replace the reconnect policy. Builder style.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Register a topic subscription.
    ///
    /// Only allowed before [`run`](Self::run).
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: impl ConsumerHandler + 'static,
    ) -> Result<(), SubscriberError> {
        self.subscribe_arc(topic, Arc::new(handler))
    }

    /// Register a topic subscription backed by an async closure.
    pub fn subscribe_fn<F, Fut>(&self, topic: impl Into<String>, f: F) -> Result<(), SubscriberError>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.subscribe(topic, consumer_fn(f))
    }

    pub(crate) fn subscribe_arc(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), SubscriberError> {
        self.subscribe_concurrent(topic, handler, 1)
    }

    /// Register a subscription whose handler may run for up to
    /// `concurrency` deliveries at once.
    pub(crate) fn subscribe_concurrent(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn ConsumerHandler>,
        concurrency: usize,
    ) -> Result<(), SubscriberError> {
        let topic = topic.into();
        // `run` flips `running` under the same lock before taking its snapshot.
        let mut subscriptions = self.subscriptions.lock();
        if self.running.load(Ordering::SeqCst) {
            return Err(SubscriberError::AlreadyRunning(self.queue.clone()));
        }
        debug!(queue = %self.queue, topic = %topic, concurrency, "adding subscription");
        subscriptions.push(Arc::new(Subscription::with_concurrency(
            topic,
            handler,
            concurrency,
        )));
        Ok(())
    }

    /// Start the reconnect loop in the background.
    ///
    /// Returns once the first declare / bind / consume cycle succeeded, so
    /// every subscription is live when this returns `Ok`. If the loop stops
    /// before that (closed, or retries exhausted) the reason is returned.
    pub async fn run(&self) -> Result<(), SubscriberError> {
        let subscriptions: Arc<[Arc<Subscription>]> = {
            let registered = self.subscriptions.lock();
            if self.running.swap(true, Ordering::SeqCst) {
                return Err(SubscriberError::AlreadyRunning(self.queue.clone()));
            }
            registered.iter().cloned().collect()
        };
        info!(queue = %self.queue, "starting subscriber");

        for subscription in subscriptions.iter() {
            subscription.start(self.cancel.clone());
        }

        let (started_tx, started_rx) = oneshot::channel();
        let reconnect = ReconnectLoop {
            dialer: Arc::clone(&self.dialer),
            queue: self.queue.clone(),
            options: self.options,
            policy: self.policy,
            subscriptions,
            cancel: self.cancel.clone(),
        };
        *self.task.lock() = Some(tokio::spawn(reconnect.run(started_tx)));

        if started_rx.await.is_ok() {
            return Ok(());
        }
        // The loop ended before its first successful bind.
        match self.join().await {
            Ok(()) => Err(SubscriberError::Closed),
            Err(err) => Err(err),
        }
    }

    /// Stop the reconnect loop and the subscription workers. Idempotent.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            info!(queue = %self.queue, "closing subscriber");
            self.cancel.cancel();
        }
    }

    /// Wait for the background loop to finish and return its outcome.
    ///
    /// `Ok(())` after [`close`](Self::close); an error if the loop gave up.
    pub async fn join(&self) -> Result<(), SubscriberError> {
        let handle = self.task.lock().take();
        match handle {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(err) => {
                    error!(queue = %self.queue, error = %err, "reconnect loop aborted");
                    Err(SubscriberError::Closed)
                }
            },
            None => Ok(()),
        }
    }

    /// Whether `run` was called and `close` was not.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn options(&self) -> QueueOptions {
        self.options
    }

    /// Registered topics, in registration order.
    pub fn topics(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .iter()
            .map(|s| s.topic().to_string())
            .collect()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Why a consume session ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// Explicit close: terminal.
    Closed,
    /// Connection or channel lost: retry.
    Disconnected,
}

/// What happened to one delivery.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Dispatched {
    /// Offered to the subscription at this index.
    Delivered(usize),
    /// No subscription matched; rejected with requeue.
    Unmatched,
    /// The matching subscription's inbox was full; rejected with requeue.
    InboxFull(usize),
}

/// Hand a delivery to the first matching subscription.
pub(crate) fn dispatch(subscriptions: &[Arc<Subscription>], delivery: Delivery) -> Dispatched {
    let Some(index) = subscriptions
        .iter()
        .position(|s| s.matches(&delivery.routing_key))
    else {
        warn!(routing_key = %delivery.routing_key, "no subscription for delivery, requeueing");
        requeue(&delivery);
        return Dispatched::Unmatched;
    };

    match subscriptions[index].offer(delivery) {
        Offer::Accepted => Dispatched::Delivered(index),
        Offer::Full(delivery) => {
            warn!(
                routing_key = %delivery.routing_key,
                topic = %subscriptions[index].topic(),
                "subscription inbox full, requeueing"
            );
            requeue(&delivery);
            Dispatched::InboxFull(index)
        }
    }
}

fn requeue(delivery: &Delivery) {
    if let Err(err) = delivery.reject(true) {
        warn!(routing_key = %delivery.routing_key, error = %err, "failed to reject delivery");
    }
}

struct ReconnectLoop {
    dialer: Arc<dyn Dialer>,
    queue: String,
    options: QueueOptions,
    policy: ReconnectPolicy,
    subscriptions: Arc<[Arc<Subscription>]>,
    cancel: CancellationToken,
}

impl ReconnectLoop {
    async fn run(self, started: oneshot::Sender<()>) -> Result<(), SubscriberError> {
        let mut started = Some(started);
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            debug!(queue = %self.queue, "attempting to run subscription");

            match self.session(&mut started).await {
                Ok(SessionEnd::Closed) => {
                    info!(queue = %self.queue, "subscriber has been closed");
                    return Ok(());
                }
                Ok(SessionEnd::Disconnected) => {
                    attempt = 0;
                    let delay = self.policy.first;
                    warn!(queue = %self.queue, ?delay, "subscription lost its connection, reconnecting");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    attempt += 1;
                    if self.policy.max_attempts.is_some_and(|max| attempt >= max) {
                        error!(queue = %self.queue, attempts = attempt, error = %err, "giving up on subscription");
                        return Err(SubscriberError::RetriesExhausted {
                            queue: self.queue.clone(),
                            attempts: attempt,
                            last: err,
                        });
                    }
                    let delay = self.policy.delay(attempt - 1);
                    warn!(queue = %self.queue, attempt, ?delay, error = %err, "failed to run subscription");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One connect / bind / consume cycle, then dispatch until it ends.
    async fn session(
        &self,
        started: &mut Option<oneshot::Sender<()>>,
    ) -> Result<SessionEnd, TransportError> {
        let connection = self.dialer.dial().await?;
        let mut connection_closed = connection.notify_close();

        let channel = connection.channel().await?;
        let mut channel_closed = channel.notify_close();

        channel
            .queue_declare(&self.queue, self.options.declare())
            .await?;

        for subscription in self.subscriptions.iter() {
            debug!(
                queue = %self.queue,
                topic = %subscription.topic(),
                pattern = topic::is_pattern(subscription.topic()),
                "binding"
            );
            channel
                .queue_bind(&self.queue, subscription.topic(), TOPIC_EXCHANGE, false)
                .await?;
        }

        let mut deliveries = channel.consume(&self.queue, self.options.consume()).await?;
        info!(queue = %self.queue, topics = self.subscriptions.len(), "subscription bound and consuming");

        if let Some(started) = started.take() {
            let _ = started.send(());
        }

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(SessionEnd::Closed),
                reason = &mut connection_closed => {
                    warn!(queue = %self.queue, reason = %close_reason(reason), "connection closed");
                    return Ok(SessionEnd::Disconnected);
                }
                reason = &mut channel_closed => {
                    warn!(queue = %self.queue, reason = %close_reason(reason), "channel closed");
                    return Ok(SessionEnd::Disconnected);
                }
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => {
                        dispatch(&self.subscriptions, delivery);
                    }
                    None => {
                        warn!(queue = %self.queue, "delivery stream ended");
                        return Ok(SessionEnd::Disconnected);
                    }
                },
            }
        }
    }
}

fn close_reason(reason: Result<TransportError, oneshot::error::RecvError>) -> String {
    match reason {
        Ok(err) => err.to_string(),
        Err(_) => "notifier dropped".to_string(),
    }
}
