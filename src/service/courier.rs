//! Couriers: how replies leave a handler.
//!
//! ```text
//! handler ──send──► HeartbeatCourier ──► Courier (queue) ──► Publisher
//!                        ▲    │
//!          every interval│    └─ first completed reply stops the heartbeat
//!                        └── heartbeat reply
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::envelope::{self, Envelope, HEARTBEAT_URI};
use crate::transport::Publisher;

/// Capacity of the courier's outbound queue.
const COURIER_CAPACITY: usize = 10;

/// Something a handler can send replies through.
#[async_trait]
pub trait ResponseSender: Send + Sync {
    async fn send(&self, response: Envelope);
}

/// Publishes replies in the background.
///
/// Every reply pops the last entry off its `route_to` stack and is published
/// on that entry's URI. A reply with an empty stack is logged and skipped.
#[derive(Clone)]
pub struct Courier {
    responses: mpsc::Sender<Envelope>,
}

impl Courier {
    /// Spawn the publishing task. Must be called inside a tokio runtime.
    pub fn spawn(publisher: Arc<dyn Publisher>) -> Self {
        let (responses, mut rx) = mpsc::channel::<Envelope>(COURIER_CAPACITY);

        tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                publish_response(publisher.as_ref(), response).await;
            }
            debug!("courier stopped");
        });

        Self { responses }
    }
}

#[async_trait]
impl ResponseSender for Courier {
    async fn send(&self, response: Envelope) {
        let destination = response
            .routing
            .next_destination()
            .map(|r| r.uri.clone())
            .unwrap_or_default();
        if response.completed {
            debug!(id = %response.id_str(), destination = %destination, "sending final reply");
        } else {
            debug!(id = %response.id_str(), destination = %destination, "sending intermediary reply");
        }

        if self.responses.send(response).await.is_err() {
            error!("courier is no longer running, reply dropped");
        }
    }
}

/// Publish one hop of a reply. Failures are logged, never raised.
pub(crate) async fn publish_response(publisher: &dyn Publisher, mut response: Envelope) {
    let Some(destination) = response.routing.pop_destination() else {
        error!(id = %response.id_str(), "reply has no destination, skipping publish");
        return;
    };

    let body = match envelope::encode(&response) {
        Ok(body) => body,
        Err(err) => {
            error!(id = %response.id_str(), error = %err, "failed to marshal reply");
            return;
        }
    };

    match publisher.publish(&destination.uri, body).await {
        Ok(()) => debug!(id = %response.id_str(), topic = %destination.uri, "published reply"),
        Err(err) => warn!(id = %response.id_str(), topic = %destination.uri, error = %err, "failed to publish reply"),
    }
}

/// Wraps a sender for one request and keeps the caller informed.
///
/// Until the first completed reply passes through [`send`](ResponseSender::send),
/// a heartbeat reply is sent to the request's return address every
/// `interval`. No heartbeat is sent after the completed reply.
pub struct HeartbeatCourier {
    parent: Arc<dyn ResponseSender>,
    completed: Arc<AsyncMutex<bool>>,
    stop: CancellationToken,
    id: String,
}

impl HeartbeatCourier {
    /// Start heartbeating for `request`. Must be called inside a tokio runtime.
    pub fn spawn(
        parent: Arc<dyn ResponseSender>,
        request: &Envelope,
        interval: Duration,
    ) -> Arc<Self> {
        let completed = Arc::new(AsyncMutex::new(false));
        let stop = CancellationToken::new();
        let heartbeat = Envelope::reply_to(request, Envelope::routed_to(HEARTBEAT_URI));

        tokio::spawn({
            let parent = Arc::clone(&parent);
            let completed = Arc::clone(&completed);
            let stop = stop.clone();
            async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let done = completed.lock().await;
                    if *done || stop.is_cancelled() {
                        break;
                    }
                    parent.send(heartbeat.clone()).await;
                }
            }
        });

        Arc::new(Self {
            parent,
            completed,
            stop,
            id: request.id_str().to_string(),
        })
    }

    /// Stop heartbeating without sending anything.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Whether a completed reply has passed through this courier.
    pub async fn is_completed(&self) -> bool {
        *self.completed.lock().await
    }
}

#[async_trait]
impl ResponseSender for HeartbeatCourier {
    async fn send(&self, response: Envelope) {
        let mut done = self.completed.lock().await;
        if response.completed && !*done {
            debug!(id = %self.id, "completed reply observed, stopping heartbeat");
            *done = true;
            self.stop.cancel();
        }
        self.parent.send(response).await;
    }
}

impl Drop for HeartbeatCourier {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
