//! routed_rust: a client-side messaging runtime for topic brokers.
//!
//! The crate sits between application request handlers and an AMQP-style
//! topic broker and provides:
//!
//! - [`Subscriber`]: one physical queue, many topic subscriptions, a
//!   reconnect-and-rebind loop and first-match dispatch.
//!   [`MultiSubscriber`] spreads one such queue over several brokers.
//! - [`StandardRouter`]: request/reply correlation by generated id, with a
//!   timeout.
//! - [`Service`]: bounded concurrent handler execution with heartbeats,
//!   panic containment and graceful drain on shutdown.
//!
//! ## Architecture
//!
//! ```text
//!  broker ──► Subscriber (dispatch loop) ──► subscription inbox ──► worker
//!                                                   │
//!                         ┌─────────────────────────┴──────────────┐
//!                         ▼                                        ▼
//!               StandardRouter (reply)                  Service (request)
//!                                                               │
//!                                                  HeartbeatCourier ──► Courier
//!                                                                          │
//!  broker ◄──────────────────────── Publisher::publish ◄───────────────────┘
//! ```
//!
//! The broker itself is reached through the traits in [`transport`]. An
//! in-memory topic broker (`transport::memory`, feature `memory`) implements
//! them for tests and single-process use.

pub mod config;
pub mod envelope;
pub mod error;
pub mod router;
pub mod service;
pub mod subscriber;
pub mod topic;
pub mod transport;

pub use config::{EnvConfigManager, ReconnectPolicy, ServiceConfig, ServiceEndpoint};
pub use envelope::{Envelope, ErrorReply, Route, Routing, Trace};
pub use error::{CodecError, ConfigError, HandlerError, RouteError, SubscriberError, TransportError};
pub use router::{Router, StandardRouter};
pub use service::{
    handler_fn, Courier, Drain, Handler, HeartbeatCourier, ResponseSender, Service, WorkGuard,
};
pub use subscriber::{consumer_fn, ConsumerHandler, MultiSubscriber, QueueOptions, Subscriber};
pub use transport::{Channel, Connection, Delivery, Dialer, Publisher};
