//! Error types shared across the runtime.

use std::error::Error;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by the broker transport (dial, channel, declare, publish).
///
/// These never reach application code through the subscriber: the
/// reconnect loop logs them and retries.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Dialing the broker failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// Opening a channel on an established connection failed.
    #[error("channel failed: {0}")]
    ChannelFailed(String),
    /// The broker refused a queue declaration.
    #[error("queue declare failed for {queue}: {reason}")]
    DeclareFailed { queue: String, reason: String },
    /// The broker refused a queue binding.
    #[error("queue bind failed for {queue} -> {topic}: {reason}")]
    BindFailed {
        queue: String,
        topic: String,
        reason: String,
    },
    /// Starting a consumer failed.
    #[error("consume failed for {queue}: {reason}")]
    ConsumeFailed { queue: String, reason: String },
    /// The connection or channel is already closed.
    #[error("transport closed")]
    Closed,
    /// Publishing a message failed.
    #[error("publish failed on {topic}: {reason}")]
    PublishFailed { topic: String, reason: String },
    /// Other error.
    #[error("transport error: {0}")]
    Other(Box<dyn Error + Send + Sync>),
}

/// Errors from the subscription multiplexer.
#[derive(Debug, Error)]
pub enum SubscriberError {
    /// `subscribe` was called after `run`.
    #[error("subscriber for queue {0} is already running")]
    AlreadyRunning(String),
    /// The subscriber was closed explicitly.
    #[error("subscriber has been closed")]
    Closed,
    /// The reconnect loop gave up after the configured number of attempts.
    #[error("subscriber for queue {queue} gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        queue: String,
        attempts: u32,
        last: TransportError,
    },
    /// A multi-broker subscriber was given no dialers.
    #[error("no brokers to subscribe queue {0} on")]
    NoDialers(String),
}

/// Errors from encoding or decoding an [`Envelope`](crate::Envelope).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

impl From<bitcode::Error> for CodecError {
    fn from(err: bitcode::Error) -> Self {
        CodecError::Decode(err.to_string())
    }
}

/// Errors returned to callers of [`Router::route`](crate::Router::route).
#[derive(Debug, Error)]
pub enum RouteError {
    /// No reply with a matching id arrived before the deadline.
    #[error("timed out after {0:?} waiting for reply")]
    Timeout(Duration),
    /// The message already carried an id; the router assigns its own.
    #[error("message already has id {0}")]
    IdAlreadySet(String),
    /// The request could not be serialized.
    #[error("marshal error: {0}")]
    Encode(#[from] CodecError),
    /// The request could not be published.
    #[error("publish error: {0}")]
    Publish(#[from] TransportError),
    /// The router was closed while the request was outstanding.
    #[error("router closed")]
    Closed,
}

impl RouteError {
    /// Whether this error is a correlation timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RouteError::Timeout(_))
    }
}

/// Error type for consumer handlers attached to a subscription.
///
/// Returning an error makes the subscription reject the delivery without
/// requeue; it does not stop the subscription.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Payload decode failed.
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    /// Business logic rejected the message.
    #[error("rejected: {0}")]
    Rejected(String),
    /// Transport error while handling.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// Other error.
    #[error("handler error: {0}")]
    Other(Box<dyn Error + Send + Sync>),
}

impl From<CodecError> for HandlerError {
    fn from(err: CodecError) -> Self {
        HandlerError::DecodeFailed(err.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::DecodeFailed(err.to_string())
    }
}

/// Errors from configuration loading.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// No endpoint variables were found for the requested service.
    #[error("no service configs found")]
    NoServiceConfigs,
    /// An environment key did not follow `NAME[_INDEX]_PORT_<port>_<KEY>`.
    #[error("invalid service variable format")]
    InvalidServiceVariableFormat,
    /// A numeric setting could not be parsed.
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}
