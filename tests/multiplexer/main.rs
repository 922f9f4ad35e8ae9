//! Subscription multiplexer integration tests.
//!
//! Runs real subscribers against the in-memory broker:
//! - topic dispatch across subscriptions sharing one queue
//! - handler outcomes (ack, reject, contained panics)
//! - reconnect, re-declare and re-bind after connection loss
//! - terminal close and bounded retries

mod dispatch;
mod reconnect;
