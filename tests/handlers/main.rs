//! Handler execution wrapper integration tests.
//!
//! Demonstrates the `Service` lifecycle:
//! - heartbeats until exactly one completed reply
//! - panics turned into error replies and diagnostic events
//! - graceful drain of in-flight requests on shutdown
//! - acknowledgement after the handler, with bounded concurrency

mod heartbeat;
mod drain;
