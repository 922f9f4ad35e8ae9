//! The routed message exchanged over the broker.
//!
//! An envelope carries a correlation id, a routing stack, an opaque payload,
//! a completion flag and optional trace metadata.
//!
//! ## Routing discipline
//!
//! ```text
//! request:  route_to   = [.., next hop]      (popped one hop at a time)
//!           route_from = [.., caller]        (the return path)
//!
//! reply:    route_to   = request.route_from
//!           route_from = what the reply is   (e.g. resource:///heartbeat)
//! ```
//!
//! The last entry of `route_to` is the next destination. Whoever publishes a
//! hop pops it first.

mod codec;

pub use codec::{decode, encode};

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// URI used for heartbeat (intermediate) replies.
pub const HEARTBEAT_URI: &str = "resource:///heartbeat";

/// URI used for fault replies synthesized by the service wrapper.
pub const ERROR_REPLY_URI: &str = "resource:///platform/reply/error";

/// One entry of a routing stack.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// URI-like topic or address.
    pub uri: String,
    /// Optional network location.
    pub ip: Option<String>,
    pub port: Option<u32>,
}

impl Route {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ip: None,
            port: None,
        }
    }

    /// Attach a network location to the route.
    pub fn at(mut self, ip: impl Into<String>, port: u32) -> Self {
        self.ip = Some(ip.into());
        self.port = Some(port);
        self
    }
}

/// Destination and provenance stacks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    pub route_to: Vec<Route>,
    pub route_from: Vec<Route>,
}

impl Routing {
    /// Routing with a single destination.
    pub fn to_uri(uri: impl Into<String>) -> Self {
        Self {
            route_to: vec![Route::new(uri)],
            route_from: Vec::new(),
        }
    }

    /// Pop the next hop off the destination stack.
    pub fn pop_destination(&mut self) -> Option<Route> {
        self.route_to.pop()
    }

    /// The next hop without consuming it.
    pub fn next_destination(&self) -> Option<&Route> {
        self.route_to.last()
    }
}

/// Tracing metadata propagated unchanged from a request to its replies.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub parent_span_id: Option<String>,
    pub start_ns: Option<u64>,
    pub end_ns: Option<u64>,
}

/// The routed message structure.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation token. Set once per exchange, echoed on every reply.
    pub id: Option<String>,
    /// Request method, used with `resource` to derive the request topic.
    pub method: Option<i32>,
    /// Request resource.
    pub resource: Option<i32>,
    /// Topic the router expects the reply on.
    pub reply_topic: Option<String>,
    pub routing: Routing,
    /// Application-defined bytes.
    pub payload: Vec<u8>,
    /// `true` marks the terminal reply of an exchange.
    pub completed: bool,
    pub trace: Option<Trace>,
}

impl Envelope {
    /// Create an empty envelope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a request addressed by method and resource.
    pub fn request(method: i32, resource: i32, payload: Vec<u8>) -> Self {
        Self {
            method: Some(method),
            resource: Some(resource),
            payload,
            ..Self::default()
        }
    }

    /// Create an envelope routed to a single URI.
    pub fn routed_to(uri: impl Into<String>) -> Self {
        Self {
            routing: Routing::to_uri(uri),
            ..Self::default()
        }
    }

    /// Build a reply to `request`.
    ///
    /// The reply takes the request's id and trace, travels back along the
    /// request's `route_from`, and records the response's own destination as
    /// its provenance.
    pub fn reply_to(request: &Envelope, response: Envelope) -> Envelope {
        Envelope {
            id: request.id.clone(),
            trace: request.trace.clone(),
            routing: Routing {
                route_to: request.routing.route_from.clone(),
                route_from: response.routing.route_to,
            },
            ..response
        }
    }

    /// Topic a request is published on: `"{method}_{resource}"`.
    pub fn request_topic(&self) -> String {
        format!(
            "{}_{}",
            self.method.unwrap_or_default(),
            self.resource.unwrap_or_default()
        )
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Serialize `value` as JSON into the payload.
    pub fn with_json<T: Serialize>(mut self, value: &T) -> Result<Self, CodecError> {
        self.payload = serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(self)
    }

    /// Deserialize the payload as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_slice(&self.payload).map_err(|e| CodecError::Decode(e.to_string()))
    }

    pub fn completed(mut self) -> Self {
        self.completed = true;
        self
    }

    /// Push a hop onto the destination stack.
    pub fn push_route_to(mut self, route: Route) -> Self {
        self.routing.route_to.push(route);
        self
    }

    /// Push a hop onto the return path.
    pub fn push_route_from(mut self, route: Route) -> Self {
        self.routing.route_from.push(route);
        self
    }

    pub fn with_trace(mut self, trace: Trace) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Id as a string slice, empty when unset.
    pub fn id_str(&self) -> &str {
        self.id.as_deref().unwrap_or("")
    }

    /// Payload as UTF-8, if valid.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Payload of a fault reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub message: String,
}

impl ErrorReply {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        bitcode::serialize(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bitcode::deserialize(bytes)?)
    }
}
