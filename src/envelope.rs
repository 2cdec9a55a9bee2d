//! The message envelope: the unit of wire transport and pipeline propagation.
//!
//! Every call in the mesh travels as an [`Envelope`]: an opaque correlation
//! id, the target interface and method, a serialized payload, an error flag,
//! and a string map of headers used as an out-of-band control channel
//! (destination override, leader redirect, trace context).
//!
//! # Invariants
//!
//! - Every response envelope's `id` equals the `id` of exactly one
//!   outstanding request.
//! - Unknown header keys are preserved and ignored.

use std::collections::HashMap;

/// Reserved header keys understood by the mesh core.
///
/// All other keys pass through untouched.
pub mod headers {
    /// Explicit routing override: the endpoint this envelope must be sent to.
    pub const TARGET_URL: &str = "Target-Url";

    /// Leader announcement: a responding node that is not authoritative for
    /// the target service sets this to the endpoint that is.
    pub const LEADER_REDIRECT: &str = "X-Conduit-Leader-Redirect";

    /// W3C trace context, opaque pass-through.
    pub const TRACEPARENT: &str = "traceparent";

    /// W3C trace state, opaque pass-through.
    pub const TRACESTATE: &str = "tracestate";
}

/// A single request or response message.
///
/// Responses are built from their request with [`Envelope::response`] or
/// [`Envelope::error_response`] so the correlation id and trace headers are
/// carried over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Opaque correlation token, unique per in-flight call.
    pub id: String,

    /// Name of the target service contract.
    pub interface_name: String,

    /// Name of the operation on that contract.
    pub method_name: String,

    /// Serialized argument list (request) or result / error text (response).
    pub payload: Vec<u8>,

    /// When true, `payload` decodes to an error description, not a result.
    pub is_error: bool,

    /// Out-of-band control channel. See [`headers`] for reserved keys.
    pub headers: HashMap<String, String>,
}

impl Envelope {
    /// Build a request envelope with a freshly generated correlation id.
    pub fn request(
        interface_name: impl Into<String>,
        method_name: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            interface_name: interface_name.into(),
            method_name: method_name.into(),
            payload,
            is_error: false,
            headers: HashMap::new(),
        }
    }

    /// Build a successful response to `request` carrying `payload`.
    ///
    /// Copies the correlation id and the trace headers; everything else is
    /// fresh.
    pub fn response(request: &Envelope, payload: Vec<u8>) -> Self {
        Self {
            id: request.id.clone(),
            interface_name: request.interface_name.clone(),
            method_name: request.method_name.clone(),
            payload,
            is_error: false,
            headers: Self::trace_headers(request),
        }
    }

    /// Build an error response to `request` whose payload is `text`.
    ///
    /// The text travels as a JSON string so the caller side can decode it
    /// uniformly; native error structures never cross the wire.
    pub fn error_response(request: &Envelope, text: &str) -> Self {
        let mut reply = Self::response(request, Vec::new());
        reply.payload = serde_json::to_vec(text).unwrap_or_default();
        reply.is_error = true;
        reply
    }

    /// Build a redirect-only response: no payload, no error, just the leader
    /// announcement header.
    ///
    /// Callers treat this as a routing signal, not a result.
    pub fn redirect(request: &Envelope, leader: &str) -> Self {
        let mut reply = Self::response(request, Vec::new());
        reply
            .headers
            .insert(headers::LEADER_REDIRECT.to_string(), leader.to_string());
        reply
    }

    /// The explicit destination endpoint, if one has been stamped.
    pub fn target(&self) -> Option<&str> {
        self.headers
            .get(headers::TARGET_URL)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Stamp (or overwrite) the destination endpoint.
    pub fn set_target(&mut self, endpoint: &str) {
        self.headers
            .insert(headers::TARGET_URL.to_string(), endpoint.to_string());
    }

    /// The leader announced by a redirect response, if present and non-empty.
    pub fn redirect_target(&self) -> Option<&str> {
        self.headers
            .get(headers::LEADER_REDIRECT)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn trace_headers(request: &Envelope) -> HashMap<String, String> {
        let mut carried = HashMap::new();
        for key in [headers::TRACEPARENT, headers::TRACESTATE] {
            if let Some(value) = request.headers.get(key) {
                carried.insert(key.to_string(), value.clone());
            }
        }
        carried
    }
}
