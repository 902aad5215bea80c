//! Per-call data handed to access log handlers
//!
//! A [`CallContext`] is assembled once per RPC invocation, after the call has
//! completed, and lives only for the duration of a single
//! [`AccessLogger::log`](crate::logger::AccessLogger::log) call.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};

use chrono::{DateTime, Utc};
use tonic::metadata::MetadataMap;
use tonic::Code;

/// Framework-provided state for one call, read by access log handlers
///
/// The outcome slot (`code` / `set_code`) is the explicit channel through
/// which the business logic, the interceptor (on failure) or the transport
/// (from `grpc-status`) report how the call ended.
pub trait ServerContext: Send + Sync {
    /// Peer address in gRPC form, e.g. `ipv4:192.168.0.1:58111`
    fn peer(&self) -> String;

    /// Metadata sent by the client with the call
    fn invocation_metadata(&self) -> &MetadataMap;

    /// Outcome code recorded for the call, if any
    fn code(&self) -> Option<Code>;

    /// Record the outcome code for the call
    fn set_code(&self, code: Code);
}

const NO_CODE: i32 = -1;

/// Default [`ServerContext`] implementation
#[derive(Debug)]
pub struct ServicerContext {
    peer: String,
    metadata: MetadataMap,
    code: AtomicI32,
}

impl ServicerContext {
    /// Create a context for the given peer with empty metadata
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            metadata: MetadataMap::new(),
            code: AtomicI32::new(NO_CODE),
        }
    }

    /// Create a context from a socket address, rendered in gRPC peer form
    pub fn from_addr(addr: Option<SocketAddr>) -> Self {
        Self::new(format_peer(addr))
    }

    /// Attach the client's invocation metadata
    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = metadata;
        self
    }
}

impl ServerContext for ServicerContext {
    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn invocation_metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    fn code(&self) -> Option<Code> {
        match self.code.load(Ordering::Acquire) {
            NO_CODE => None,
            code => Some(Code::from_i32(code)),
        }
    }

    fn set_code(&self, code: Code) {
        self.code.store(code as i32, Ordering::Release);
    }
}

/// Render a socket address the way gRPC reports peers
pub fn format_peer(addr: Option<SocketAddr>) -> String {
    match addr {
        Some(SocketAddr::V4(addr)) => format!("ipv4:{}:{}", addr.ip(), addr.port()),
        Some(SocketAddr::V6(addr)) => format!("ipv6:[{}]:{}", addr.ip(), addr.port()),
        None => "unknown".to_string(),
    }
}

/// A message whose serialized size can be measured
pub trait Payload {
    /// Serialized size in bytes, if measurable
    fn byte_size(&self) -> Option<usize>;
}

impl<M: prost::Message> Payload for M {
    fn byte_size(&self) -> Option<usize> {
        Some(self.encoded_len())
    }
}

/// A payload known only by its encoded length
///
/// Used where the message itself is gone, e.g. after the transport has
/// already framed it onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSize(pub usize);

impl Payload for ByteSize {
    fn byte_size(&self) -> Option<usize> {
        Some(self.0)
    }
}

/// What the interceptor can observe about a request without consuming it
///
/// The request value itself is moved into the user behavior, so only a
/// summary captured before the call is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestInfo {
    /// A single request message and its serialized size
    Unary {
        /// Serialized size in bytes, if measurable
        byte_size: Option<usize>,
    },
    /// A request stream, passed through to the behavior untouched
    Streaming,
}

impl RequestInfo {
    /// Summarize a single request message
    pub fn unary(request: &dyn Payload) -> Self {
        Self::Unary {
            byte_size: request.byte_size(),
        }
    }

    /// Whether the request side of the call is a stream
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming)
    }
}

/// Data available to access log handlers for one completed call
#[derive(Clone, Copy)]
pub struct CallContext<'a> {
    /// Framework state for the call
    pub server_context: &'a dyn ServerContext,
    /// Fully qualified method, e.g. `/package.Service/Method`
    pub method_name: &'a str,
    /// Request summary
    pub request: RequestInfo,
    /// Single response message; always `None` for streaming responses
    pub response: Option<&'a dyn Payload>,
    /// When the behavior was invoked
    pub start: DateTime<Utc>,
    /// When the last unit of work completed
    pub end: DateTime<Utc>,
}
