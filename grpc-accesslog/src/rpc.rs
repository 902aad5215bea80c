//! RPC method handlers and shape-aware behavior wrapping
//!
//! A method handler carries exactly one behavior, in one of four shapes
//! determined by whether the request and the response are streamed. The
//! concrete callable types depend on the concurrency model, which is named
//! by a [`Flavor`].

use std::fmt;
use std::sync::Arc;

use tonic::metadata::MetadataMap;
use tonic::Status;

/// Concurrency model of a set of behaviors
///
/// Implemented by [`Blocking`](crate::server::Blocking) and
/// [`Cooperative`](crate::async_server::Cooperative).
pub trait Flavor: Send + Sync + 'static {
    /// Request message type
    type Request: Send + 'static;
    /// Response message type
    type Response: Send + 'static;

    /// Single request, single response
    type UnaryUnary: Clone + Send + Sync + 'static;
    /// Single request, streamed responses
    type UnaryStream: Clone + Send + Sync + 'static;
    /// Streamed requests, single response
    type StreamUnary: Clone + Send + Sync + 'static;
    /// Streamed requests, streamed responses
    type StreamStream: Clone + Send + Sync + 'static;
}

/// The user callable of a method, tagged by shape
pub enum Behavior<F: Flavor> {
    /// Takes one request, returns one response
    UnaryUnary(F::UnaryUnary),
    /// Takes one request, returns a response stream
    UnaryStream(F::UnaryStream),
    /// Takes a request stream, returns one response
    StreamUnary(F::StreamUnary),
    /// Takes a request stream, returns a response stream
    StreamStream(F::StreamStream),
}

impl<F: Flavor> Behavior<F> {
    /// Whether requests arrive as a stream
    pub fn request_streaming(&self) -> bool {
        matches!(self, Self::StreamUnary(_) | Self::StreamStream(_))
    }

    /// Whether responses leave as a stream
    pub fn response_streaming(&self) -> bool {
        matches!(self, Self::UnaryStream(_) | Self::StreamStream(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::UnaryUnary(_) => "unary_unary",
            Self::UnaryStream(_) => "unary_stream",
            Self::StreamUnary(_) => "stream_unary",
            Self::StreamStream(_) => "stream_stream",
        }
    }
}

impl<F: Flavor> Clone for Behavior<F> {
    fn clone(&self) -> Self {
        match self {
            Self::UnaryUnary(b) => Self::UnaryUnary(b.clone()),
            Self::UnaryStream(b) => Self::UnaryStream(b.clone()),
            Self::StreamUnary(b) => Self::StreamUnary(b.clone()),
            Self::StreamStream(b) => Self::StreamStream(b.clone()),
        }
    }
}

impl<F: Flavor> fmt::Debug for Behavior<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Decodes a request message from wire bytes
pub type RequestDeserializer<Req> = Arc<dyn Fn(&[u8]) -> Result<Req, Status> + Send + Sync>;

/// Encodes a response message to wire bytes
pub type ResponseSerializer<Resp> = Arc<dyn Fn(&Resp) -> Vec<u8> + Send + Sync>;

/// Everything the server needs to run one method
pub struct RpcMethodHandler<F: Flavor> {
    behavior: Behavior<F>,
    request_deserializer: Option<RequestDeserializer<F::Request>>,
    response_serializer: Option<ResponseSerializer<F::Response>>,
}

impl<F: Flavor> RpcMethodHandler<F> {
    fn new(behavior: Behavior<F>) -> Self {
        Self {
            behavior,
            request_deserializer: None,
            response_serializer: None,
        }
    }

    /// Handler for a method with no streaming on either side
    pub fn unary_unary(behavior: F::UnaryUnary) -> Self {
        Self::new(Behavior::UnaryUnary(behavior))
    }

    /// Handler for a server-streaming method
    pub fn unary_stream(behavior: F::UnaryStream) -> Self {
        Self::new(Behavior::UnaryStream(behavior))
    }

    /// Handler for a client-streaming method
    pub fn stream_unary(behavior: F::StreamUnary) -> Self {
        Self::new(Behavior::StreamUnary(behavior))
    }

    /// Handler for a bidirectional streaming method
    pub fn stream_stream(behavior: F::StreamStream) -> Self {
        Self::new(Behavior::StreamStream(behavior))
    }

    /// Attach the request codec
    pub fn with_request_deserializer(mut self, deserializer: RequestDeserializer<F::Request>) -> Self {
        self.request_deserializer = Some(deserializer);
        self
    }

    /// Attach the response codec
    pub fn with_response_serializer(mut self, serializer: ResponseSerializer<F::Response>) -> Self {
        self.response_serializer = Some(serializer);
        self
    }

    /// The behavior, tagged by shape
    pub fn behavior(&self) -> &Behavior<F> {
        &self.behavior
    }

    /// Consume the handler and take its behavior
    ///
    /// The codecs are dropped.
    pub fn into_behavior(self) -> Behavior<F> {
        self.behavior
    }

    /// Whether the method takes a request stream
    pub fn request_streaming(&self) -> bool {
        self.behavior.request_streaming()
    }

    /// Whether the method returns a response stream
    pub fn response_streaming(&self) -> bool {
        self.behavior.response_streaming()
    }

    /// Request codec, if one was attached
    pub fn request_deserializer(&self) -> Option<&RequestDeserializer<F::Request>> {
        self.request_deserializer.as_ref()
    }

    /// Response codec, if one was attached
    pub fn response_serializer(&self) -> Option<&ResponseSerializer<F::Response>> {
        self.response_serializer.as_ref()
    }
}

impl<F: Flavor> Clone for RpcMethodHandler<F> {
    fn clone(&self) -> Self {
        Self {
            behavior: self.behavior.clone(),
            request_deserializer: self.request_deserializer.clone(),
            response_serializer: self.response_serializer.clone(),
        }
    }
}

impl<F: Flavor> fmt::Debug for RpcMethodHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcMethodHandler")
            .field("behavior", &self.behavior)
            .field("request_deserializer", &self.request_deserializer.is_some())
            .field("response_serializer", &self.response_serializer.is_some())
            .finish()
    }
}

/// What an interceptor learns about a call before it is dispatched
#[derive(Debug, Clone)]
pub struct HandlerCallDetails {
    /// Fully qualified method, e.g. `/package.Service/Method`
    pub method: String,
    /// Metadata sent by the client
    pub invocation_metadata: MetadataMap,
}

impl HandlerCallDetails {
    /// Details for a call to `method` with no metadata
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            invocation_metadata: MetadataMap::new(),
        }
    }

    /// Replace the client metadata
    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.invocation_metadata = metadata;
        self
    }
}

/// Replaces a behavior with one of the same shape
///
/// Which method is called tells the wrapper whether requests and responses
/// are streamed.
pub trait BehaviorWrapper<F: Flavor> {
    fn wrap_unary_unary(&self, behavior: F::UnaryUnary) -> F::UnaryUnary;
    fn wrap_unary_stream(&self, behavior: F::UnaryStream) -> F::UnaryStream;
    fn wrap_stream_unary(&self, behavior: F::StreamUnary) -> F::StreamUnary;
    fn wrap_stream_stream(&self, behavior: F::StreamStream) -> F::StreamStream;
}

/// Rewrap the behavior of a handler, keeping its shape and codecs
///
/// An absent handler stays absent and the wrapper is not consulted. The
/// original behavior is handed to the wrapper, never invoked here.
pub fn wrap_rpc_behavior<F, W>(
    handler: Option<RpcMethodHandler<F>>,
    wrapper: &W,
) -> Option<RpcMethodHandler<F>>
where
    F: Flavor,
    W: BehaviorWrapper<F> + ?Sized,
{
    let handler = handler?;

    let behavior = match handler.behavior {
        Behavior::UnaryUnary(b) => Behavior::UnaryUnary(wrapper.wrap_unary_unary(b)),
        Behavior::UnaryStream(b) => Behavior::UnaryStream(wrapper.wrap_unary_stream(b)),
        Behavior::StreamUnary(b) => Behavior::StreamUnary(wrapper.wrap_stream_unary(b)),
        Behavior::StreamStream(b) => Behavior::StreamStream(wrapper.wrap_stream_stream(b)),
    };

    Some(RpcMethodHandler {
        behavior,
        request_deserializer: handler.request_deserializer,
        response_serializer: handler.response_serializer,
    })
}
