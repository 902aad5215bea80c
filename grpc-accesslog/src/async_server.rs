//! Access logging for the cooperative (async) server model
//!
//! Behaviors return boxed futures and streams. The wrapper never blocks: it
//! records the call around `.await` and `poll_next`, and a call whose future
//! or stream is dropped early is still logged once. A response stream
//! behavior is not invoked until the stream is first polled, but the call's
//! start time is taken when the wrapper is called.
//!
//! A behavior that panics, while being called or polled, is logged as
//! `UNKNOWN` and the panic continues unchanged to the caller.

use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use futures::FutureExt;
use tonic::Status;

use crate::config::AccessLogConfig;
use crate::context::{Payload, RequestInfo, ServerContext};
use crate::error::Result;
use crate::invocation::PendingCall;
use crate::logger::AccessLogger;
use crate::rpc::{
    wrap_rpc_behavior, BehaviorWrapper, Flavor, HandlerCallDetails, RpcMethodHandler,
};

/// Incoming request messages of a client-streaming call
pub type RequestStream<T> = BoxStream<'static, T>;

/// Outgoing response messages of a server-streaming call
pub type ResponseStream<T> = BoxStream<'static, std::result::Result<T, Status>>;

/// Pending single response
pub type ResponseFuture<T> = BoxFuture<'static, std::result::Result<T, Status>>;

pub type UnaryUnaryFn<Req, Resp> =
    Arc<dyn Fn(Req, Arc<dyn ServerContext>) -> ResponseFuture<Resp> + Send + Sync>;

pub type UnaryStreamFn<Req, Resp> =
    Arc<dyn Fn(Req, Arc<dyn ServerContext>) -> ResponseStream<Resp> + Send + Sync>;

pub type StreamUnaryFn<Req, Resp> =
    Arc<dyn Fn(RequestStream<Req>, Arc<dyn ServerContext>) -> ResponseFuture<Resp> + Send + Sync>;

pub type StreamStreamFn<Req, Resp> =
    Arc<dyn Fn(RequestStream<Req>, Arc<dyn ServerContext>) -> ResponseStream<Resp> + Send + Sync>;

/// The cooperative concurrency model
pub struct Cooperative<Req, Resp>(PhantomData<fn() -> (Req, Resp)>);

impl<Req, Resp> Flavor for Cooperative<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Request = Req;
    type Response = Resp;
    type UnaryUnary = UnaryUnaryFn<Req, Resp>;
    type UnaryStream = UnaryStreamFn<Req, Resp>;
    type StreamUnary = StreamUnaryFn<Req, Resp>;
    type StreamStream = StreamStreamFn<Req, Resp>;
}

/// Build a unary-unary handler from an async closure
pub fn unary_unary<Req, Resp, B, Fut>(behavior: B) -> RpcMethodHandler<Cooperative<Req, Resp>>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    B: Fn(Req, Arc<dyn ServerContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Resp, Status>> + Send + 'static,
{
    let behavior: UnaryUnaryFn<Req, Resp> =
        Arc::new(move |request: Req, context: Arc<dyn ServerContext>| {
            behavior(request, context).boxed()
        });
    RpcMethodHandler::unary_unary(behavior)
}

/// Build a unary-stream handler from a closure returning a stream
pub fn unary_stream<Req, Resp, B, S>(behavior: B) -> RpcMethodHandler<Cooperative<Req, Resp>>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    B: Fn(Req, Arc<dyn ServerContext>) -> S + Send + Sync + 'static,
    S: Stream<Item = std::result::Result<Resp, Status>> + Send + 'static,
{
    let behavior: UnaryStreamFn<Req, Resp> =
        Arc::new(move |request: Req, context: Arc<dyn ServerContext>| {
            behavior(request, context).boxed()
        });
    RpcMethodHandler::unary_stream(behavior)
}

/// Build a stream-unary handler from an async closure
pub fn stream_unary<Req, Resp, B, Fut>(behavior: B) -> RpcMethodHandler<Cooperative<Req, Resp>>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    B: Fn(RequestStream<Req>, Arc<dyn ServerContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Resp, Status>> + Send + 'static,
{
    let behavior: StreamUnaryFn<Req, Resp> =
        Arc::new(move |requests: RequestStream<Req>, context: Arc<dyn ServerContext>| {
            behavior(requests, context).boxed()
        });
    RpcMethodHandler::stream_unary(behavior)
}

/// Build a stream-stream handler from a closure returning a stream
pub fn stream_stream<Req, Resp, B, S>(behavior: B) -> RpcMethodHandler<Cooperative<Req, Resp>>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    B: Fn(RequestStream<Req>, Arc<dyn ServerContext>) -> S + Send + Sync + 'static,
    S: Stream<Item = std::result::Result<Resp, Status>> + Send + 'static,
{
    let behavior: StreamStreamFn<Req, Resp> =
        Arc::new(move |requests: RequestStream<Req>, context: Arc<dyn ServerContext>| {
            behavior(requests, context).boxed()
        });
    RpcMethodHandler::stream_stream(behavior)
}

/// Resolves the handler for a call; supplied by the server
pub type AsyncContinuation<F> =
    Box<dyn FnOnce(HandlerCallDetails) -> BoxFuture<'static, Option<RpcMethodHandler<F>>> + Send>;

/// Async hook run by the server for every incoming call
#[async_trait]
pub trait AsyncServerInterceptor<F: Flavor>: Send + Sync {
    async fn intercept_service(
        &self,
        continuation: AsyncContinuation<F>,
        details: &HandlerCallDetails,
    ) -> Option<RpcMethodHandler<F>>;
}

/// Emits one access log line per call, without blocking the executor
#[derive(Debug, Clone)]
pub struct AsyncAccessLogInterceptor {
    logger: Arc<AccessLogger>,
}

impl AsyncAccessLogInterceptor {
    pub fn new(logger: Arc<AccessLogger>) -> Self {
        Self { logger }
    }

    /// Build the interceptor and its logger from configuration
    pub fn from_config(config: &AccessLogConfig) -> Result<Self> {
        Ok(Self::new(Arc::new(AccessLogger::from_config(config)?)))
    }

    pub fn logger(&self) -> &Arc<AccessLogger> {
        &self.logger
    }
}

impl Default for AsyncAccessLogInterceptor {
    fn default() -> Self {
        Self::new(Arc::new(AccessLogger::default()))
    }
}

#[async_trait]
impl<Req, Resp> AsyncServerInterceptor<Cooperative<Req, Resp>> for AsyncAccessLogInterceptor
where
    Req: Payload + Send + 'static,
    Resp: Payload + Send + 'static,
{
    async fn intercept_service(
        &self,
        continuation: AsyncContinuation<Cooperative<Req, Resp>>,
        details: &HandlerCallDetails,
    ) -> Option<RpcMethodHandler<Cooperative<Req, Resp>>> {
        let handler = continuation(details.clone()).await;
        let wrapper = CallLogging {
            logger: self.logger.clone(),
            method: Arc::from(details.method.as_str()),
        };
        wrap_rpc_behavior(handler, &wrapper)
    }
}

#[derive(Clone)]
struct CallLogging {
    logger: Arc<AccessLogger>,
    method: Arc<str>,
}

impl CallLogging {
    fn begin(&self, context: &Arc<dyn ServerContext>, request: RequestInfo) -> PendingCall {
        PendingCall::begin(
            self.logger.clone(),
            self.method.clone(),
            context.clone(),
            request,
        )
    }
}

impl<Req, Resp> BehaviorWrapper<Cooperative<Req, Resp>> for CallLogging
where
    Req: Payload + Send + 'static,
    Resp: Payload + Send + 'static,
{
    fn wrap_unary_unary(&self, behavior: UnaryUnaryFn<Req, Resp>) -> UnaryUnaryFn<Req, Resp> {
        let this = self.clone();
        Arc::new(move |request: Req, context: Arc<dyn ServerContext>| {
            let mut call = this.begin(&context, RequestInfo::unary(&request));
            let response = call.guard(|| behavior(request, context));
            logged_response(response, call)
        })
    }

    fn wrap_unary_stream(&self, behavior: UnaryStreamFn<Req, Resp>) -> UnaryStreamFn<Req, Resp> {
        let this = self.clone();
        Arc::new(move |request: Req, context: Arc<dyn ServerContext>| {
            let call = this.begin(&context, RequestInfo::unary(&request));
            let behavior = behavior.clone();
            LoggedStream::new(Box::new(move || behavior(request, context)), call).boxed()
        })
    }

    fn wrap_stream_unary(&self, behavior: StreamUnaryFn<Req, Resp>) -> StreamUnaryFn<Req, Resp> {
        let this = self.clone();
        Arc::new(move |requests: RequestStream<Req>, context: Arc<dyn ServerContext>| {
            let mut call = this.begin(&context, RequestInfo::Streaming);
            let response = call.guard(|| behavior(requests, context));
            logged_response(response, call)
        })
    }

    fn wrap_stream_stream(&self, behavior: StreamStreamFn<Req, Resp>) -> StreamStreamFn<Req, Resp> {
        let this = self.clone();
        Arc::new(move |requests: RequestStream<Req>, context: Arc<dyn ServerContext>| {
            let call = this.begin(&context, RequestInfo::Streaming);
            let behavior = behavior.clone();
            LoggedStream::new(Box::new(move || behavior(requests, context)), call).boxed()
        })
    }
}

/// Await a single response and close the call with its outcome
fn logged_response<Resp>(response: ResponseFuture<Resp>, mut call: PendingCall) -> ResponseFuture<Resp>
where
    Resp: Payload + Send + 'static,
{
    async move {
        match AssertUnwindSafe(response).catch_unwind().await {
            Ok(result) => call.complete(result),
            Err(payload) => call.unwind(payload),
        }
    }
    .boxed()
}

/// Starts the behavior's response stream
type StartStream<T> = Box<dyn FnOnce() -> ResponseStream<T> + Send>;

/// Re-yields a response stream and closes the call when it ends
///
/// The behavior runs on the first `poll_next`.
struct LoggedStream<T> {
    start: Option<StartStream<T>>,
    inner: ResponseStream<T>,
    call: Option<PendingCall>,
}

impl<T: Send + 'static> LoggedStream<T> {
    fn new(start: StartStream<T>, call: PendingCall) -> Self {
        Self {
            start: Some(start),
            inner: futures::stream::empty().boxed(),
            call: Some(call),
        }
    }
}

impl<T> Stream for LoggedStream<T> {
    type Item = std::result::Result<T, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Self { start, inner, call } = self.get_mut();
        let poll = match call.as_mut() {
            Some(pending) => pending.guard(|| {
                if let Some(start) = start.take() {
                    *inner = start();
                }
                inner.poll_next_unpin(cx)
            }),
            None => inner.poll_next_unpin(cx),
        };
        let item = futures::ready!(poll);

        match &item {
            Some(Ok(_)) => {}
            Some(Err(status)) => {
                if let Some(call) = call.take() {
                    call.fail(status);
                }
            }
            None => {
                if let Some(call) = call.take() {
                    call.finish(None);
                }
            }
        }

        Poll::Ready(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.start {
            Some(_) => (0, None),
            None => self.inner.size_hint(),
        }
    }
}
