//! Tower middleware that access-logs every gRPC call of a tonic server
//!
//! Works on the HTTP/2 exchange, so it covers every method of every service
//! without touching generated code:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use grpc_accesslog::{AccessLogLayer, AccessLogger};
//!
//! let layer = AccessLogLayer::new(Arc::new(AccessLogger::default()));
//! let server = tonic::transport::Server::builder().layer(layer);
//! ```
//!
//! The line is emitted when the response body ends, so streaming calls are
//! timed to their last message. The response size is the number of encoded
//! body bytes. A service or body that panics is logged as `UNKNOWN` before the
//! panic continues.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Buf;
use futures::FutureExt;
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use tonic::metadata::MetadataMap;
use tonic::transport::server::TcpConnectInfo;
use tonic::Code;
use tower::{Layer, Service};

use crate::config::AccessLogConfig;
use crate::context::{ByteSize, RequestInfo, ServerContext, ServicerContext};
use crate::error::Result;
use crate::invocation::PendingCall;
use crate::logger::AccessLogger;

/// Access log layer for `tonic::transport::Server`
#[derive(Debug, Clone)]
pub struct AccessLogLayer {
    logger: Arc<AccessLogger>,
}

impl AccessLogLayer {
    pub fn new(logger: Arc<AccessLogger>) -> Self {
        Self { logger }
    }

    /// Build the layer and its logger from configuration
    pub fn from_config(config: &AccessLogConfig) -> Result<Self> {
        Ok(Self::new(Arc::new(AccessLogger::from_config(config)?)))
    }
}

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService {
            inner,
            logger: self.logger.clone(),
        }
    }
}

/// Access log service implementation
#[derive(Debug, Clone)]
pub struct AccessLogService<S> {
    inner: S,
    logger: Arc<AccessLogger>,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for AccessLogService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Body + Unpin + Send + 'static,
{
    type Response = http::Response<AccessLogBody<ResBody>>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        let mut inner = self.inner.clone();

        let remote_addr = req
            .extensions()
            .get::<TcpConnectInfo>()
            .and_then(|info| info.remote_addr());
        let context: Arc<dyn ServerContext> = Arc::new(
            ServicerContext::from_addr(remote_addr)
                .with_metadata(MetadataMap::from_headers(req.headers().clone())),
        );
        let mut call = PendingCall::begin(
            self.logger.clone(),
            Arc::from(req.uri().path()),
            context.clone(),
            RequestInfo::Streaming,
        );

        Box::pin(async move {
            let response = match AssertUnwindSafe(inner.call(req)).catch_unwind().await {
                Ok(response) => response,
                Err(payload) => call.unwind(payload),
            };
            match response {
                Ok(response) => {
                    // Trailers-only responses carry the status in the headers
                    record_grpc_status(context.as_ref(), response.headers());
                    Ok(response.map(|body| AccessLogBody::new(body, call, context)))
                }
                Err(err) => {
                    context.set_code(Code::Unknown);
                    call.finish(None);
                    Err(err)
                }
            }
        })
    }
}

fn record_grpc_status(context: &dyn ServerContext, headers: &HeaderMap) {
    if let Some(status) = headers.get("grpc-status") {
        context.set_code(Code::from_bytes(status.as_bytes()));
    }
}

/// Response body that counts bytes and logs the call when it ends
pub struct AccessLogBody<B> {
    inner: B,
    bytes: usize,
    context: Arc<dyn ServerContext>,
    call: Option<PendingCall>,
}

impl<B> AccessLogBody<B> {
    fn new(inner: B, call: PendingCall, context: Arc<dyn ServerContext>) -> Self {
        Self {
            inner,
            bytes: 0,
            context,
            call: Some(call),
        }
    }

    fn finish(&mut self) {
        if let Some(call) = self.call.take() {
            call.finish(Some(&ByteSize(self.bytes)));
        }
    }
}

impl<B> fmt::Debug for AccessLogBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessLogBody")
            .field("bytes", &self.bytes)
            .field("done", &self.call.is_none())
            .finish_non_exhaustive()
    }
}

impl<B> Body for AccessLogBody<B>
where
    B: Body + Unpin,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let poll = match this.call.as_mut() {
            Some(call) => call.guard(|| Pin::new(&mut this.inner).poll_frame(cx)),
            None => Pin::new(&mut this.inner).poll_frame(cx),
        };
        let frame = ready!(poll);

        match &frame {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes = this.bytes.saturating_add(data.remaining());
                }
                if let Some(trailers) = frame.trailers_ref() {
                    record_grpc_status(this.context.as_ref(), trailers);
                }
            }
            Some(Err(_)) => {
                if this.context.code().is_none() {
                    this.context.set_code(Code::Unknown);
                }
                this.finish();
            }
            None => this.finish(),
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for AccessLogBody<B> {
    fn drop(&mut self) {
        if self.call.is_none() {
            return;
        }
        // A stream that ends without trailers was cut short
        if self.context.code().is_none() {
            self.context.set_code(Code::Cancelled);
        }
        self.finish();
    }
}
