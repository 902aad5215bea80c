//! Access logging for the blocking (thread per call) server model
//!
//! Behaviors are plain closures run on the worker thread that received the
//! call. Streams are iterators, pulled by the same thread. A response stream
//! behavior is not invoked until its first message is pulled, but the call's
//! start time is taken when the wrapper is called.
//!
//! A behavior that panics is logged as `UNKNOWN` and the panic continues
//! unchanged to the caller.

use std::marker::PhantomData;
use std::sync::Arc;

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
pub type RequestStream<T> = Box<dyn Iterator<Item = T> + Send>;

/// Outgoing response messages of a server-streaming call
pub type ResponseStream<T> = Box<dyn Iterator<Item = std::result::Result<T, Status>> + Send>;

pub type UnaryUnaryFn<Req, Resp> =
    Arc<dyn Fn(Req, Arc<dyn ServerContext>) -> std::result::Result<Resp, Status> + Send + Sync>;

pub type UnaryStreamFn<Req, Resp> =
    Arc<dyn Fn(Req, Arc<dyn ServerContext>) -> ResponseStream<Resp> + Send + Sync>;

pub type StreamUnaryFn<Req, Resp> = Arc<
    dyn Fn(RequestStream<Req>, Arc<dyn ServerContext>) -> std::result::Result<Resp, Status>
        + Send
        + Sync,
>;

pub type StreamStreamFn<Req, Resp> =
    Arc<dyn Fn(RequestStream<Req>, Arc<dyn ServerContext>) -> ResponseStream<Resp> + Send + Sync>;

/// The blocking concurrency model
pub struct Blocking<Req, Resp>(PhantomData<fn() -> (Req, Resp)>);

impl<Req, Resp> Flavor for Blocking<Req, Resp>
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

/// Build a unary-unary handler from a closure
pub fn unary_unary<Req, Resp, B>(behavior: B) -> RpcMethodHandler<Blocking<Req, Resp>>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    B: Fn(Req, Arc<dyn ServerContext>) -> std::result::Result<Resp, Status> + Send + Sync + 'static,
{
    let behavior: UnaryUnaryFn<Req, Resp> = Arc::new(behavior);
    RpcMethodHandler::unary_unary(behavior)
}

/// Build a unary-stream handler from a closure
pub fn unary_stream<Req, Resp, B>(behavior: B) -> RpcMethodHandler<Blocking<Req, Resp>>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    B: Fn(Req, Arc<dyn ServerContext>) -> ResponseStream<Resp> + Send + Sync + 'static,
{
    let behavior: UnaryStreamFn<Req, Resp> = Arc::new(behavior);
    RpcMethodHandler::unary_stream(behavior)
}

/// Build a stream-unary handler from a closure
pub fn stream_unary<Req, Resp, B>(behavior: B) -> RpcMethodHandler<Blocking<Req, Resp>>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    B: Fn(RequestStream<Req>, Arc<dyn ServerContext>) -> std::result::Result<Resp, Status>
        + Send
        + Sync
        + 'static,
{
    let behavior: StreamUnaryFn<Req, Resp> = Arc::new(behavior);
    RpcMethodHandler::stream_unary(behavior)
}

/// Build a stream-stream handler from a closure
pub fn stream_stream<Req, Resp, B>(behavior: B) -> RpcMethodHandler<Blocking<Req, Resp>>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    B: Fn(RequestStream<Req>, Arc<dyn ServerContext>) -> ResponseStream<Resp> + Send + Sync + 'static,
{
    let behavior: StreamStreamFn<Req, Resp> = Arc::new(behavior);
    RpcMethodHandler::stream_stream(behavior)
}

/// Resolves the handler for a call; supplied by the server
pub type Continuation<'a, F> =
    Box<dyn FnOnce(&HandlerCallDetails) -> Option<RpcMethodHandler<F>> + 'a>;

/// Hook run by the server for every incoming call
pub trait ServerInterceptor<F: Flavor>: Send + Sync {
    /// Return the handler to run for the call, usually a wrapped version of
    /// what `continuation` resolves
    fn intercept_service(
        &self,
        continuation: Continuation<'_, F>,
        details: &HandlerCallDetails,
    ) -> Option<RpcMethodHandler<F>>;
}

/// Emits one access log line per call
#[derive(Debug, Clone)]
pub struct AccessLogInterceptor {
    logger: Arc<AccessLogger>,
}

impl AccessLogInterceptor {
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

impl Default for AccessLogInterceptor {
    fn default() -> Self {
        Self::new(Arc::new(AccessLogger::default()))
    }
}

impl<Req, Resp> ServerInterceptor<Blocking<Req, Resp>> for AccessLogInterceptor
where
    Req: Payload + Send + 'static,
    Resp: Payload + Send + 'static,
{
    fn intercept_service(
        &self,
        continuation: Continuation<'_, Blocking<Req, Resp>>,
        details: &HandlerCallDetails,
    ) -> Option<RpcMethodHandler<Blocking<Req, Resp>>> {
        let handler = continuation(details);
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

impl<Req, Resp> BehaviorWrapper<Blocking<Req, Resp>> for CallLogging
where
    Req: Payload + Send + 'static,
    Resp: Payload + Send + 'static,
{
    fn wrap_unary_unary(&self, behavior: UnaryUnaryFn<Req, Resp>) -> UnaryUnaryFn<Req, Resp> {
        let this = self.clone();
        Arc::new(move |request: Req, context: Arc<dyn ServerContext>| {
            let mut call = this.begin(&context, RequestInfo::unary(&request));
            let result = call.guard(|| behavior(request, context));
            call.complete(result)
        })
    }

    fn wrap_unary_stream(&self, behavior: UnaryStreamFn<Req, Resp>) -> UnaryStreamFn<Req, Resp> {
        let this = self.clone();
        Arc::new(move |request: Req, context: Arc<dyn ServerContext>| {
            let call = this.begin(&context, RequestInfo::unary(&request));
            let behavior = behavior.clone();
            Box::new(LoggedIter::new(
                Box::new(move || behavior(request, context)),
                call,
            )) as ResponseStream<Resp>
        })
    }

    fn wrap_stream_unary(&self, behavior: StreamUnaryFn<Req, Resp>) -> StreamUnaryFn<Req, Resp> {
        let this = self.clone();
        Arc::new(move |requests: RequestStream<Req>, context: Arc<dyn ServerContext>| {
            let mut call = this.begin(&context, RequestInfo::Streaming);
            let result = call.guard(|| behavior(requests, context));
            call.complete(result)
        })
    }

    fn wrap_stream_stream(&self, behavior: StreamStreamFn<Req, Resp>) -> StreamStreamFn<Req, Resp> {
        let this = self.clone();
        Arc::new(move |requests: RequestStream<Req>, context: Arc<dyn ServerContext>| {
            let call = this.begin(&context, RequestInfo::Streaming);
            let behavior = behavior.clone();
            Box::new(LoggedIter::new(
                Box::new(move || behavior(requests, context)),
                call,
            )) as ResponseStream<Resp>
        })
    }
}

/// Starts the behavior's response stream
type StartStream<T> = Box<dyn FnOnce() -> ResponseStream<T> + Send>;

/// Re-yields a response stream and closes the call when it ends
///
/// The behavior runs on the first `next`.
struct LoggedIter<T> {
    start: Option<StartStream<T>>,
    inner: ResponseStream<T>,
    call: Option<PendingCall>,
}

impl<T: 'static> LoggedIter<T> {
    fn new(start: StartStream<T>, call: PendingCall) -> Self {
        Self {
            start: Some(start),
            inner: Box::new(std::iter::empty()),
            call: Some(call),
        }
    }
}

impl<T> Iterator for LoggedIter<T> {
    type Item = std::result::Result<T, Status>;

    fn next(&mut self) -> Option<Self::Item> {
        let Self { start, inner, call } = self;
        let item = match call.as_mut() {
            Some(call) => call.guard(|| {
                if let Some(start) = start.take() {
                    *inner = start();
                }
                inner.next()
            }),
            None => inner.next(),
        };

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
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ServicerContext;
    use crate::handlers::{self, from_fn};
    use crate::logger::{capturing_logger, MemorySink};
    use crate::rpc::Behavior;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tonic::Code;

    type Handler = RpcMethodHandler<Blocking<String, String>>;

    const METHOD: &str = "/abc.test/GetTest";

    fn interceptor() -> (AccessLogInterceptor, Arc<MemorySink>) {
        let (logger, sink) = capturing_logger(vec![
            from_fn(handlers::request),
            from_fn(handlers::status),
            from_fn(handlers::response_size),
        ]);
        (AccessLogInterceptor::new(logger), sink)
    }

    fn intercept(interceptor: &AccessLogInterceptor, handler: Handler) -> Handler {
        let details = HandlerCallDetails::new(METHOD);
        interceptor
            .intercept_service(Box::new(move |_: &HandlerCallDetails| Some(handler)), &details)
            .unwrap()
    }

    fn context() -> Arc<dyn ServerContext> {
        Arc::new(ServicerContext::new("ipv4:192.168.0.1:58111"))
    }

    fn requests(items: &[&str]) -> RequestStream<String> {
        Box::new(
            items
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .into_iter(),
        )
    }

    fn echo_stream(items: Vec<String>) -> ResponseStream<String> {
        Box::new(items.into_iter().map(Ok::<String, Status>))
    }

    #[test]
    fn test_unary_unary_logs_once() {
        let (interceptor, sink) = interceptor();
        let handler = intercept(&interceptor, unary_unary(|req: String, _ctx| Ok(req)));

        let Behavior::UnaryUnary(behavior) = handler.into_behavior() else {
            panic!("shape changed");
        };
        let response = behavior("data".to_string(), context()).unwrap();

        assert_eq!(response, "data");
        // "data" encodes to 6 bytes as a protobuf string
        assert_eq!(sink.lines(), vec!["/abc.test/GetTest OK 6"]);
    }

    #[test]
    fn test_unary_stream_logs_after_exhaustion() {
        let (interceptor, sink) = interceptor();
        let handler = intercept(
            &interceptor,
            unary_stream(|req: String, _ctx| echo_stream(vec![req; 4])),
        );

        let Behavior::UnaryStream(behavior) = handler.into_behavior() else {
            panic!("shape changed");
        };
        let mut responses = behavior("x".to_string(), context());

        for _ in 0..3 {
            assert_eq!(responses.next().unwrap().unwrap(), "x");
        }
        assert!(sink.lines().is_empty());

        assert!(responses.next().is_some());
        assert!(responses.next().is_none());
        assert_eq!(sink.lines(), vec!["/abc.test/GetTest OK 0"]);

        // Polling past the end does not log again
        assert!(responses.next().is_none());
        drop(responses);
        assert_eq!(sink.lines().len(), 1);
    }

    #[test]
    fn test_stream_unary_logs_once() {
        let (interceptor, sink) = interceptor();
        let handler = intercept(
            &interceptor,
            stream_unary(|reqs: RequestStream<String>, _ctx| Ok(reqs.collect::<Vec<_>>().join(""))),
        );

        let Behavior::StreamUnary(behavior) = handler.into_behavior() else {
            panic!("shape changed");
        };
        let response = behavior(requests(&["a", "b", "c"]), context()).unwrap();

        assert_eq!(response, "abc");
        assert_eq!(sink.lines(), vec!["/abc.test/GetTest OK 5"]);
    }

    #[test]
    fn test_stream_stream_logs_once() {
        let (interceptor, sink) = interceptor();
        let handler = intercept(
            &interceptor,
            stream_stream(|reqs: RequestStream<String>, _ctx| echo_stream(reqs.collect())),
        );

        let Behavior::StreamStream(behavior) = handler.into_behavior() else {
            panic!("shape changed");
        };
        let responses: Vec<String> = behavior(requests(&["a", "b"]), context())
            .collect::<std::result::Result<_, _>>()
            .unwrap();

        assert_eq!(responses, vec!["a", "b"]);
        assert_eq!(sink.lines(), vec!["/abc.test/GetTest OK 0"]);
    }

    #[test]
    fn test_unary_failure_logged_and_propagated() {
        let (interceptor, sink) = interceptor();
        let handler = intercept(
            &interceptor,
            unary_unary(|_req: String, _ctx| Err(Status::not_found("no such test"))),
        );

        let Behavior::UnaryUnary(behavior) = handler.into_behavior() else {
            panic!("shape changed");
        };
        let err = behavior("data".to_string(), context()).unwrap_err();

        assert_eq!(err.code(), Code::NotFound);
        assert_eq!(err.message(), "no such test");
        assert_eq!(sink.lines(), vec!["/abc.test/GetTest NOT_FOUND 0"]);
    }

    #[test]
    fn test_stream_failure_logged_once() {
        let (interceptor, sink) = interceptor();
        let handler = intercept(
            &interceptor,
            unary_stream(|_req: String, _ctx| {
                Box::new(
                    vec![Ok("a".to_string()), Err(Status::internal("broken"))].into_iter(),
                ) as ResponseStream<String>
            }),
        );

        let Behavior::UnaryStream(behavior) = handler.into_behavior() else {
            panic!("shape changed");
        };
        let mut responses = behavior("x".to_string(), context());

        assert!(responses.next().unwrap().is_ok());
        assert_eq!(responses.next().unwrap().unwrap_err().code(), Code::Internal);
        assert_eq!(sink.lines(), vec!["/abc.test/GetTest INTERNAL 0"]);

        drop(responses);
        assert_eq!(sink.lines().len(), 1);
    }

    #[test]
    fn test_dropped_stream_logged_as_cancelled() {
        let (interceptor, sink) = interceptor();
        let handler = intercept(
            &interceptor,
            unary_stream(|req: String, _ctx| echo_stream(vec![req; 4])),
        );

        let Behavior::UnaryStream(behavior) = handler.into_behavior() else {
            panic!("shape changed");
        };
        let mut responses = behavior("x".to_string(), context());
        responses.next();
        assert!(sink.lines().is_empty());

        drop(responses);
        assert_eq!(sink.lines(), vec!["/abc.test/GetTest CANCELLED 0"]);
    }

    #[test]
    fn test_status_set_by_behavior_is_logged() {
        let (interceptor, sink) = interceptor();
        let handler = intercept(
            &interceptor,
            unary_unary(|req: String, ctx: Arc<dyn ServerContext>| {
                ctx.set_code(Code::AlreadyExists);
                Ok(req)
            }),
        );

        let Behavior::UnaryUnary(behavior) = handler.into_behavior() else {
            panic!("shape changed");
        };
        behavior(String::new(), context()).unwrap();

        assert_eq!(sink.lines(), vec!["/abc.test/GetTest ALREADY_EXISTS 0"]);
    }

    #[test]
    fn test_absent_handler_not_logged() {
        let (interceptor, sink) = interceptor();
        let details = HandlerCallDetails::new(METHOD);

        let handler: Option<Handler> = interceptor.intercept_service(Box::new(|_: &HandlerCallDetails| None), &details);

        assert!(handler.is_none());
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn test_no_handlers_no_output() {
        let (logger, sink) = capturing_logger(Vec::new());
        let interceptor = AccessLogInterceptor::new(logger);
        let handler = intercept(&interceptor, unary_unary(|req: String, _ctx| Ok(req)));

        let Behavior::UnaryUnary(behavior) = handler.into_behavior() else {
            panic!("shape changed");
        };
        assert_eq!(behavior("data".to_string(), context()).unwrap(), "data");
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn test_continuation_sees_call_details() {
        let (interceptor, _sink) = interceptor();
        let details = HandlerCallDetails::new(METHOD);

        let handler: Option<Handler> = interceptor.intercept_service(
            Box::new(|details: &HandlerCallDetails| {
                assert_eq!(details.method, METHOD);
                Some(unary_unary(|req: String, _ctx| Ok(req)))
            }),
            &details,
        );

        assert!(!handler.unwrap().response_streaming());
    }

    #[test]
    fn test_unary_panic_logged_once() {
        let (interceptor, sink) = interceptor();
        let handler = intercept(
            &interceptor,
            unary_unary(|_req: String, _ctx| -> std::result::Result<String, Status> {
                panic!("boom")
            }),
        );

        let Behavior::UnaryUnary(behavior) = handler.into_behavior() else {
            panic!("shape changed");
        };
        let payload = panic::catch_unwind(AssertUnwindSafe(|| {
            behavior("data".to_string(), context())
        }))
        .unwrap_err();

        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
        assert_eq!(sink.lines(), vec!["/abc.test/GetTest UNKNOWN 0"]);
    }

    #[test]
    fn test_stream_panic_logged_once() {
        let (interceptor, sink) = interceptor();
        let handler = intercept(
            &interceptor,
            unary_stream(|req: String, _ctx| -> ResponseStream<String> {
                Box::new((0..2).map(move |i| {
                    if i == 1 {
                        panic!("boom");
                    }
                    Ok(req.clone())
                }))
            }),
        );

        let Behavior::UnaryStream(behavior) = handler.into_behavior() else {
            panic!("shape changed");
        };
        let mut responses = behavior("x".to_string(), context());
        assert_eq!(responses.next().unwrap().unwrap(), "x");

        let result = panic::catch_unwind(AssertUnwindSafe(|| responses.next()));
        assert!(result.is_err());
        assert_eq!(sink.lines(), vec!["/abc.test/GetTest UNKNOWN 0"]);

        drop(responses);
        assert_eq!(sink.lines().len(), 1);
    }

    #[test]
    fn test_stream_behavior_starts_on_first_pull() {
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        let (interceptor, sink) = interceptor();
        let handler = intercept(
            &interceptor,
            unary_stream(move |req: String, _ctx| {
                flag.store(true, Ordering::SeqCst);
                echo_stream(vec![req])
            }),
        );

        let Behavior::UnaryStream(behavior) = handler.into_behavior() else {
            panic!("shape changed");
        };
        let mut responses = behavior("x".to_string(), context());
        assert!(!started.load(Ordering::SeqCst));

        assert_eq!(responses.next().unwrap().unwrap(), "x");
        assert!(started.load(Ordering::SeqCst));
        assert!(responses.next().is_none());
        assert_eq!(sink.lines(), vec!["/abc.test/GetTest OK 0"]);
    }

    #[test]
    fn test_unstarted_stream_logged_as_cancelled() {
        let (interceptor, sink) = interceptor();
        let handler = intercept(
            &interceptor,
            stream_stream(|reqs: RequestStream<String>, _ctx| -> ResponseStream<String> {
                Box::new(reqs.map(Ok))
            }),
        );

        let Behavior::StreamStream(behavior) = handler.into_behavior() else {
            panic!("shape changed");
        };
        drop(behavior(requests(&["a"]), context()));

        assert_eq!(sink.lines(), vec!["/abc.test/GetTest CANCELLED 0"]);
    }
}
