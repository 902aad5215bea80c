//! # grpc-accesslog
//!
//! Access logging for gRPC servers: one line per call, in the spirit of the
//! HTTP combined log format, for unary and streaming methods alike.
//!
//! ## Features
//!
//! - **Interceptors**: blocking ([`AccessLogInterceptor`]) and async
//!   ([`AsyncAccessLogInterceptor`]) variants that wrap any of the four RPC
//!   shapes and log exactly once per call, including failed and cancelled calls
//! - **Composable fields**: a line is the output of an ordered list of
//!   [`handlers`] joined by a separator; write your own as plain closures
//! - **Transport layer**: [`AccessLogLayer`] applies the same pipeline to a
//!   `tonic::transport::Server`
//! - **Configuration**: TOML file plus `GRPC_ACCESSLOG_*` environment overrides
//!
//! ## Example
//!
//! ```rust,no_run
//! use grpc_accesslog::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let config = AccessLogConfig::load()?;
//!     init_tracing(&config)?;
//!
//!     let interceptor = AccessLogInterceptor::from_config(&config)?;
//!
//!     let details = HandlerCallDetails::new("/helloworld.Greeter/SayHello");
//!     let handler = interceptor.intercept_service(
//!         Box::new(|_: &HandlerCallDetails| {
//!             Some(server::unary_unary(|name: String, _ctx| Ok(format!("Hello {name}"))))
//!         }),
//!         &details,
//!     );
//!     assert!(handler.is_some());
//!
//!     Ok(())
//! }
//! ```

pub mod async_server;
pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
mod invocation;
pub mod layer;
pub mod logger;
pub mod observability;
pub mod rpc;
pub mod server;

pub use async_server::{AsyncAccessLogInterceptor, AsyncServerInterceptor, Cooperative};
pub use config::AccessLogConfig;
pub use context::{ByteSize, CallContext, Payload, RequestInfo, ServerContext, ServicerContext};
pub use error::{Error, Result};
pub use handlers::Handler;
pub use layer::{AccessLogBody, AccessLogLayer, AccessLogService};
pub use logger::{AccessLogger, AccessLoggerBuilder, ConsoleSink, Sink, TracingSink};
pub use rpc::{
    wrap_rpc_behavior, Behavior, BehaviorWrapper, Flavor, HandlerCallDetails, RpcMethodHandler,
};
pub use server::{AccessLogInterceptor, Blocking, ServerInterceptor};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::async_server::{
        self, AsyncAccessLogInterceptor, AsyncServerInterceptor, Cooperative,
    };
    pub use crate::config::AccessLogConfig;
    pub use crate::context::{ByteSize, CallContext, Payload, ServerContext, ServicerContext};
    pub use crate::error::{Error, Result};
    pub use crate::handlers::{self, Handler};
    pub use crate::layer::AccessLogLayer;
    pub use crate::logger::{AccessLogger, Sink, TracingSink};
    pub use crate::observability::init_tracing;
    pub use crate::rpc::{HandlerCallDetails, RpcMethodHandler};
    pub use crate::server::{self, AccessLogInterceptor, Blocking, ServerInterceptor};

    pub use tonic::{Code, Status};
    pub use tracing::Level;
}
