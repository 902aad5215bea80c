//! Access log field handlers
//!
//! Each handler maps a [`CallContext`] to one field of the access log line.
//! Handlers are plain functions (or closures built by a factory) and hold no
//! mutable state, so a single list is shared by every concurrent call.
//!
//! User-defined handlers only need the same shape:
//!
//! ```
//! use grpc_accesslog::handlers::{self, Handler};
//!
//! let method_only: Handler = handlers::from_fn(|context| context.method_name.to_string());
//! ```

use std::fmt::Write;
use std::sync::Arc;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use tonic::Code;

use crate::context::CallContext;
use crate::error::{Error, Result};

/// A single access log field extractor
pub type Handler = Arc<dyn Fn(&CallContext<'_>) -> String + Send + Sync>;

/// Wrap a function or closure as a [`Handler`]
pub fn from_fn<F>(f: F) -> Handler
where
    F: Fn(&CallContext<'_>) -> String + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Default strftime pattern, as used by the combined log format
pub const DEFAULT_TIME_FORMAT: &str = "[%d/%b/%Y:%H:%M:%S %z]";

/// Handler names in the order used when none are configured
pub const DEFAULT_HANDLER_NAMES: &[&str] = &[
    "peer",
    "time_received",
    "request",
    "status",
    "response_size",
    "user_agent",
];

/// Build the default handler list
///
/// A fresh list is built on every call, so one logger replacing its handlers
/// never affects another.
pub fn default_handlers() -> Vec<Handler> {
    vec![
        from_fn(peer),
        time_received(DEFAULT_TIME_FORMAT),
        from_fn(request),
        from_fn(status),
        from_fn(response_size),
        from_fn(user_agent),
    ]
}

/// Resolve a handler by its configuration name
///
/// `time_format` is used by the `time_received` and `time_complete` handlers.
pub fn by_name(name: &str, time_format: &str) -> Result<Handler> {
    let handler: Handler = match name {
        "peer" => from_fn(peer),
        "time_received" => {
            validate_time_format(time_format)?;
            time_received(time_format)
        }
        "time_complete" => {
            validate_time_format(time_format)?;
            time_complete(time_format)
        }
        "rtt_ms" => from_fn(rtt_ms),
        "request" => from_fn(request),
        "status" => from_fn(status),
        "response_size" => from_fn(response_size),
        "user_agent" => from_fn(user_agent),
        other => return Err(Error::UnknownHandler(other.to_string())),
    };

    Ok(handler)
}

/// Check that a strftime pattern only uses supported specifiers
pub fn validate_time_format(format: &str) -> Result<()> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(Error::InvalidTimeFormat(format.to_string()));
    }
    Ok(())
}

/// Format the time the call was received
pub fn time_received(format: impl Into<String>) -> Handler {
    let format = format.into();
    from_fn(move |context| format_time(&context.start, &format))
}

/// Format the time the call completed
pub fn time_complete(format: impl Into<String>) -> Handler {
    let format = format.into();
    from_fn(move |context| format_time(&context.end, &format))
}

// Unrenderable patterns yield "-" instead of unwinding through the call.
fn format_time(time: &DateTime<Utc>, format: &str) -> String {
    let mut rendered = String::new();
    match write!(rendered, "{}", time.format(format)) {
        Ok(()) => rendered,
        Err(_) => "-".to_string(),
    }
}

/// Round trip time in milliseconds
///
/// Microsecond precision, rounded half to even.
pub fn rtt_ms(context: &CallContext<'_>) -> String {
    let elapsed = context.end - context.start;
    let rtt = match elapsed.num_microseconds() {
        Some(micros) => (micros as f64 / 1000.0).round_ties_even() as i64,
        None => elapsed.num_milliseconds(),
    };
    rtt.to_string()
}

/// Fully qualified RPC method
pub fn request(context: &CallContext<'_>) -> String {
    context.method_name.to_string()
}

/// Name of the status code recorded for the call, `OK` when none was recorded
pub fn status(context: &CallContext<'_>) -> String {
    let code = context.server_context.code().unwrap_or(Code::Ok);
    code_name(code).to_string()
}

/// Client IP address without the address family prefix and port
///
/// Peers not in `ipvN:` form are returned unchanged.
pub fn peer(context: &CallContext<'_>) -> String {
    let peer = context.server_context.peer();
    if !peer.starts_with("ipv") {
        return peer;
    }

    match peer.split_once(':') {
        Some((_, address)) => match address.rsplit_once(':') {
            Some((host, _port)) => host.to_string(),
            None => address.to_string(),
        },
        None => peer,
    }
}

/// Serialized size of the response message in bytes
///
/// Streaming responses are not captured and report `0`.
pub fn response_size(context: &CallContext<'_>) -> String {
    let size = context
        .response
        .and_then(|response| response.byte_size())
        .unwrap_or(0);
    size.to_string()
}

/// Client user agent, `-` when not sent
///
/// Bytes outside visible ASCII are decoded as UTF-8, lossily.
pub fn user_agent(context: &CallContext<'_>) -> String {
    // Metadata keys are normalized to lowercase; get returns the first value.
    context
        .server_context
        .invocation_metadata()
        .get("user-agent")
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .unwrap_or_else(|| "-".to_string())
}

/// Canonical name of a gRPC status code
pub fn code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "CANCELLED",
        Code::Unknown => "UNKNOWN",
        Code::InvalidArgument => "INVALID_ARGUMENT",
        Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
        Code::NotFound => "NOT_FOUND",
        Code::AlreadyExists => "ALREADY_EXISTS",
        Code::PermissionDenied => "PERMISSION_DENIED",
        Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
        Code::FailedPrecondition => "FAILED_PRECONDITION",
        Code::Aborted => "ABORTED",
        Code::OutOfRange => "OUT_OF_RANGE",
        Code::Unimplemented => "UNIMPLEMENTED",
        Code::Internal => "INTERNAL",
        Code::Unavailable => "UNAVAILABLE",
        Code::DataLoss => "DATA_LOSS",
        Code::Unauthenticated => "UNAUTHENTICATED",
    }
}
