//! The access logger: runs handlers, joins their output, emits one line
//!
//! Each [`AccessLogger`] owns its own output channel. By default that is a
//! private `tracing` dispatcher writing bare lines to stderr, so access log
//! lines are not mixed into (or filtered by) the application's own
//! subscriber unless [`propagate`](AccessLoggerBuilder::propagate) is set.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use tracing::{Dispatch, Level};
use tracing_subscriber::fmt::MakeWriter;

use crate::config::AccessLogConfig;
use crate::context::{CallContext, Payload, RequestInfo, ServerContext};
use crate::error::Result;
use crate::handlers::{self, Handler};

/// Name used when none is configured
pub const DEFAULT_LOGGER_NAME: &str = "grpc_accesslog";

/// Target of every access log event
pub const ACCESS_LOG_TARGET: &str = "grpc_accesslog::access";

// `tracing` needs the level as a constant at each callsite.
macro_rules! access_event {
    ($level:expr, $($rest:tt)+) => {
        match $level {
            Level::ERROR => tracing::event!(target: ACCESS_LOG_TARGET, Level::ERROR, $($rest)+),
            Level::WARN => tracing::event!(target: ACCESS_LOG_TARGET, Level::WARN, $($rest)+),
            Level::INFO => tracing::event!(target: ACCESS_LOG_TARGET, Level::INFO, $($rest)+),
            Level::DEBUG => tracing::event!(target: ACCESS_LOG_TARGET, Level::DEBUG, $($rest)+),
            _ => tracing::event!(target: ACCESS_LOG_TARGET, Level::TRACE, $($rest)+),
        }
    };
}

/// Destination for finished access log lines
pub trait Sink: Send + Sync {
    /// Emit one line at the given severity
    fn emit(&self, level: Level, line: &str);
}

/// Writes bare lines through a dedicated dispatcher
///
/// With `propagate` set, every line is also sent to the process-wide
/// subscriber, tagged with the logger name.
pub struct ConsoleSink {
    name: String,
    propagate: bool,
    dispatch: Dispatch,
}

impl ConsoleSink {
    /// Write to stderr
    pub fn new(name: impl Into<String>, propagate: bool) -> Self {
        Self::with_writer(name, propagate, std::io::stderr)
    }

    /// Write to any `tracing_subscriber` writer
    pub fn with_writer<W>(name: impl Into<String>, propagate: bool, writer: W) -> Self
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer)
            .with_max_level(Level::TRACE)
            .with_ansi(false)
            .without_time()
            .with_level(false)
            .with_target(false)
            .finish();

        Self {
            name: name.into(),
            propagate,
            dispatch: Dispatch::new(subscriber),
        }
    }
}

impl Sink for ConsoleSink {
    fn emit(&self, level: Level, line: &str) {
        tracing::dispatcher::with_default(&self.dispatch, || access_event!(level, "{}", line));

        if self.propagate {
            let name = self.name.as_str();
            access_event!(level, logger = %name, "{}", line);
        }
    }
}

impl fmt::Debug for ConsoleSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleSink")
            .field("name", &self.name)
            .field("propagate", &self.propagate)
            .finish_non_exhaustive()
    }
}

/// Sends lines to whatever subscriber is current
#[derive(Debug, Clone)]
pub struct TracingSink {
    name: String,
}

impl TracingSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Sink for TracingSink {
    fn emit(&self, level: Level, line: &str) {
        let name = self.name.as_str();
        access_event!(level, logger = %name, "{}", line);
    }
}

/// Formats and emits one line per completed call
///
/// The handler list can be replaced at runtime with
/// [`replace_handlers`](Self::replace_handlers); calls already formatting a
/// line keep the list they started with.
pub struct AccessLogger {
    name: String,
    level: Level,
    separator: String,
    handlers: ArcSwap<Vec<Handler>>,
    sink: Arc<dyn Sink>,
}

impl AccessLogger {
    /// Create a new builder
    pub fn builder() -> AccessLoggerBuilder {
        AccessLoggerBuilder::new()
    }

    /// Build a logger from loaded configuration
    pub fn from_config(config: &AccessLogConfig) -> Result<Self> {
        Ok(Self::builder()
            .name(config.name.clone())
            .level(config.parse_level()?)
            .handlers(config.build_handlers()?)
            .separator(config.separator.clone())
            .propagate(config.propagate)
            .build())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Snapshot of the current handler list
    pub fn handlers(&self) -> Arc<Vec<Handler>> {
        self.handlers.load_full()
    }

    /// Swap in a new handler list
    pub fn replace_handlers(&self, handlers: Vec<Handler>) {
        self.handlers.store(Arc::new(handlers));
    }

    /// Format and emit the line for one call
    ///
    /// Emits nothing when the handler list is empty.
    pub fn log(
        &self,
        server_context: &dyn ServerContext,
        method_name: &str,
        request: RequestInfo,
        response: Option<&dyn Payload>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) {
        let handlers = self.handlers.load();
        if handlers.is_empty() {
            return;
        }

        let context = CallContext {
            server_context,
            method_name,
            request,
            response,
            start,
            end,
        };

        let line = handlers
            .iter()
            .map(|handler| handler(&context))
            .collect::<Vec<_>>()
            .join(&self.separator);

        self.sink.emit(self.level, &line);
    }
}

impl Default for AccessLogger {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for AccessLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessLogger")
            .field("name", &self.name)
            .field("level", &self.level)
            .field("separator", &self.separator)
            .field("handlers", &self.handlers.load().len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`AccessLogger`]
pub struct AccessLoggerBuilder {
    name: String,
    level: Level,
    separator: String,
    handlers: Option<Vec<Handler>>,
    propagate: bool,
    sink: Option<Arc<dyn Sink>>,
}

impl AccessLoggerBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            name: DEFAULT_LOGGER_NAME.to_string(),
            level: Level::INFO,
            separator: " ".to_string(),
            handlers: None,
            propagate: false,
            sink: None,
        }
    }

    /// Set the logger name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the severity of emitted lines
    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the field separator
    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    /// Set the handler list (defaults to [`handlers::default_handlers`])
    pub fn handlers(mut self, handlers: Vec<Handler>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Also forward lines to the process-wide subscriber
    ///
    /// Ignored when a custom sink is set.
    pub fn propagate(mut self, propagate: bool) -> Self {
        self.propagate = propagate;
        self
    }

    /// Replace the default console output
    pub fn sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Build the logger
    pub fn build(self) -> AccessLogger {
        let sink = match self.sink {
            Some(sink) => sink,
            None => Arc::new(ConsoleSink::new(self.name.clone(), self.propagate)),
        };

        AccessLogger {
            name: self.name,
            level: self.level,
            separator: self.separator,
            handlers: ArcSwap::from_pointee(
                self.handlers.unwrap_or_else(handlers::default_handlers),
            ),
            sink,
        }
    }
}

impl Default for AccessLoggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory sink for tests
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemorySink {
    lines: std::sync::Mutex<Vec<(Level, String)>>,
}

#[cfg(test)]
impl MemorySink {
    pub(crate) fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .map(|(_, line)| line.clone())
            .collect()
    }

    pub(crate) fn levels(&self) -> Vec<Level> {
        self.lines.lock().unwrap().iter().map(|(level, _)| *level).collect()
    }
}

#[cfg(test)]
impl Sink for MemorySink {
    fn emit(&self, level: Level, line: &str) {
        self.lines.lock().unwrap().push((level, line.to_string()));
    }
}

/// Logger whose lines land in the returned sink
#[cfg(test)]
pub(crate) fn capturing_logger(handlers: Vec<Handler>) -> (Arc<AccessLogger>, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::default());
    let logger = AccessLogger::builder()
        .handlers(handlers)
        .sink(sink.clone())
        .build();
    (Arc::new(logger), sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ByteSize, ServicerContext};
    use crate::handlers::from_fn;
    use std::io;
    use std::sync::Mutex;

    fn log_once(logger: &AccessLogger) {
        let context = ServicerContext::new("ipv4:127.0.0.1:1");
        let now = Utc::now();
        logger.log(
            &context,
            "/test.Service/Method",
            RequestInfo::unary(&ByteSize(1)),
            Some(&ByteSize(2)),
            now,
            now,
        );
    }

    #[test]
    fn test_handlers_joined_with_separator() {
        let (logger, sink) = capturing_logger(vec![
            from_fn(|_| "this".to_string()),
            from_fn(|_| "that".to_string()),
        ]);
        log_once(&logger);
        assert_eq!(sink.lines(), vec!["this that"]);
    }

    #[test]
    fn test_custom_separator_and_level() {
        let sink = Arc::new(MemorySink::default());
        let logger = AccessLogger::builder()
            .handlers(vec![from_fn(|_| "a".to_string()), from_fn(|_| "b".to_string())])
            .separator(" | ")
            .level(Level::WARN)
            .sink(sink.clone())
            .build();

        log_once(&logger);
        assert_eq!(sink.lines(), vec!["a | b"]);
        assert_eq!(sink.levels(), vec![Level::WARN]);
    }

    #[test]
    fn test_empty_handlers_emit_nothing() {
        let (logger, sink) = capturing_logger(Vec::new());
        log_once(&logger);
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn test_handlers_see_call_context() {
        let (logger, sink) = capturing_logger(vec![
            from_fn(|ctx| ctx.method_name.to_string()),
            from_fn(handlers::response_size),
        ]);
        log_once(&logger);
        assert_eq!(sink.lines(), vec!["/test.Service/Method 2"]);
    }

    #[test]
    fn test_replace_handlers() {
        let (logger, sink) = capturing_logger(vec![from_fn(|_| "old".to_string())]);
        log_once(&logger);

        logger.replace_handlers(vec![from_fn(|_| "new".to_string())]);
        log_once(&logger);

        assert_eq!(sink.lines(), vec!["old", "new"]);
        assert_eq!(logger.handlers().len(), 1);
    }

    #[test]
    fn test_builder_defaults() {
        let logger = AccessLogger::default();
        assert_eq!(logger.name(), DEFAULT_LOGGER_NAME);
        assert_eq!(logger.level(), Level::INFO);
        assert_eq!(logger.separator(), " ");
        assert_eq!(logger.handlers().len(), handlers::DEFAULT_HANDLER_NAMES.len());
    }

    #[test]
    fn test_from_config() {
        let config = AccessLogConfig {
            level: "debug".to_string(),
            handlers: vec!["status".to_string(), "response_size".to_string()],
            separator: ",".to_string(),
            ..Default::default()
        };

        let logger = AccessLogger::from_config(&config).unwrap();
        assert_eq!(logger.level(), Level::DEBUG);
        assert_eq!(logger.separator(), ",");
        assert_eq!(logger.handlers().len(), 2);
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_console_sink_writes_bare_lines() {
        let buffer = SharedBuffer::default();
        let writer = buffer.clone();
        let sink = ConsoleSink::with_writer("test", false, move || writer.clone());

        sink.emit(Level::INFO, "ipv4:127.0.0.1:1 OK");
        sink.emit(Level::ERROR, "second");

        let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = output.lines().map(str::trim).collect();
        assert_eq!(lines, vec!["ipv4:127.0.0.1:1 OK", "second"]);
    }
}
