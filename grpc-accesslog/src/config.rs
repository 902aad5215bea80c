//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: GRPC_ACCESSLOG_)
//! 2. Current working directory: ./accesslog.toml (or an explicit path)
//! 3. Default values
//!
//! ```toml
//! level = "info"
//! name = "grpc_accesslog"
//! handlers = ["peer", "time_received", "request", "status", "response_size", "user_agent"]
//! separator = " "
//! propagate = false
//! time_format = "[%d/%b/%Y:%H:%M:%S %z]"
//! ```

use std::str::FromStr;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::error::{Error, Result};
use crate::handlers::{self, Handler, DEFAULT_HANDLER_NAMES, DEFAULT_TIME_FORMAT};

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "accesslog.toml";

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "GRPC_ACCESSLOG_";

/// Access logger configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessLogConfig {
    /// Severity of emitted lines (trace, debug, info, warn, error)
    #[serde(default = "default_level")]
    pub level: String,

    /// Logger name, shown when lines propagate to the ambient subscriber
    #[serde(default = "default_name")]
    pub name: String,

    /// Ordered field extractor names
    #[serde(default = "default_handler_names")]
    pub handlers: Vec<String>,

    /// String placed between extracted fields
    #[serde(default = "default_separator")]
    pub separator: String,

    /// Also forward lines to the process-wide subscriber
    #[serde(default)]
    pub propagate: bool,

    /// strftime pattern for the time handlers
    #[serde(default = "default_time_format")]
    pub time_format: String,

    /// Filter directive for [`init_tracing`](crate::observability::init_tracing)
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_name() -> String {
    crate::logger::DEFAULT_LOGGER_NAME.to_string()
}

fn default_handler_names() -> Vec<String> {
    DEFAULT_HANDLER_NAMES.iter().map(|name| name.to_string()).collect()
}

fn default_separator() -> String {
    " ".to_string()
}

fn default_time_format() -> String {
    DEFAULT_TIME_FORMAT.to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            name: default_name(),
            handlers: default_handler_names(),
            separator: default_separator(),
            propagate: false,
            time_format: default_time_format(),
            log_filter: default_log_filter(),
        }
    }
}

impl AccessLogConfig {
    /// Load configuration from `./accesslog.toml` and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a specific file
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from(path: &str) -> Result<Self> {
        tracing::debug!("Loading access log configuration from: {}", path);

        let config: Self = Figment::new()
            // Start with defaults
            .merge(Serialized::defaults(Self::default()))
            // Load from config file (if exists)
            .merge(Toml::file(path))
            // Override with environment variables
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Check every field that can be wrong without failing extraction
    pub fn validate(&self) -> Result<()> {
        self.parse_level()?;
        self.build_handlers()?;
        Ok(())
    }

    /// Parse the configured severity
    pub fn parse_level(&self) -> Result<Level> {
        Level::from_str(&self.level).map_err(|_| Error::InvalidLevel(self.level.clone()))
    }

    /// Resolve the configured extractor names, in order
    pub fn build_handlers(&self) -> Result<Vec<Handler>> {
        self.handlers
            .iter()
            .map(|name| handlers::by_name(name, &self.time_format))
            .collect()
    }
}
