//! Process-wide tracing setup
//!
//! Access log lines do not depend on this subscriber; it receives the
//! crate's own diagnostics and, for loggers built with `propagate`, a copy
//! of every access log line.

use tracing_subscriber::EnvFilter;

use crate::config::AccessLogConfig;
use crate::error::{Error, Result};

/// Initialize the global tracing subscriber
///
/// `RUST_LOG` wins over the configured filter when set.
pub fn init_tracing(config: &AccessLogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| Error::Tracing(e.to_string()))?;

    tracing::info!("Tracing initialized for access logger: {}", config.name);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice() {
        let config = AccessLogConfig::default();
        // Another test may have installed a subscriber first; either way
        // the second attempt in this process must fail cleanly.
        let _ = init_tracing(&config);
        assert!(matches!(init_tracing(&config), Err(Error::Tracing(_))));
    }
}
