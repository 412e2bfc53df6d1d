//! Tracing setup and the application-facing log passthrough.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Severity accepted by [`log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Notice => write!(f, "notice"),
            LogLevel::Warning => write!(f, "warning"),
            LogLevel::Error => write!(f, "error"),
            LogLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Install the global fmt subscriber once.
///
/// The filter comes from `DCAPI_LOG`, then `RUST_LOG`, then `default_level`.
/// A subscriber installed by the embedding application wins.
pub fn init(default_level: &str) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = std::env::var("DCAPI_LOG")
            .ok()
            .filter(|v| !v.is_empty())
            .map(EnvFilter::new)
            .unwrap_or_else(|| {
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
            });

        if tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .try_init()
            .is_err()
        {
            tracing::debug!("global tracing subscriber already installed");
        }
    });
}

/// Forward an application message into the tracing pipeline.
pub fn log(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!(target: "dcapi::app", "{message}"),
        LogLevel::Info | LogLevel::Notice => {
            tracing::info!(target: "dcapi::app", level = %level, "{message}")
        }
        LogLevel::Warning => tracing::warn!(target: "dcapi::app", "{message}"),
        LogLevel::Error | LogLevel::Critical => {
            tracing::error!(target: "dcapi::app", level = %level, "{message}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init("warn");
        init("debug");
        log(LogLevel::Notice, "still works");
    }

    #[test]
    fn levels_are_ordered() {
        assert!(LogLevel::Debug < LogLevel::Warning);
        assert!(LogLevel::Error < LogLevel::Critical);
        assert_eq!(LogLevel::Warning.to_string(), "warning");
    }
}
