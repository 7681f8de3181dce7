//! Structured logging
//!
//! The server logs through `tracing`. The persisted configuration carries a
//! free-form `logger` object selecting the output format and the metadata
//! header used for request-id correlation; `STEPDEBUG=1` raises the default
//! filter when `RUST_LOG` is not set.

use serde::Deserialize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::Error;

mod request;

pub use request::RequestLog;

/// Default metadata header carrying the request trace id.
pub const DEFAULT_TRACE_HEADER: &str = "x-smallstep-id";

/// Logger settings parsed from the configuration's `logger` object.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggerConfig {
    /// Output format
    #[serde(default)]
    pub format: LogFormat,
    /// Metadata header used as the request trace id
    #[serde(rename = "traceHeader", default)]
    pub trace_header: Option<String>,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single-line records
    #[default]
    Text,
    /// One JSON object per record
    Json,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            format: LogFormat::Text,
            trace_header: None,
        }
    }
}

impl LoggerConfig {
    /// Parses the free-form `logger` configuration value.
    pub fn from_value(value: &serde_json::Value) -> Result<LoggerConfig, Error> {
        if value.is_null() {
            return Ok(LoggerConfig::default());
        }
        serde_json::from_value(value.clone())
            .map_err(|e| Error::config(format!("error parsing logger attribute: {e}")))
    }

    /// The metadata header used for request-id correlation, lowercased as
    /// gRPC metadata keys are.
    pub fn trace_header(&self) -> String {
        self.trace_header
            .as_deref()
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| DEFAULT_TRACE_HEADER.to_string())
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over the `STEPDEBUG`
/// default; the output format follows the configuration.
pub fn init(config: &LoggerConfig) {
    let default = if std::env::var("STEPDEBUG").is_ok_and(|v| v == "1") {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Text => {
            let _ = registry.with(fmt::layer()).try_init();
        }
        LogFormat::Json => {
            let _ = registry.with(fmt::layer().json()).try_init();
        }
    }
}

/// Log level for a gRPC status code.
pub fn level_for(code: tonic::Code) -> tracing::Level {
    use tonic::Code;
    use tracing::Level;
    match code {
        Code::Ok
        | Code::Cancelled
        | Code::InvalidArgument
        | Code::NotFound
        | Code::AlreadyExists
        | Code::Unauthenticated => Level::INFO,
        Code::DeadlineExceeded
        | Code::PermissionDenied
        | Code::ResourceExhausted
        | Code::FailedPrecondition
        | Code::Aborted
        | Code::OutOfRange
        | Code::Unavailable => Level::WARN,
        _ => Level::ERROR,
    }
}

/// Emits a tracing event at a runtime-selected level.
macro_rules! event_at {
    ($level:expr, $($arg:tt)*) => {{
        let level: tracing::Level = $level;
        if level == tracing::Level::ERROR {
            tracing::error!($($arg)*)
        } else if level == tracing::Level::WARN {
            tracing::warn!($($arg)*)
        } else if level == tracing::Level::INFO {
            tracing::info!($($arg)*)
        } else if level == tracing::Level::DEBUG {
            tracing::debug!($($arg)*)
        } else {
            tracing::trace!($($arg)*)
        }
    }};
}

pub(crate) use event_at;
