use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt as subscriber};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Human => write!(f, "human"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown log format `{0}` (expected `human` or `json`)")]
pub struct UnknownFormat(pub String);

impl FromStr for LogFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "human" | "text" | "pretty" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            other => Err(UnknownFormat(other.to_string())),
        }
    }
}

/// Filter from `RUST_LOG`, else `default_level`, else `info`.
fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed; the call is then
/// a no-op, which keeps tests that each initialize logging safe.
pub fn init(service: &str, format: LogFormat, default_level: &str) -> bool {
    let installed = match format {
        LogFormat::Human => subscriber()
            .with_env_filter(filter(default_level))
            .with_target(true)
            .with_level(true)
            .try_init()
            .is_ok(),
        LogFormat::Json => subscriber()
            .json()
            .with_env_filter(filter(default_level))
            .with_target(true)
            .with_current_span(true)
            .try_init()
            .is_ok(),
    };
    if installed {
        tracing::info!(service, format = %format, "logging initialised");
    }
    installed
}

/// Human-readable output.
pub fn init_logging(service: &str, default_level: &str) -> bool {
    init(service, LogFormat::Human, default_level)
}

/// JSON lines, one object per event.
pub fn init_logging_json(service: &str, default_level: &str) -> bool {
    init(service, LogFormat::Json, default_level)
}
