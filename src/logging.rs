//! Logging setup.
//!
//! Priority for the filter: `RUST_LOG` > `--log`. Text output is used when
//! attached to a terminal session, JSON when run under a supervisor (pid 1 parent)
//! unless `--logstyle` says otherwise.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ConfigError;

/// Output format of log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStyle {
    Text,
    Json,
}

impl LogStyle {
    /// Resolve `auto`, `text` or `json`. `parent_pid` decides `auto`.
    pub fn resolve(style: &str, parent_pid: Option<u32>) -> Result<Self, ConfigError> {
        match style.to_ascii_lowercase().as_str() {
            "text" => Ok(LogStyle::Text),
            "json" => Ok(LogStyle::Json),
            "auto" => match parent_pid {
                Some(ppid) if ppid > 1 => Ok(LogStyle::Text),
                _ => Ok(LogStyle::Json),
            },
            _ => Err(ConfigError::LogStyle(style.to_string())),
        }
    }
}

fn parent_pid() -> Option<u32> {
    #[cfg(unix)]
    {
        Some(std::os::unix::process::parent_id())
    }
    #[cfg(not(unix))]
    {
        None
    }
}

/// Install the global subscriber.
pub fn init(level: &str, style: &str) -> Result<(), ConfigError> {
    let level = Level::from_str(level).map_err(|_| ConfigError::LogLevel(level.to_string()))?;
    let style = LogStyle::resolve(style, parent_pid())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));
    let source = level >= Level::DEBUG;

    let registry = tracing_subscriber::registry().with(filter);

    match style {
        LogStyle::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(source)
                    .with_line_number(source),
            )
            .init(),
        LogStyle::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_file(source)
                    .with_line_number(source),
            )
            .init(),
    }

    Ok(())
}
