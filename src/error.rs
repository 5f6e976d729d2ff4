use metrics_exporter_prometheus::BuildError;

use crate::config::ConfigError;
use crate::http::GroupError;
use crate::tls::TlsError;

/// Startup and run failures; any of them ends the process with a non-zero status.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] TlsError),

    #[error("server error: {0}")]
    Group(#[from] GroupError),

    #[error("metrics recorder error: {0}")]
    Metrics(#[from] BuildError),
}
