//! Command line configuration and constants.
//!
//! Parses the command line with clap and turns it into an immutable [`ServeConfig`].
//! All cross-field validation happens in [`ServeConfig::from_args`]; nothing here
//! touches the network.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use const_format::concatcp;

use crate::headers::{HeaderError, HeaderSet};
use crate::tls::TlsSettings;
use crate::tryfile::TryFiles;

// =============================================================================
// Identity
// =============================================================================

/// Product name reported in the `Server` response header
pub const SERVER_NAME: &str = "Quayside";

/// Full `Server` header value
pub const SERVER_IDENTITY: &str = concatcp!(SERVER_NAME, "/", env!("CARGO_PKG_VERSION"));

/// Service name used for telemetry
pub const SERVICE_NAME: &str = "quayside";

// =============================================================================
// Request Resolution
// =============================================================================

/// Document served for directory requests
pub const INDEX_DOCUMENT: &str = "index.html";

/// The only placeholder understood in try-file expressions (without the `$`)
pub const URI_VARIABLE: &str = "uri";

/// Header carrying the request correlation id
pub const CORRELATION_HEADER: &str = "x-correlation-id";

// =============================================================================
// Lifecycle Timeouts
// =============================================================================

/// Time a listener is given to drain connections after cancellation
pub const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra time granted after the graceful attempt before the serve task is abandoned
pub const SERVER_SHUTDOWN_SAFETY_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Defaults
// =============================================================================

/// Production directory of Let's Encrypt
pub const DEFAULT_ACME_ENDPOINT: &str = "https://acme-v02.api.letsencrypt.org/directory";

pub const DEFAULT_ROOT: &str = "/www";
pub const DEFAULT_BASE: &str = "/";
pub const DEFAULT_PORT: &str = "8080";
pub const DEFAULT_INSTRUMENT_PORT: &str = "8081";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_LOG_STYLE: &str = "auto";

/// Static content server with try-file fallbacks and automatic TLS
#[derive(Parser, Debug, Clone)]
#[command(name = "quayside", version, about)]
pub struct Args {
    /// Root directory for the web server
    #[arg(long, default_value = DEFAULT_ROOT)]
    pub root: PathBuf,

    /// Base path for serving
    #[arg(long, default_value = DEFAULT_BASE)]
    pub base: String,

    /// Port to listen on
    #[arg(long, default_value = DEFAULT_PORT)]
    pub port: String,

    /// Address to listen on (empty for all interfaces)
    #[arg(long, default_value = "")]
    pub address: String,

    /// Port to listen on for instrumentation
    #[arg(long, default_value = DEFAULT_INSTRUMENT_PORT)]
    pub iport: String,

    /// Address to listen on for instrumentation (empty for all interfaces)
    #[arg(long, default_value = "")]
    pub iaddress: String,

    /// TLS certificate file (PEM)
    #[arg(long)]
    pub tlscert: Option<PathBuf>,

    /// TLS key file (PEM)
    #[arg(long)]
    pub tlskey: Option<PathBuf>,

    /// Client CA file for mutual TLS, may be repeated
    #[arg(long)]
    pub clientca: Vec<PathBuf>,

    /// Domain for automatic certificate retrieval, may be repeated
    #[arg(long)]
    pub acmedomain: Vec<String>,

    /// Directory for the automatic certificate cache
    #[arg(long, default_value_os_t = std::env::temp_dir())]
    pub certcache: PathBuf,

    /// ACME directory endpoint (defaults to Let's Encrypt production)
    #[arg(long)]
    pub acmeendpoint: Option<String>,

    /// Additional HTTP header in the form "Name: value", may be repeated
    #[arg(long)]
    pub header: Vec<String>,

    /// File containing additional HTTP headers, may be repeated
    #[arg(long)]
    pub headerfile: Vec<PathBuf>,

    /// Try-file expression, `$uri` is replaced by the request path; may be repeated
    #[arg(long)]
    pub tryfile: Vec<String>,

    /// Enable telemetry (request metrics and the instrumentation listener)
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub telemetry: bool,

    /// Log level: trace, debug, info, warn or error
    #[arg(long, default_value = DEFAULT_LOG_LEVEL)]
    pub log: String,

    /// Log style: auto, text or json
    #[arg(long, default_value = DEFAULT_LOG_STYLE)]
    pub logstyle: String,
}

/// Validated server configuration.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub root: PathBuf,
    /// Prefix stripped from request paths, without trailing slash ("" for `/`)
    pub base_prefix: String,
    pub listen_addr: String,
    pub instrument_addr: String,
    pub tls: TlsSettings,
    pub headers: HeaderSet,
    pub try_files: TryFiles,
    pub telemetry: bool,
}

impl ServeConfig {
    /// Build the configuration, reading header files and checking the content root.
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        if let Err(source) = std::fs::metadata(&args.root) {
            return Err(ConfigError::Root {
                path: args.root.clone(),
                source,
            });
        }

        let base_prefix = normalize_base(&args.base)?;
        let headers = HeaderSet::compose(&args.header, &args.headerfile)?;

        let tls = TlsSettings {
            cert: args.tlscert.clone(),
            key: args.tlskey.clone(),
            acme_domains: args.acmedomain.clone(),
            cert_cache: args.certcache.clone(),
            acme_endpoint: args.acmeendpoint.clone(),
            client_cas: args.clientca.clone(),
        };

        Ok(Self {
            root: args.root.clone(),
            base_prefix,
            listen_addr: join_host_port(&args.address, &args.port),
            instrument_addr: join_host_port(&args.iaddress, &args.iport),
            tls,
            headers,
            try_files: TryFiles::new(args.tryfile.iter()),
            telemetry: args.telemetry,
        })
    }
}

/// Normalize the base path into a prefix without trailing slash.
fn normalize_base(base: &str) -> Result<String, ConfigError> {
    if !base.starts_with('/') {
        return Err(ConfigError::Base(base.to_string()));
    }

    Ok(base.trim_end_matches('/').to_string())
}

/// Combine host and port into a bindable address. An empty host binds all interfaces.
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.is_empty() {
        format!("0.0.0.0:{port}")
    } else if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not get info of root path {path:?}: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("base path must start with '/': {0:?}")]
    Base(String),
    #[error("invalid log level {0:?}")]
    LogLevel(String),
    #[error("unsupported log style {0:?}")]
    LogStyle(String),
    #[error(transparent)]
    Headers(#[from] HeaderError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["quayside"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert_eq!(args.root, PathBuf::from("/www"));
        assert_eq!(args.base, "/");
        assert_eq!(args.port, "8080");
        assert_eq!(args.iport, "8081");
        assert!(args.telemetry);
        assert_eq!(args.log, "info");
        assert_eq!(args.logstyle, "auto");
        assert_eq!(args.certcache, std::env::temp_dir());
    }

    #[test]
    fn test_repeatable_flags_keep_order() {
        let args = parse(&[
            "--tryfile", "$uri", "--tryfile", "/index.html", "--acmedomain", "a.example",
            "--acmedomain", "b.example", "--telemetry", "false",
        ]);
        assert_eq!(args.tryfile, vec!["$uri", "/index.html"]);
        assert_eq!(args.acmedomain, vec!["a.example", "b.example"]);
        assert!(!args.telemetry);
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("", "8080"), "0.0.0.0:8080");
        assert_eq!(join_host_port("localhost", "80"), "localhost:80");
        assert_eq!(join_host_port("::1", "443"), "[::1]:443");
        assert_eq!(join_host_port("[::1]", "443"), "[::1]:443");
    }

    #[test]
    fn test_normalize_base() {
        assert_eq!(normalize_base("/").unwrap(), "");
        assert_eq!(normalize_base("/static/").unwrap(), "/static");
        assert_eq!(normalize_base("/static").unwrap(), "/static");
        assert!(normalize_base("static").is_err());
    }

    #[test]
    fn test_from_args_missing_root() {
        let args = parse(&["--root", "/definitely/not/here/quayside"]);
        let err = ServeConfig::from_args(&args).unwrap_err();
        assert!(matches!(err, ConfigError::Root { .. }));
    }

    #[test]
    fn test_from_args_composes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap();
        let args = parse(&[
            "--root", root, "--base", "/app/", "--address", "127.0.0.1", "--header",
            "X-Test: a", "--tryfile", "$uri", "--tryfile", "/index.html",
        ]);

        let config = ServeConfig::from_args(&args).unwrap();
        assert_eq!(config.base_prefix, "/app");
        assert_eq!(config.listen_addr, "127.0.0.1:8080");
        assert_eq!(config.instrument_addr, "0.0.0.0:8081");
        assert_eq!(config.try_files.rules(), ["$uri", "/"]);
        assert_eq!(config.headers.len(), 2);
        assert!(!config.tls.is_enabled());
    }
}
