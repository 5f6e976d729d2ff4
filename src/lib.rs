//! Quayside: a static content HTTP(S) server.
//!
//! Serves a directory over HTTP or HTTPS (static certificates or ACME), with
//! try-file fallbacks for single page applications, configurable response headers
//! and an optional instrumentation listener exposing Prometheus metrics.

pub mod app;
pub mod config;
pub mod error;
pub mod headers;
pub mod http;
pub mod logging;
pub mod middleware;
pub mod pipeline;
pub mod telemetry;
pub mod tls;
pub mod tryfile;

pub use error::AppError;
