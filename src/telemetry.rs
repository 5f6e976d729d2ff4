//! Metrics exposition.
//!
//! # Metrics
//! - `http_server_requests_total` (counter): requests by method and status
//! - `http_server_request_duration_seconds` (histogram): latency by method
//!
//! The recorder is process wide and installed once; the instrumentation listener
//! renders it at `GET /metrics`.

use std::sync::OnceLock;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use http::header::{HeaderValue, CONTENT_TYPE};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::config::SERVICE_NAME;

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder, or return the already installed one.
pub fn install_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = RECORDER.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .add_global_label("service", SERVICE_NAME)
        .install_recorder()?;

    tracing::info!("Installed metrics recorder");
    Ok(RECORDER.get_or_init(|| handle).clone())
}

/// Router for the instrumentation listener.
pub fn instrumentation_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(handle)
}

async fn render_metrics(State(handle): State<PrometheusHandle>) -> Response {
    let mut response = handle.render().into_response();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}
