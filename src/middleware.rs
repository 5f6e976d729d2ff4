//! Built-in pipeline stages.
//!
//! In pipeline order for the content listener:
//! request metrics, additional headers, correlation id, access log, method filter,
//! base path stripping and try-file resolution.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use http::header::{HeaderName, HeaderValue, ALLOW, LOCATION};
use http::{Method, StatusCode};
use uuid::Uuid;

use crate::config::CORRELATION_HEADER;
use crate::headers::HeaderSet;
use crate::pipeline::{set_request_path, Flow, RequestContext, Stage};
use crate::tryfile::{FileProbe, TryFiles};

fn status_response(status: StatusCode) -> Response {
    let mut response = Response::new(Body::from(
        status.canonical_reason().unwrap_or_default().to_string(),
    ));
    *response.status_mut() = status;
    response
}

/// Applies the configured response headers to every response.
pub struct AddHeaders {
    headers: HeaderSet,
}

impl AddHeaders {
    pub fn new(headers: HeaderSet) -> Self {
        Self { headers }
    }
}

#[async_trait]
impl Stage for AddHeaders {
    fn name(&self) -> &'static str {
        "headers"
    }

    fn on_response(&self, _ctx: &RequestContext, response: &mut Response) {
        self.headers.apply(response.headers_mut());
    }
}

/// Reuses the caller's correlation id or creates one, and echoes it on the response.
pub struct Correlation;

/// A non-empty `id` is kept, otherwise a new UUID v4 is created.
pub fn get_or_create_id(id: &str) -> String {
    if id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        id.to_string()
    }
}

#[async_trait]
impl Stage for Correlation {
    fn name(&self) -> &'static str {
        "correlation"
    }

    async fn on_request(&self, mut request: Request, ctx: &mut RequestContext) -> Flow {
        let header = HeaderName::from_static(CORRELATION_HEADER);
        let incoming = request
            .headers()
            .get(&header)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        let id = get_or_create_id(incoming.trim());

        if let Ok(value) = HeaderValue::from_str(&id) {
            request.headers_mut().insert(header, value);
        }

        tracing::Span::current().record("correlation_id", id.as_str());
        ctx.correlation_id = Some(id);

        Flow::Next(request)
    }

    fn on_response(&self, ctx: &RequestContext, response: &mut Response) {
        let value = ctx
            .correlation_id
            .as_deref()
            .and_then(|id| HeaderValue::from_str(id).ok());

        if let Some(value) = value {
            response
                .headers_mut()
                .insert(HeaderName::from_static(CORRELATION_HEADER), value);
        }
    }
}

/// Logs one event per completed request.
pub struct AccessLog;

#[async_trait]
impl Stage for AccessLog {
    fn name(&self) -> &'static str {
        "access_log"
    }

    fn on_response(&self, ctx: &RequestContext, response: &mut Response) {
        let duration_ms = ctx.started.elapsed().as_millis() as u64;

        tracing::info!(
            method = %ctx.method,
            path = %ctx.original_path,
            remote = ?ctx.remote,
            correlation_id = ctx.correlation_id.as_deref().unwrap_or("n/a"),
            status = response.status().as_u16(),
            duration_ms,
            "Request completed"
        );
    }
}

/// Only lets `GET` and `HEAD` through.
pub struct GetOnly;

#[async_trait]
impl Stage for GetOnly {
    fn name(&self) -> &'static str {
        "methods"
    }

    async fn on_request(&self, request: Request, _ctx: &mut RequestContext) -> Flow {
        if request.method() == Method::GET || request.method() == Method::HEAD {
            return Flow::Next(request);
        }

        let mut response = status_response(StatusCode::METHOD_NOT_ALLOWED);
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
        Flow::Respond(response)
    }
}

/// Strips the base path; requests outside of it are not found.
pub struct StripPrefix {
    prefix: String,
}

impl StripPrefix {
    /// `prefix` has no trailing slash; an empty prefix accepts everything.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn strip<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(self.prefix.as_str())?;

        if rest.is_empty() || rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }
}

#[async_trait]
impl Stage for StripPrefix {
    fn name(&self) -> &'static str {
        "base_path"
    }

    async fn on_request(&self, mut request: Request, _ctx: &mut RequestContext) -> Flow {
        if self.prefix.is_empty() {
            return Flow::Next(request);
        }

        let stripped = match self.strip(request.uri().path()) {
            Some("") => "/".to_string(),
            Some(rest) => rest.to_string(),
            None => return Flow::Respond(status_response(StatusCode::NOT_FOUND)),
        };

        match set_request_path(&mut request, &stripped) {
            Ok(()) => Flow::Next(request),
            Err(e) => {
                tracing::debug!(error = %e, "Could not strip base path");
                Flow::Respond(status_response(StatusCode::BAD_REQUEST))
            }
        }
    }

    /// Redirects from the file service point below the stripped path; put the base back.
    fn on_response(&self, _ctx: &RequestContext, response: &mut Response) {
        if self.prefix.is_empty() || !response.status().is_redirection() {
            return;
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .filter(|location| location.starts_with('/') && !location.starts_with("//"))
            .map(|location| format!("{}{location}", self.prefix));

        if let Some(value) = location.and_then(|l| HeaderValue::from_str(&l).ok()) {
            response.headers_mut().insert(LOCATION, value);
        }
    }
}

/// Rewrites the request path to the first matching try-file rule.
pub struct TryFileStage {
    tries: TryFiles,
    probe: Arc<dyn FileProbe>,
}

impl TryFileStage {
    pub fn new(tries: TryFiles, probe: Arc<dyn FileProbe>) -> Self {
        Self { tries, probe }
    }
}

#[async_trait]
impl Stage for TryFileStage {
    fn name(&self) -> &'static str {
        "try_files"
    }

    async fn on_request(&self, mut request: Request, _ctx: &mut RequestContext) -> Flow {
        let path = request.uri().path().to_string();

        if let Some(resolved) = self.tries.resolve(&path, self.probe.as_ref()).await {
            if let Err(e) = set_request_path(&mut request, &resolved) {
                tracing::warn!(error = %e, path = %resolved, "Try file produced an invalid path");
            }
        }

        Flow::Next(request)
    }
}

/// Records request count and latency through the `metrics` facade.
pub struct RequestMetrics;

#[async_trait]
impl Stage for RequestMetrics {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn on_response(&self, ctx: &RequestContext, response: &mut Response) {
        let method = ctx.method.to_string();
        let status = response.status().as_u16().to_string();

        metrics::counter!("http_server_requests_total", "method" => method.clone(), "status" => status)
            .increment(1);
        metrics::histogram!("http_server_request_duration_seconds", "method" => method)
            .record(ctx.started.elapsed().as_secs_f64());
    }
}
