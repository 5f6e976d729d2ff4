//! Static file serving from the content root.
//!
//! Directory requests are answered with the directory's index document; a
//! directory requested without trailing slash is redirected to the slash form.

use std::path::Path;

use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use tower::ServiceExt;
use tower_http::services::ServeDir;

/// Static file service rooted at `root`.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    inner: ServeDir,
}

impl StaticFiles {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: ServeDir::new(root).append_index_html_on_directories(true),
        }
    }

    /// Serve `request` from disk. A missing file yields 404.
    pub async fn serve(&self, request: Request) -> Response {
        match self.inner.clone().oneshot(request).await {
            Ok(response) => response.map(Body::new),
            Err(never) => match never {},
        }
    }
}
