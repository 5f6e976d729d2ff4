//! End-to-end request handling through the content router.
//!
//! Run with: cargo test --test content

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use clap::Parser;
use http::{Method, StatusCode};
use tower::ServiceExt;

use quayside::app::content_pipeline;
use quayside::config::{Args, ServeConfig, CORRELATION_HEADER, SERVER_IDENTITY};
use quayside::pipeline::{Flow, RequestContext, Stage};

fn site() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>spa</h1>").unwrap();
    std::fs::write(dir.path().join("app.js"), "console.log('app')").unwrap();
    std::fs::write(dir.path().join("headers.txt"), "# extra\nX-Test: b\nX-File: yes\n").unwrap();
    dir
}

fn config(root: &Path, extra: &[&str]) -> ServeConfig {
    let mut argv = vec!["quayside".to_string(), "--root".to_string(), root.display().to_string()];
    argv.extend(extra.iter().map(|s| s.to_string()));
    ServeConfig::from_args(&Args::parse_from(argv)).unwrap()
}

async fn send(
    config: &ServeConfig,
    filters: Vec<Arc<dyn Stage>>,
    method: Method,
    path: &str,
) -> (StatusCode, http::HeaderMap, String) {
    let request = Request::builder()
        .method(method)
        .uri(path)
        .body(Body::empty())
        .unwrap();

    let response = content_pipeline(config, filters)
        .into_router()
        .oneshot(request)
        .await
        .unwrap();

    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn test_headers_from_flags_and_files() {
    let dir = site();
    let headerfile = dir.path().join("headers.txt").display().to_string();
    let config = config(dir.path(), &["--header", "X-Test: a", "--headerfile", &headerfile]);

    let (status, headers, _) = send(&config, Vec::new(), Method::GET, "/app.js").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("server").unwrap(), SERVER_IDENTITY);
    assert_eq!(headers.get("x-test").unwrap(), "b");
    assert_eq!(headers.get("x-file").unwrap(), "yes");
    assert!(headers.get(CORRELATION_HEADER).is_some());
}

#[tokio::test]
async fn test_try_files_fall_back_to_index() {
    let dir = site();
    let config = config(dir.path(), &["--tryfile", "$uri", "--tryfile", "/index.html"]);

    let (status, _, body) = send(&config, Vec::new(), Method::GET, "/missing.js").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "<h1>spa</h1>");

    let (status, _, body) = send(&config, Vec::new(), Method::GET, "/app.js").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "console.log('app')");
}

#[tokio::test]
async fn test_directory_rule_needs_index_document() {
    let dir = site();
    std::fs::create_dir(dir.path().join("empty")).unwrap();
    std::fs::create_dir(dir.path().join("guide")).unwrap();
    std::fs::write(dir.path().join("guide/index.html"), "guide").unwrap();
    let config = config(dir.path(), &["--tryfile", "$uri/", "--tryfile", "/index.html"]);

    let (status, _, body) = send(&config, Vec::new(), Method::GET, "/empty").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "<h1>spa</h1>");

    let (status, _, body) = send(&config, Vec::new(), Method::GET, "/guide").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "guide");
}

#[tokio::test]
async fn test_missing_without_try_files() {
    let dir = site();
    let config = config(dir.path(), &[]);

    let (status, headers, _) = send(&config, Vec::new(), Method::GET, "/missing.js").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    // headers are applied to error responses too
    assert_eq!(headers.get("server").unwrap(), SERVER_IDENTITY);
}

#[tokio::test]
async fn test_base_path() {
    let dir = site();
    let config = config(dir.path(), &["--base", "/static/"]);

    let (status, _, body) = send(&config, Vec::new(), Method::GET, "/static/app.js").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "console.log('app')");

    let (status, _, _) = send(&config, Vec::new(), Method::GET, "/app.js").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_directory_redirect_under_base_path() {
    let dir = site();
    std::fs::create_dir(dir.path().join("docs")).unwrap();
    std::fs::write(dir.path().join("docs/index.html"), "docs").unwrap();
    let config = config(dir.path(), &["--base", "/app/"]);

    let (status, headers, _) = send(&config, Vec::new(), Method::GET, "/app/docs").await;
    assert!(status.is_redirection());
    assert_eq!(headers.get("location").unwrap(), "/app/docs/");

    let (status, _, body) = send(&config, Vec::new(), Method::GET, "/app/docs/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "docs");
}

#[tokio::test]
async fn test_only_get_and_head() {
    let dir = site();
    let config = config(dir.path(), &[]);

    let (status, headers, _) = send(&config, Vec::new(), Method::DELETE, "/app.js").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(headers.get("allow").unwrap(), "GET, HEAD");

    let (status, _, body) = send(&config, Vec::new(), Method::HEAD, "/app.js").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
}

/// Rejects every path under `/private`.
struct DenyPrivate;

#[async_trait]
impl Stage for DenyPrivate {
    fn name(&self) -> &'static str {
        "deny_private"
    }

    async fn on_request(&self, request: Request, _ctx: &mut RequestContext) -> Flow {
        if request.uri().path().starts_with("/private") {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::FORBIDDEN;
            return Flow::Respond(response);
        }
        Flow::Next(request)
    }
}

#[tokio::test]
async fn test_request_filters_run_first() {
    let dir = site();
    let config = config(dir.path(), &["--tryfile", "$uri", "--tryfile", "/index.html"]);
    let filters: Vec<Arc<dyn Stage>> = vec![Arc::new(DenyPrivate)];

    let (status, headers, _) = send(&config, filters.clone(), Method::GET, "/private/x").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    // rejected before the header stage was entered
    assert!(headers.get("server").is_none());

    let (status, _, _) = send(&config, filters, Method::GET, "/public/x").await;
    assert_eq!(status, StatusCode::OK);
}
