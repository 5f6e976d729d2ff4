//! Request pipeline.
//!
//! A pipeline is an ordered list of [`Stage`]s in front of the static file service.
//! Each stage sees the request in order and either passes it on or answers it
//! itself. Responses then travel back through the stages that were entered, in
//! reverse order, so a stage can decorate every response it let through or that
//! a later stage produced.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::Response;
use axum::Router;
use http::uri::{PathAndQuery, Uri};
use http::Method;
use tracing::Instrument;

use crate::http::static_files::StaticFiles;

/// What a stage decided about a request.
pub enum Flow {
    /// Hand the (possibly modified) request to the next stage
    Next(Request),
    /// Answer right away; later stages and the file service are skipped
    Respond(Response),
}

/// Per-request data shared by the stages.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub started: Instant,
    pub method: Method,
    /// Path as received, before any rewriting
    pub original_path: String,
    pub remote: Option<SocketAddr>,
    pub correlation_id: Option<String>,
}

impl RequestContext {
    fn new(request: &Request) -> Self {
        Self {
            started: Instant::now(),
            method: request.method().clone(),
            original_path: request.uri().path().to_string(),
            remote: request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
            correlation_id: None,
        }
    }
}

/// One step of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Inspect or transform the request.
    async fn on_request(&self, request: Request, ctx: &mut RequestContext) -> Flow {
        let _ = ctx;
        Flow::Next(request)
    }

    /// Decorate the response on its way out.
    fn on_response(&self, _ctx: &RequestContext, _response: &mut Response) {}
}

/// Ordered stages in front of the static file service.
#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    files: StaticFiles,
}

impl Pipeline {
    pub fn new(files: StaticFiles) -> Self {
        Self {
            stages: Vec::new(),
            files,
        }
    }

    /// Append a stage; stages run in the order they are added.
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Append already shared stages, e.g. externally supplied request filters.
    pub fn stages(mut self, stages: impl IntoIterator<Item = Arc<dyn Stage>>) -> Self {
        self.stages.extend(stages);
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run a request through all stages and the file service.
    pub async fn handle(&self, request: Request) -> Response {
        let mut ctx = RequestContext::new(&request);
        let span = tracing::info_span!(
            "request",
            method = %ctx.method,
            path = %ctx.original_path,
            correlation_id = tracing::field::Empty,
        );

        async move {
            let (entered, flow) = self.run_stages(request, &mut ctx).await;

            let mut response = match flow {
                Flow::Next(request) => self.files.serve(request).await,
                Flow::Respond(response) => response,
            };

            for stage in self.stages[..entered].iter().rev() {
                stage.on_response(&ctx, &mut response);
            }

            response
        }
        .instrument(span)
        .await
    }

    /// Returns how many stages were entered and the final decision.
    async fn run_stages(&self, mut request: Request, ctx: &mut RequestContext) -> (usize, Flow) {
        for (idx, stage) in self.stages.iter().enumerate() {
            match stage.on_request(request, ctx).await {
                Flow::Next(next) => request = next,
                Flow::Respond(response) => {
                    tracing::debug!(stage = stage.name(), status = %response.status(), "Stage answered request");
                    return (idx + 1, Flow::Respond(response));
                }
            }
        }

        (self.stages.len(), Flow::Next(request))
    }

    /// Router sending every request through the pipeline.
    pub fn into_router(self) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(Arc::new(self))
    }
}

async fn dispatch(State(pipeline): State<Arc<Pipeline>>, request: Request) -> Response {
    pipeline.handle(request).await
}

/// Replace the path of a request, keeping its query.
pub fn set_request_path(request: &mut Request, path: &str) -> Result<(), http::Error> {
    let path_and_query = match request.uri().query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };

    let mut parts = request.uri().clone().into_parts();
    parts.path_and_query = Some(PathAndQuery::try_from(path_and_query)?);
    *request.uri_mut() = Uri::from_parts(parts)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http::StatusCode;
    use std::sync::Mutex;

    /// Records request and response order into a shared log.
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        answer: Option<StatusCode>,
    }

    #[async_trait]
    impl Stage for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn on_request(&self, request: Request, _ctx: &mut RequestContext) -> Flow {
            self.log.lock().unwrap().push(format!("req:{}", self.name));
            match self.answer {
                Some(status) => Flow::Respond(
                    Response::builder().status(status).body(Body::empty()).unwrap(),
                ),
                None => Flow::Next(request),
            }
        }

        fn on_response(&self, _ctx: &RequestContext, _response: &mut Response) {
            self.log.lock().unwrap().push(format!("res:{}", self.name));
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>, answer: Option<StatusCode>) -> Recorder {
        Recorder {
            name,
            log: log.clone(),
            answer,
        }
    }

    fn get(path: &str) -> Request {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_stage_order_and_file_service() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let pipeline = Pipeline::new(StaticFiles::new(dir.path()))
            .stage(recorder("one", &log, None))
            .stage(recorder("two", &log, None));

        let response = pipeline.handle(get("/a.txt")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["req:one", "req:two", "res:two", "res:one"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_later_stages() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let pipeline = Pipeline::new(StaticFiles::new(dir.path()))
            .stage(recorder("outer", &log, None))
            .stage(recorder("filter", &log, Some(StatusCode::FORBIDDEN)))
            .stage(recorder("inner", &log, None));

        let response = pipeline.handle(get("/anything")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["req:outer", "req:filter", "res:filter", "res:outer"]
        );
    }

    #[test]
    fn test_set_request_path_keeps_query() {
        let mut request = get("http://example.com/old/path?x=1&y=2");
        set_request_path(&mut request, "/new").unwrap();
        assert_eq!(request.uri().to_string(), "http://example.com/new?x=1&y=2");

        let mut request = get("/plain");
        set_request_path(&mut request, "/").unwrap();
        assert_eq!(request.uri().to_string(), "/");
    }
}
