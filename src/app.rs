//! Assembly of the listeners from a validated configuration.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::{ServeConfig, SERVER_SHUTDOWN_TIMEOUT};
use crate::http::static_files::StaticFiles;
use crate::http::{Group, GroupError, ServerSpec};
use crate::middleware::{
    AccessLog, AddHeaders, Correlation, GetOnly, RequestMetrics, StripPrefix, TryFileStage,
};
use crate::pipeline::{Pipeline, Stage};
use crate::telemetry::instrumentation_router;
use crate::tls::ServerTls;
use crate::tryfile::RootProbe;

/// Name of the listener serving content
pub const CONTENT_SERVER: &str = "files";

/// Name of the listener exposing metrics
pub const INSTRUMENTATION_SERVER: &str = "instrumentation";

/// Build the content pipeline.
///
/// `filters` run first, ahead of everything else, so they can reject requests
/// before any other work is done.
pub fn content_pipeline(config: &ServeConfig, filters: Vec<Arc<dyn Stage>>) -> Pipeline {
    let mut pipeline = Pipeline::new(StaticFiles::new(&config.root)).stages(filters);

    if config.telemetry {
        pipeline = pipeline.stage(RequestMetrics);
    }

    pipeline = pipeline
        .stage(AddHeaders::new(config.headers.clone()))
        .stage(Correlation)
        .stage(AccessLog)
        .stage(GetOnly)
        .stage(StripPrefix::new(config.base_prefix.clone()));

    if !config.try_files.is_empty() {
        pipeline = pipeline.stage(TryFileStage::new(
            config.try_files.clone(),
            Arc::new(RootProbe::new(config.root.clone())),
        ));
    }

    tracing::debug!(stages = ?pipeline.stage_names(), "Built content pipeline");
    pipeline
}

/// Build the server group: the content listener and, with a metrics handle, the
/// instrumentation listener.
pub fn server_group(
    config: &ServeConfig,
    tls: Option<ServerTls>,
    metrics: Option<PrometheusHandle>,
    filters: Vec<Arc<dyn Stage>>,
) -> Result<Group, GroupError> {
    let content = ServerSpec::new(config.listen_addr.clone())
        .handler(content_pipeline(config, filters).into_router())
        .tls(tls);

    let mut builder = Group::builder()
        .shutdown_timeout(SERVER_SHUTDOWN_TIMEOUT)
        .server(CONTENT_SERVER, content);

    if let Some(handle) = metrics {
        let instrumentation = ServerSpec::new(config.instrument_addr.clone())
            .handler(instrumentation_router(handle));
        builder = builder.server(INSTRUMENTATION_SERVER, instrumentation);
    }

    builder.build()
}
