//! Quayside entry point.
//!
//! Parses the command line, initializes logging, resolves the TLS configuration,
//! starts the content and instrumentation listeners and waits for a termination
//! signal.

use std::process::ExitCode;

use clap::Parser;

use quayside::app::server_group;
use quayside::config::{Args, ServeConfig, SERVER_IDENTITY};
use quayside::http::shutdown::{setup_reload_handler, setup_shutdown_handler};
use quayside::http::Shutdown;
use quayside::telemetry::install_metrics_recorder;
use quayside::tls::{install_crypto_provider, ServerTls};
use quayside::{logging, AppError};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = logging::init(&args.log, &args.logstyle) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match run(&args).await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<(), AppError> {
    install_crypto_provider();

    let config = ServeConfig::from_args(args)?;

    tracing::info!(
        version = SERVER_IDENTITY,
        root = %config.root.display(),
        base = %args.base,
        addr = %config.listen_addr,
        telemetry = config.telemetry,
        "Loaded configuration"
    );

    let shutdown = Shutdown::new();

    let mut tls = config.tls.resolve()?;
    let server_tls = tls.as_ref().map(|tls| tls.server_tls());

    if let Some(tls) = tls.as_mut() {
        tracing::info!(acme = tls.is_acme(), mutual = tls.is_mutual(), "TLS enabled");

        if let Some(driver) = tls.take_acme_driver() {
            tokio::spawn(driver.run(shutdown.clone()));
        }
    }

    if let Some(ServerTls::Rustls(rustls)) = &server_tls {
        setup_reload_handler(rustls.clone(), config.tls.clone(), shutdown.clone());
    }

    let metrics = if config.telemetry {
        Some(install_metrics_recorder()?)
    } else {
        None
    };

    let mut group = server_group(&config, server_tls, metrics, Vec::new())?;

    setup_shutdown_handler(shutdown.clone());
    group.start_all(&shutdown)?;

    for (name, addr) in group.local_addrs() {
        tracing::info!(name = %name, addr = %addr, "Listening");
    }

    group.wait_all_servers_shutdown().await;

    Ok(())
}
