//! Cancellation and signal handling.
//!
//! Handles:
//! - SIGTERM/SIGINT: trigger the shared [`Shutdown`] signal
//! - SIGHUP: certificate reload (static TLS mode only)

use std::path::Path;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use tokio::sync::watch;

use crate::tls::TlsSettings;

/// Shared, clonable cancellation signal. Once triggered it stays triggered.
#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Trigger the signal, waking every waiter.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the signal is triggered. Returns immediately if it already was.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        // the sender lives as long as any clone of self, so this cannot fail here
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Trigger `shutdown` on SIGTERM or SIGINT.
pub fn setup_shutdown_handler(shutdown: Shutdown) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown");
            }
            _ = shutdown.triggered() => return,
        }

        shutdown.trigger();
    });
}

/// Reload the static certificate pair and client CAs on SIGHUP until shutdown.
#[cfg(unix)]
pub fn setup_reload_handler(rustls: RustlsConfig, settings: TlsSettings, shutdown: Shutdown) {
    let (Some(cert), Some(key)) = (settings.cert.clone(), settings.key.clone()) else {
        return;
    };

    tokio::spawn(async move {
        let mut sighup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(sighup) => sighup,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGHUP handler");
                    return;
                }
            };

        loop {
            tokio::select! {
                _ = sighup.recv() => {}
                _ = shutdown.triggered() => break,
            }

            tracing::info!("Received SIGHUP, reloading TLS certificates");
            reload(&rustls, &settings, &cert, &key);
        }
    });
}

/// No-op reload handler for non-Unix platforms.
#[cfg(not(unix))]
pub fn setup_reload_handler(_rustls: RustlsConfig, _settings: TlsSettings, _shutdown: Shutdown) {
    tracing::warn!("Certificate hot-reload via SIGHUP not supported on this platform");
}

fn reload(rustls: &RustlsConfig, settings: &TlsSettings, cert: &Path, key: &Path) {
    match settings.static_server_config(cert, key) {
        Ok(config) => {
            rustls.reload_from_config(config);
            tracing::info!(cert = %cert.display(), key = %key.display(), "TLS certificates reloaded successfully");
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                cert = %cert.display(),
                key = %key.display(),
                "Failed to reload TLS certificates, keeping the previous ones"
            );
        }
    }
}
