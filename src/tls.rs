//! TLS configuration from the command line certificate sources.
//!
//! Supports three modes:
//! - **Static**: user-provided certificate and key files
//! - **ACME**: automatic certificates for an exact domain allow-list
//! - **None**: plain HTTP
//!
//! Either identity mode may additionally require client certificates signed by
//! one of the configured client CAs (mutual TLS). Resolution only reads files;
//! ACME issuance happens lazily once the driver runs and handshakes arrive.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use futures::StreamExt;
use rustls::crypto::CryptoProvider;
use rustls::server::{ResolvesServerCert, WebPkiClientVerifier};
use rustls::{RootCertStore, ServerConfig};
use rustls_acme::axum::AxumAcceptor;
use rustls_acme::caches::DirCache;
use rustls_acme::{AcmeConfig, AcmeState};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::DEFAULT_ACME_ENDPOINT;
use crate::http::shutdown::Shutdown;

/// ALPN protocols offered to clients
const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Certificate source parameters as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub acme_domains: Vec<String>,
    pub cert_cache: PathBuf,
    pub acme_endpoint: Option<String>,
    pub client_cas: Vec<PathBuf>,
}

/// TLS configuration error
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("invalid tls config, cert and key must both be given or not given")]
    IncompletePair,

    #[error("either cert+key or acme domains are to be given, not both")]
    ConflictingSources,

    #[error("client CAs are only valid if cert+key or acme domains are given")]
    ClientCaWithoutIdentity,

    #[error("could not load certificate {path:?}: {reason}")]
    Certificate { path: PathBuf, reason: String },

    #[error("could not load private key {path:?}: {reason}")]
    PrivateKey { path: PathBuf, reason: String },

    #[error("could not read client CA file {path:?}: {reason}")]
    ClientCa { path: PathBuf, reason: String },

    #[error("could not build TLS configuration: {0}")]
    Rustls(String),
}

impl TlsSettings {
    fn has_pair(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }

    /// Whether any server identity source is configured.
    pub fn is_enabled(&self) -> bool {
        self.cert.is_some() || self.key.is_some() || !self.acme_domains.is_empty()
    }

    /// Check the parameter combination without touching any file.
    pub fn validate(&self) -> Result<(), TlsError> {
        if self.cert.is_some() != self.key.is_some() {
            return Err(TlsError::IncompletePair);
        }

        if self.has_pair() && !self.acme_domains.is_empty() {
            return Err(TlsError::ConflictingSources);
        }

        if !self.has_pair() && self.acme_domains.is_empty() && !self.client_cas.is_empty() {
            return Err(TlsError::ClientCaWithoutIdentity);
        }

        Ok(())
    }

    /// Resolve the settings into a TLS configuration. `Ok(None)` means plain HTTP.
    pub fn resolve(&self) -> Result<Option<TlsConfiguration>, TlsError> {
        self.validate()?;

        if let (Some(cert), Some(key)) = (&self.cert, &self.key) {
            let server_config = self.static_server_config(cert, key)?;
            return Ok(Some(TlsConfiguration {
                acceptor: ServerTls::Rustls(RustlsConfig::from_config(server_config)),
                acme: None,
                mutual: !self.client_cas.is_empty(),
            }));
        }

        if !self.acme_domains.is_empty() {
            return self.acme_configuration().map(Some);
        }

        Ok(None)
    }

    /// Build the rustls configuration for the static certificate pair.
    ///
    /// Also used to reload certificates without restarting.
    pub fn static_server_config(&self, cert: &Path, key: &Path) -> Result<Arc<ServerConfig>, TlsError> {
        let chain = load_certificates(cert)?;
        let key_der = PrivateKeyDer::from_pem_file(key).map_err(|e| TlsError::PrivateKey {
            path: key.to_path_buf(),
            reason: e.to_string(),
        })?;

        let provider = crypto_provider();
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| TlsError::Rustls(e.to_string()))?;

        let mut config = match self.client_verifier(&provider)? {
            Some(verifier) => builder.with_client_cert_verifier(verifier),
            None => builder.with_no_client_auth(),
        }
        .with_single_cert(chain, key_der)
        .map_err(|e| TlsError::Rustls(e.to_string()))?;

        config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
        Ok(Arc::new(config))
    }

    fn acme_configuration(&self) -> Result<TlsConfiguration, TlsError> {
        let endpoint = self
            .acme_endpoint
            .as_deref()
            .unwrap_or(DEFAULT_ACME_ENDPOINT);

        let state = AcmeConfig::new(self.acme_domains.clone())
            .cache(DirCache::new(self.cert_cache.clone()))
            .directory(endpoint)
            .state();

        let provider = crypto_provider();
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Rustls(e.to_string()))?;

        let resolver: Arc<dyn ResolvesServerCert> = state.resolver();
        let mut config = match self.client_verifier(&provider)? {
            Some(verifier) => builder.with_client_cert_verifier(verifier),
            None => builder.with_no_client_auth(),
        }
        .with_cert_resolver(resolver);

        config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
        let acceptor = state.axum_acceptor(Arc::new(config));

        Ok(TlsConfiguration {
            acceptor: ServerTls::Acme(acceptor),
            acme: Some(AcmeDriver {
                state,
                domains: self.acme_domains.clone(),
                cache: self.cert_cache.clone(),
                endpoint: endpoint.to_string(),
            }),
            mutual: !self.client_cas.is_empty(),
        })
    }

    /// Verifier requiring client certificates from the configured CAs, if any.
    fn client_verifier(
        &self,
        provider: &Arc<CryptoProvider>,
    ) -> Result<Option<Arc<dyn rustls::server::danger::ClientCertVerifier>>, TlsError> {
        if self.client_cas.is_empty() {
            return Ok(None);
        }

        let mut roots = RootCertStore::empty();

        for ca in &self.client_cas {
            for cert in load_certificates(ca).map_err(|e| TlsError::ClientCa {
                path: ca.clone(),
                reason: e.to_string(),
            })? {
                roots.add(cert).map_err(|e| TlsError::ClientCa {
                    path: ca.clone(),
                    reason: e.to_string(),
                })?;
            }
        }

        WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map(Some)
            .map_err(|e| TlsError::Rustls(e.to_string()))
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Install the process-wide crypto provider used by configurations built outside this module.
pub fn install_crypto_provider() {
    // Err means a provider is already installed
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Read every certificate of a PEM file. A file without certificates is an error.
fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let invalid = |reason: String| TlsError::Certificate {
        path: path.to_path_buf(),
        reason,
    };

    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| invalid(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid(e.to_string()))?;

    if certs.is_empty() {
        return Err(invalid("no certificates found".to_string()));
    }

    Ok(certs)
}

/// How a listener terminates TLS.
#[derive(Clone)]
pub enum ServerTls {
    /// Fixed rustls configuration, reloadable in place
    Rustls(RustlsConfig),
    /// ACME managed certificates, answering TLS-ALPN challenges itself
    Acme(AxumAcceptor),
}

impl fmt::Debug for ServerTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerTls::Rustls(_) => f.write_str("ServerTls::Rustls"),
            ServerTls::Acme(_) => f.write_str("ServerTls::Acme"),
        }
    }
}

/// A resolved TLS configuration: exactly one identity source, optional client auth.
pub struct TlsConfiguration {
    acceptor: ServerTls,
    acme: Option<AcmeDriver>,
    mutual: bool,
}

impl TlsConfiguration {
    pub fn server_tls(&self) -> ServerTls {
        self.acceptor.clone()
    }

    pub fn is_acme(&self) -> bool {
        matches!(self.acceptor, ServerTls::Acme(_))
    }

    /// Whether clients must present a certificate.
    pub fn is_mutual(&self) -> bool {
        self.mutual
    }

    /// The ACME driver, which must be run for certificates to be issued and renewed.
    pub fn take_acme_driver(&mut self) -> Option<AcmeDriver> {
        self.acme.take()
    }
}

impl fmt::Debug for TlsConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfiguration")
            .field("acceptor", &self.acceptor)
            .field("acme", &self.acme.as_ref().map(|d| &d.domains))
            .field("mutual", &self.mutual)
            .finish()
    }
}

/// Drives the certificate manager: orders, renews and caches certificates.
pub struct AcmeDriver {
    state: AcmeState<std::io::Error>,
    domains: Vec<String>,
    cache: PathBuf,
    endpoint: String,
}

impl AcmeDriver {
    /// Poll the certificate manager until shutdown.
    pub async fn run(mut self, shutdown: Shutdown) {
        tracing::info!(
            domains = ?self.domains,
            cache = %self.cache.display(),
            endpoint = %self.endpoint,
            "Starting ACME certificate manager"
        );

        loop {
            tokio::select! {
                _ = shutdown.triggered() => {
                    tracing::debug!("ACME certificate manager stopped");
                    break;
                }
                event = self.state.next() => match event {
                    Some(Ok(event)) => tracing::info!(event = ?event, "ACME event"),
                    Some(Err(err)) => tracing::error!(error = %err, "ACME error"),
                    None => {
                        tracing::debug!("ACME state stream ended");
                        break;
                    }
                },
            }
        }
    }
}
