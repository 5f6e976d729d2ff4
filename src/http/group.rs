//! Lifecycle of a group of HTTP(S) listeners sharing one cancellation signal.
//!
//! Starting is atomic: every listener is bound, in declaration order, before any of
//! them serves. If one bind fails the already bound sockets are closed again and
//! nothing runs. Once serving, listeners are independent: a listener whose serve
//! loop fails is logged and the others keep running. When the shared [`Shutdown`]
//! fires, each listener gets one graceful shutdown attempt bounded by the group's
//! shutdown timeout, is force-closed if that is not enough, and is abandoned after a
//! further fixed safety window so that waiting for the group always returns.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use axum::Router;
use axum_server::Handle;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;

use crate::config::{SERVER_SHUTDOWN_SAFETY_TIMEOUT, SERVER_SHUTDOWN_TIMEOUT};
use crate::http::shutdown::Shutdown;
use crate::tls::ServerTls;

/// Group configuration and startup error
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("no servers configured")]
    NoServers,

    #[error("server {0:?} has no handler")]
    MissingHandler(String),

    #[error("duplicate server name {0:?}")]
    DuplicateName(String),

    #[error("server and name length mismatch: {servers} vs {names}")]
    NameMismatch { servers: usize, names: usize },

    #[error("error creating group: {}", join_errors(.0))]
    Config(Vec<GroupError>),

    #[error("shutdown already requested before start")]
    Cancelled,

    #[error("group was already started")]
    AlreadyStarted,

    #[error("could not listen for server {name} on {addr}: {source}")]
    Bind {
        name: String,
        addr: String,
        #[source]
        source: io::Error,
    },
}

fn join_errors(errors: &[GroupError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// One listener: address, handler and optional TLS termination.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    addr: String,
    handler: Option<Router>,
    tls: Option<ServerTls>,
}

impl ServerSpec {
    /// A listener on `addr` (`host:port`; port 0 picks a free port).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            handler: None,
            tls: None,
        }
    }

    pub fn handler(mut self, handler: Router) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn tls(mut self, tls: Option<ServerTls>) -> Self {
        self.tls = tls;
        self
    }
}

/// A validated listener owned by the group.
struct NamedServer {
    name: String,
    addr: String,
    handler: Router,
    tls: Option<ServerTls>,
}

/// Collects servers and settings; [`GroupBuilder::build`] reports every problem at once.
pub struct GroupBuilder {
    servers: Vec<NamedServer>,
    errors: Vec<GroupError>,
    shutdown_timeout: Duration,
    span: tracing::Span,
}

impl Default for GroupBuilder {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            errors: Vec::new(),
            shutdown_timeout: SERVER_SHUTDOWN_TIMEOUT,
            span: tracing::Span::none(),
        }
    }
}

impl GroupBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named server.
    pub fn server(mut self, name: impl Into<String>, spec: ServerSpec) -> Self {
        let name = name.into();

        if self.servers.iter().any(|server| server.name == name) {
            self.errors.push(GroupError::DuplicateName(name));
            return self;
        }

        match spec.handler {
            Some(handler) => self.servers.push(NamedServer {
                name,
                addr: spec.addr,
                handler,
                tls: spec.tls,
            }),
            None => self.errors.push(GroupError::MissingHandler(name)),
        }

        self
    }

    /// Add servers with their names, pairwise.
    pub fn servers(mut self, specs: Vec<ServerSpec>, names: Vec<String>) -> Self {
        if specs.len() != names.len() {
            self.errors.push(GroupError::NameMismatch {
                servers: specs.len(),
                names: names.len(),
            });
            return self;
        }

        specs
            .into_iter()
            .zip(names)
            .fold(self, |builder, (spec, name)| builder.server(name, spec))
    }

    /// Time each listener is given to drain connections on shutdown.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Span the group logs in.
    pub fn span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn build(self) -> Result<Group, GroupError> {
        if !self.errors.is_empty() {
            return Err(GroupError::Config(self.errors));
        }

        Ok(Group {
            names: self.servers.iter().map(|s| s.name.clone()).collect(),
            servers: self.servers,
            state: StdMutex::new(GroupState::Configured),
            shutdown_timeout: self.shutdown_timeout,
            span: self.span,
            running: Arc::new(AtomicUsize::new(0)),
            tasks: Mutex::new(JoinSet::new()),
            bound: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Configured,
    Started,
    Terminated,
}

/// A set of listeners started and stopped together.
pub struct Group {
    names: Vec<String>,
    servers: Vec<NamedServer>,
    state: StdMutex<GroupState>,
    shutdown_timeout: Duration,
    span: tracing::Span,
    running: Arc<AtomicUsize>,
    tasks: Mutex<JoinSet<()>>,
    bound: Vec<(String, SocketAddr)>,
}

impl Group {
    pub fn builder() -> GroupBuilder {
        GroupBuilder::new()
    }

    pub fn state(&self) -> GroupState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: GroupState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Configured listener names, in start order.
    pub fn server_names(&self) -> &[String] {
        &self.names
    }

    /// Number of listeners currently serving. Informational only.
    pub fn server_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Names and local addresses of the listeners bound by [`Group::start_all`].
    pub fn local_addrs(&self) -> &[(String, SocketAddr)] {
        &self.bound
    }

    /// Bind every listener, then start serving each on its own task.
    ///
    /// Returns as soon as all sockets are bound. Nothing is left running on error.
    pub fn start_all(&mut self, shutdown: &Shutdown) -> Result<(), GroupError> {
        let _enter = self.span.enter();

        if self.state() != GroupState::Configured {
            return Err(GroupError::AlreadyStarted);
        }

        if shutdown.is_triggered() {
            return Err(GroupError::Cancelled);
        }

        if self.servers.is_empty() {
            return Err(GroupError::NoServers);
        }

        let servers = std::mem::take(&mut self.servers);

        let listeners = match bind_listeners(&servers) {
            Ok(listeners) => listeners,
            Err(e) => {
                self.set_state(GroupState::Terminated);
                return Err(e);
            }
        };

        self.set_state(GroupState::Started);
        // start_all holds &mut self, so nobody else can hold the lock
        let tasks = self.tasks.get_mut();

        for (server, listener) in servers.into_iter().zip(listeners) {
            let local = listener
                .local_addr()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
            self.bound.push((server.name.clone(), local));

            self.running.fetch_add(1, Ordering::SeqCst);
            let cycle = ServerCycle {
                name: server.name,
                local,
                shutdown: shutdown.clone(),
                shutdown_timeout: self.shutdown_timeout,
                running: RunningGuard(self.running.clone()),
            };

            tasks.spawn(
                cycle
                    .run(listener, server.handler, server.tls)
                    .instrument(self.span.clone()),
            );
        }

        Ok(())
    }

    /// Wait until every listener task has finished. A started group is terminated afterwards.
    pub async fn wait_all_servers_shutdown(&self) {
        async {
            tracing::info!("Waiting for servers to shut down");

            let mut tasks = self.tasks.lock().await;
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Server task failed");
                }
            }

            if self.state() == GroupState::Started {
                self.set_state(GroupState::Terminated);
            }

            tracing::info!("All servers shut down");
        }
        .instrument(self.span.clone())
        .await
    }
}

/// Bind all listeners in order; on failure every listener bound so far is closed.
fn bind_listeners(servers: &[NamedServer]) -> Result<Vec<TcpListener>, GroupError> {
    let mut listeners = Vec::with_capacity(servers.len());

    for server in servers {
        let bound = TcpListener::bind(&server.addr).and_then(|listener| {
            listener.set_nonblocking(true)?;
            Ok(listener)
        });

        match bound {
            Ok(listener) => listeners.push(listener),
            Err(source) => {
                for listener in listeners.drain(..) {
                    tracing::debug!(addr = ?listener.local_addr().ok(), "Closing listener after failed bind");
                    drop(listener);
                }

                return Err(GroupError::Bind {
                    name: server.name.clone(),
                    addr: server.addr.clone(),
                    source,
                });
            }
        }
    }

    Ok(listeners)
}

/// Decrements the serving counter when a listener task ends, however it ends.
struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ServerCycle {
    name: String,
    local: SocketAddr,
    shutdown: Shutdown,
    shutdown_timeout: Duration,
    running: RunningGuard,
}

impl ServerCycle {
    async fn run(self, listener: TcpListener, handler: Router, tls: Option<ServerTls>) {
        let name = self.name.as_str();
        let handle = Handle::new();
        let mut serving = tokio::spawn(serve(listener, handler, tls, handle.clone()));

        tracing::info!(name = %name, addr = %self.local, "Server started");

        tokio::select! {
            _ = self.shutdown.triggered() => {
                tracing::info!(name = %name, "Server received cancellation");
                handle.graceful_shutdown(Some(self.shutdown_timeout));

                match tokio::time::timeout(self.shutdown_timeout, &mut serving).await {
                    Ok(result) => {
                        report(name, result);
                        tracing::info!(name = %name, "Server shut down");
                    }
                    Err(_) => {
                        tracing::error!(
                            name = %name,
                            timeout = ?self.shutdown_timeout,
                            "Graceful shutdown timed out, closing server"
                        );
                        handle.shutdown();
                        self.await_forced(&mut serving).await;
                    }
                }
            }
            result = &mut serving => {
                report(name, result);
            }
        }

        drop(self.running);
    }

    /// Second, fixed window after a forced close; the serve task is abandoned afterwards.
    async fn await_forced(&self, serving: &mut JoinHandle<io::Result<()>>) {
        match tokio::time::timeout(SERVER_SHUTDOWN_SAFETY_TIMEOUT, &mut *serving).await {
            Ok(result) => report(&self.name, result),
            Err(_) => {
                tracing::warn!(name = %self.name, "Server shutdown timed out, abandoning it");
                serving.abort();
            }
        }
    }
}

fn report(name: &str, result: Result<io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => tracing::info!(name = %name, "Server stopped accepting new connections"),
        Ok(Err(e)) => tracing::error!(name = %name, error = %e, "Server stopped with error"),
        Err(e) => tracing::error!(name = %name, error = %e, "Server task failed"),
    }
}

async fn serve(
    listener: TcpListener,
    handler: Router,
    tls: Option<ServerTls>,
    handle: Handle,
) -> io::Result<()> {
    let service = handler.into_make_service_with_connect_info::<SocketAddr>();

    match tls {
        None => {
            axum_server::from_tcp(listener)
                .handle(handle)
                .serve(service)
                .await
        }
        Some(ServerTls::Rustls(config)) => {
            axum_server::from_tcp_rustls(listener, config)
                .handle(handle)
                .serve(service)
                .await
        }
        Some(ServerTls::Acme(acceptor)) => {
            axum_server::from_tcp(listener)
                .acceptor(acceptor)
                .handle(handle)
                .serve(service)
                .await
        }
    }
}
