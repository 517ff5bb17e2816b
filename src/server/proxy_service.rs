//! Proxy service: one listener bound to one connector and credential set
//!
//! Lifecycle is `Created -> Running -> Stopped`. A stopped service cannot be
//! restarted; build a new one instead.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::Instrument;
use uuid::Uuid;

use super::listener::ServiceListener;
use super::relay::{DuplexStreamer, StreamSummary, StreamTap};
use super::stream::NetworkStream;
use crate::config::ListenAddress;
use crate::connector::TcpConnector;
use crate::credentials::{CredentialSource, ResolvedCredentials, WipeGuard};
use crate::error::{BrokerError, Result};

/// Extra time a connector gets past the handshake timeout to report its own
/// deadline to the client before the connection is dropped.
const HANDSHAKE_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to run a proxy service.
pub struct ServiceSpec {
    /// Service name (for logs)
    pub name: String,
    /// Where to listen
    pub listen_on: ListenAddress,
    /// Backend connector
    pub connector: Arc<dyn TcpConnector>,
    /// Per-connection credential retrieval
    pub credentials: Arc<dyn CredentialSource>,
    /// Bound on credential retrieval, and separately on the backend handshake
    pub handshake_timeout: Option<Duration>,
    /// Concurrent connection limit, 0 for unlimited
    pub max_connections: usize,
    /// Observer for relayed traffic
    pub tap: Option<StreamTap>,
}

impl ServiceSpec {
    /// Spec with no timeout, no connection limit and no tap.
    pub fn new(
        name: impl Into<String>,
        listen_on: ListenAddress,
        connector: Arc<dyn TcpConnector>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            name: name.into(),
            listen_on,
            connector,
            credentials,
            handshake_timeout: None,
            max_connections: 0,
            tap: None,
        }
    }
}

/// Service lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Bound but not accepting
    Created,
    /// Accepting connections
    Running,
    /// Stopped for good
    Stopped,
}

/// Connection counters for one service.
#[derive(Debug, Default)]
pub struct ServiceStats {
    /// Total connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Connections rejected due to limit
    pub connections_rejected: AtomicU64,
    /// Connections that ended before relaying (credentials or handshake)
    pub connections_failed: AtomicU64,
}

/// A listening proxy service.
pub struct ProxyService {
    name: String,
    listen_on: ListenAddress,
    local_addr: Option<SocketAddr>,
    listener: Mutex<Option<ServiceListener>>,
    state: Mutex<ServiceState>,
    done: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    handler: Arc<ConnectionHandler>,
    max_connections: usize,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyService {
    /// Bind the listening socket. Nothing is accepted until [`start`](Self::start).
    pub async fn bind(spec: ServiceSpec) -> Result<Self> {
        let listener = ServiceListener::bind(&spec.listen_on).await?;
        let local_addr = listener.local_addr();
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut streamer = DuplexStreamer::new();
        if let Some(tap) = spec.tap {
            streamer = streamer.with_tap(tap);
        }

        let handler = Arc::new(ConnectionHandler {
            service: spec.name.clone(),
            connector: spec.connector,
            credentials: spec.credentials,
            handshake_timeout: spec.handshake_timeout,
            streamer,
            stats: Arc::new(ServiceStats::default()),
        });

        Ok(Self {
            name: spec.name,
            listen_on: spec.listen_on,
            local_addr,
            listener: Mutex::new(Some(listener)),
            state: Mutex::new(ServiceState::Created),
            done: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            handler,
            max_connections: spec.max_connections,
            accept_task: Mutex::new(None),
        })
    }

    /// Begin accepting connections. Must be called within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            ServiceState::Created => {}
            ServiceState::Running => {
                return Err(BrokerError::ServiceState(format!(
                    "service '{}' is already running",
                    self.name
                )))
            }
            ServiceState::Stopped => {
                return Err(BrokerError::ServiceState(format!(
                    "service '{}' was stopped and cannot be restarted",
                    self.name
                )))
            }
        }

        let listener = self.listener.lock().take().ok_or_else(|| {
            BrokerError::ServiceState(format!("service '{}' has no listener", self.name))
        })?;

        let limit = if self.max_connections > 0 {
            info!(
                "Service '{}' listening on {} (max {} connections)",
                self.name, self.listen_on, self.max_connections
            );
            Some(Arc::new(Semaphore::new(self.max_connections)))
        } else {
            info!(
                "Service '{}' listening on {} (unlimited connections)",
                self.name, self.listen_on
            );
            None
        };

        let accept_loop = AcceptLoop {
            listener,
            handler: Arc::clone(&self.handler),
            limit,
            done: Arc::clone(&self.done),
            shutdown_tx: self.shutdown_tx.clone(),
        };
        let shutdown_rx = self.shutdown_tx.subscribe();
        *self.accept_task.lock() = Some(tokio::spawn(accept_loop.run(shutdown_rx)));
        *state = ServiceState::Running;
        Ok(())
    }

    /// Stop accepting and abort in-flight connections.
    ///
    /// Returns immediately; connection tasks wind down in the background.
    /// Stopping twice is a no-op.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if *state == ServiceState::Stopped {
            return;
        }
        *state = ServiceState::Stopped;
        drop(state);

        // Never started: drop the listener (and its socket file) here.
        self.listener.lock().take();
        self.done.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(());
        info!("Service '{}' stopped", self.name);
    }

    /// Wait for the accept loop to exit after [`stop`](Self::stop).
    pub async fn wait(&self) {
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured listen address.
    pub fn listen_on(&self) -> &ListenAddress {
        &self.listen_on
    }

    /// Bound TCP address, resolving port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Connection counters.
    pub fn stats(&self) -> Arc<ServiceStats> {
        Arc::clone(&self.handler.stats)
    }
}

impl Drop for ProxyService {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ProxyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyService")
            .field("name", &self.name)
            .field("listen_on", &self.listen_on)
            .field("state", &self.state())
            .finish()
    }
}

struct AcceptLoop {
    listener: ServiceListener,
    handler: Arc<ConnectionHandler>,
    limit: Option<Arc<Semaphore>>,
    done: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl AcceptLoop {
    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let service = self.handler.service.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.dispatch(stream, peer),
                        Err(e) => {
                            // In-flight connections keep running until stop().
                            error!("Service '{}': accept failed, no longer accepting: {}", service, e);
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Service '{}': accept loop shutting down", service);
                    break;
                }
            }
        }
    }

    fn dispatch(&self, stream: NetworkStream, peer: String) {
        let stats = &self.handler.stats;

        // Subscribe before checking `done` so a concurrent stop() is never missed.
        let shutdown = self.shutdown_tx.subscribe();
        if self.done.load(Ordering::Acquire) {
            debug!("Service '{}': stopping, dropping {}", self.handler.service, peer);
            return;
        }

        let permit = match &self.limit {
            Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Service '{}': connection limit reached, rejecting {}",
                        self.handler.service, peer
                    );
                    drop(stream);
                    return;
                }
            },
            None => None,
        };

        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        let active = ActiveConnection::new(Arc::clone(stats));

        let session_id = Uuid::new_v4();
        debug!(
            "Service '{}': accepted {} (session {})",
            self.handler.service, peer, session_id
        );
        let span = tracing::info_span!(
            target: "credbroker",
            "connection",
            service = %self.handler.service,
            session = %session_id
        );

        let handler = Arc::clone(&self.handler);
        let task = async move {
            let _permit = permit;
            let _active = active;
            match handler.handle(stream, shutdown).await {
                Ok(summary) => debug!(
                    "Service '{}': {} closed ({} bytes up, {} bytes down)",
                    handler.service, peer, summary.client_to_backend, summary.backend_to_client
                ),
                Err(BrokerError::Shutdown) => {
                    debug!("Service '{}': {} aborted by shutdown", handler.service, peer)
                }
                Err(e) => {
                    handler.stats.connections_failed.fetch_add(1, Ordering::Relaxed);
                    warn!("Service '{}': {} failed: {}", handler.service, peer, e);
                }
            }
        };
        tokio::spawn(task.instrument(span));
    }
}

/// Counts a connection as active until dropped, including on panic.
struct ActiveConnection {
    stats: Arc<ServiceStats>,
}

impl ActiveConnection {
    fn new(stats: Arc<ServiceStats>) -> Self {
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        Self { stats }
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
    }
}

struct ConnectionHandler {
    service: String,
    connector: Arc<dyn TcpConnector>,
    credentials: Arc<dyn CredentialSource>,
    handshake_timeout: Option<Duration>,
    streamer: DuplexStreamer,
    stats: Arc<ServiceStats>,
}

impl ConnectionHandler {
    async fn handle(
        &self,
        mut client: NetworkStream,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<StreamSummary> {
        let backend = tokio::select! {
            result = self.establish(&mut client) => result?,
            _ = shutdown.recv() => return Err(BrokerError::Shutdown),
        };

        debug!(
            "Service '{}': relaying {} <-> {}{}",
            self.service,
            client.peer(),
            backend.peer(),
            backend
                .tls_version()
                .map(|v| format!(" ({})", v))
                .unwrap_or_default()
        );
        Ok(self.streamer.stream(client, backend, Some(shutdown)).await)
    }

    async fn establish(&self, client: &mut NetworkStream) -> Result<NetworkStream> {
        authenticate(
            self.connector.as_ref(),
            self.credentials.as_ref(),
            client,
            self.handshake_timeout,
        )
        .await
    }
}

/// Retrieve fresh credentials and hand them to the connector.
///
/// Retrieval failures, including running past `limit`, are passed to
/// [`TcpConnector::report_failure`] so the client gets a protocol-appropriate
/// error. The connector enforces `limit` on its own handshake; a connector
/// still running [`HANDSHAKE_GRACE`] after that is dropped.
pub async fn authenticate(
    connector: &dyn TcpConnector,
    source: &dyn CredentialSource,
    client: &mut NetworkStream,
    limit: Option<Duration>,
) -> Result<NetworkStream> {
    let retrieved = match limit {
        Some(limit) => match timeout(limit, source.retrieve()).await {
            Ok(result) => result.map_err(BrokerError::from),
            Err(_) => Err(BrokerError::Timeout(format!(
                "credential retrieval did not finish within {:?}",
                limit
            ))),
        },
        None => source.retrieve().await.map_err(BrokerError::from),
    };

    let mut credentials = match retrieved {
        Ok(credentials) => credentials,
        Err(err) => {
            if let Err(report) = connector.report_failure(client, &err).await {
                debug!("Could not report credential failure to client: {}", report);
            }
            return Err(err);
        }
    };

    let work = connect_with_credentials(connector, client, &mut credentials);
    match limit {
        Some(limit) => timeout(limit + HANDSHAKE_GRACE, work).await.map_err(|_| {
            BrokerError::Timeout(format!("connector did not finish within {:?}", limit))
        })?,
        None => work.await,
    }
}

/// Run the connector, wiping `credentials` once it returns, fails or panics.
pub async fn connect_with_credentials(
    connector: &dyn TcpConnector,
    client: &mut NetworkStream,
    credentials: &mut ResolvedCredentials,
) -> Result<NetworkStream> {
    let guard = WipeGuard::new(credentials);
    connector.connect(client, &guard).await
}
