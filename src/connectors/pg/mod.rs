//! `pg` connector: PostgreSQL with broker-held credentials
//!
//! The client connects with any (or no) password. The connector reads its
//! startup packet, authenticates to the real backend with the resolved
//! credentials, and answers the client with a synthesized AuthenticationOk.
//! From then on backend messages (ParameterStatus, BackendKeyData,
//! ReadyForQuery, ...) reach the client through the duplex streamer.
//!
//! Credentials: `host`, `port`, `username`, `password`, `database`,
//! `options`, `sslmode`, `sslrootcert`, `sslcert`, `sslkey`.
//!
//! When the service sets a handshake timeout, the startup read and the
//! backend handshake share that deadline. Running out of time answers the
//! client with a FATAL `XX000` naming the step that stalled.
//!
//! Connector config (optional YAML):
//!
//! ```yaml
//! connect_timeout_secs: 10
//! ```

mod client;
mod details;
mod handshake;

pub use client::read_client_startup;
pub use details::{BackendConnectionDetails, SslMode, DEFAULT_PORT, REQUIRED_CREDENTIALS};
pub use handshake::{FailureCause, HandshakeFailure, HandshakeSession, HandshakeState};

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::Instrument;

use crate::connector::{ConnectorKind, PluginInfo, Resources, TcpConnector};
use crate::credentials::ResolvedCredentials;
use crate::error::{BrokerError, Result};
use crate::protocol::postgres::{write_error, ErrorResponse, AUTHENTICATION_OK, SQLSTATE_INTERNAL_ERROR};
use crate::server::NetworkStream;

/// Settings from the service's `config` block.
#[derive(Debug, Clone, Deserialize)]
pub struct PgConnectorConfig {
    /// Backend TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for PgConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

/// The PostgreSQL TCP connector
#[derive(Debug)]
pub struct PgConnector {
    resources: Resources,
    config: PgConnectorConfig,
}

impl PgConnector {
    /// Connector id.
    pub const ID: &'static str = "pg";

    /// Registration info.
    pub fn plugin_info() -> PluginInfo {
        PluginInfo::new(
            ConnectorKind::Tcp,
            Self::ID,
            "PostgreSQL v3 protocol with backend credential injection",
        )
    }

    /// Build the connector for a service, parsing its config block.
    pub fn new(resources: Resources) -> Result<Self> {
        let config = if resources.config.is_empty() {
            PgConnectorConfig::default()
        } else {
            serde_yaml::from_slice(&resources.config).map_err(|e| {
                BrokerError::Config(format!(
                    "service '{}': invalid pg connector config: {}",
                    resources.service_name, e
                ))
            })?
        };
        Ok(Self { resources, config })
    }

    /// Connector settings.
    pub fn config(&self) -> &PgConnectorConfig {
        &self.config
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.config.connect_timeout_secs)
    }

    fn deadline_exceeded(&self) -> BrokerError {
        match self.resources.handshake_timeout {
            Some(limit) => BrokerError::Timeout(format!("handshake did not finish within {:?}", limit)),
            None => BrokerError::Timeout("handshake did not finish".into()),
        }
    }

    async fn handshake(
        &self,
        client: &mut NetworkStream,
        credentials: &ResolvedCredentials,
    ) -> Result<NetworkStream> {
        let deadline = self
            .resources
            .handshake_timeout
            .map(|limit| Instant::now() + limit);

        let startup = match within(deadline, read_client_startup(client)).await {
            Some(Ok(startup)) => startup,
            Some(Err(e)) => {
                // The client may not speak the protocol at all; just close.
                debug!("Unusable client startup: {}", e);
                return Err(e);
            }
            None => {
                debug!("Client sent no startup packet in time");
                return Err(self.deadline_exceeded());
            }
        };

        let details = match BackendConnectionDetails::from_credentials(credentials) {
            Ok(details) => details,
            Err(e) => {
                send_generic_error(client, "loading backend credentials", &e).await;
                return Err(e);
            }
        };

        let backend_startup = details.backend_startup(&startup);
        let mut session = HandshakeSession::new(&details, self.connect_timeout());

        let outcome = within(deadline, session.run(&backend_startup)).await;
        match outcome {
            Some(Ok(backend)) => {
                client.write_all(&AUTHENTICATION_OK).await?;
                client.flush().await?;
                info!(
                    "Authenticated to {} as {} for database {:?}",
                    details.address(),
                    details.username,
                    backend_startup.database()
                );
                Ok(backend)
            }
            Some(Err(failure)) => {
                warn!("{}", failure);
                match &failure.cause {
                    FailureCause::Backend(response) => {
                        if let Err(e) = write_error(client, response).await {
                            debug!("Could not relay backend error to client: {}", e);
                        }
                    }
                    FailureCause::Local(err) => {
                        send_generic_error(client, failure.failed_in.phase(), err).await;
                    }
                }
                Err(failure.into_error())
            }
            None => {
                // The backend stream was dropped with the unfinished handshake.
                let err = self.deadline_exceeded();
                let phase = session.state().phase();
                warn!("{} failed: {}", phase, err);
                send_generic_error(client, phase, &err).await;
                Err(err)
            }
        }
    }
}

/// Run `work` until `deadline`. `None` means the deadline passed first.
async fn within<F: Future>(deadline: Option<Instant>, work: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => timeout_at(deadline, work).await.ok(),
        None => Some(work.await),
    }
}

#[async_trait]
impl TcpConnector for PgConnector {
    async fn connect(
        &self,
        client: &mut NetworkStream,
        credentials: &ResolvedCredentials,
    ) -> Result<NetworkStream> {
        self.handshake(client, credentials)
            .instrument(self.resources.span.clone())
            .await
    }

    fn required_credentials(&self) -> &'static [&'static str] {
        REQUIRED_CREDENTIALS
    }

    async fn report_failure(&self, client: &mut NetworkStream, error: &BrokerError) -> Result<()> {
        // libpq waits for the answer to its startup (or SSLRequest) before it
        // reads anything else, so consume that first.
        match timeout(self.connect_timeout(), read_client_startup(client)).await {
            Ok(Ok(_)) => {
                send_generic_error(client, "retrieving credentials", error).await;
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BrokerError::Timeout("waiting for client startup".into())),
        }
    }
}

/// Send a FATAL `XX000` naming the failed phase. Errors never carry secrets,
/// so the error text goes into the detail field.
async fn send_generic_error(client: &mut NetworkStream, phase: &str, err: &BrokerError) {
    let response = ErrorResponse::fatal(SQLSTATE_INTERNAL_ERROR, &format!("credbroker: {} failed", phase))
        .with_detail(&err.to_string());
    if let Err(e) = write_error(client, &response).await {
        debug!("Could not send error to client: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_config_defaults() {
        let connector = PgConnector::new(Resources::new("db", "pg", Bytes::new())).unwrap();
        assert_eq!(connector.config().connect_timeout_secs, 10);
    }

    #[test]
    fn test_config_from_yaml() {
        let resources = Resources::new("db", "pg", Bytes::from_static(b"connect_timeout_secs: 3\n"));
        let connector = PgConnector::new(resources).unwrap();
        assert_eq!(connector.connect_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_config_invalid_yaml() {
        let resources = Resources::new("db", "pg", Bytes::from_static(b"connect_timeout_secs: soon\n"));
        let err = PgConnector::new(resources).unwrap_err();
        assert!(err.to_string().contains("service 'db'"));
    }

    #[tokio::test]
    async fn test_within_deadline() {
        let passed = Instant::now() + Duration::from_millis(20);
        assert!(within(Some(passed), std::future::pending::<()>()).await.is_none());
        assert_eq!(within(None, async { 7 }).await, Some(7));
        let later = Instant::now() + Duration::from_secs(5);
        assert_eq!(within(Some(later), async { 7 }).await, Some(7));
    }

    #[test]
    fn test_deadline_error_names_limit() {
        let resources = Resources::new("db", "pg", Bytes::new())
            .with_handshake_timeout(Some(Duration::from_secs(2)));
        let connector = PgConnector::new(resources).unwrap();
        let err = connector.deadline_exceeded();
        assert!(matches!(err, BrokerError::Timeout(_)));
        assert!(err.to_string().contains("2s"));
    }

    #[test]
    fn test_plugin_info() {
        let info = PgConnector::plugin_info();
        assert_eq!(info.id, "pg");
        assert_eq!(info.kind, "connector.tcp");
    }
}
