//! Connector abstraction
//!
//! A connector turns resolved credentials into an authenticated backend
//! session. TCP connectors run once per accepted client connection and hand
//! back the authenticated backend stream; HTTP connectors run once per
//! proxied request and decorate it in place.
//!
//! Connectors are built once per service from [`Resources`] and then shared
//! by every connection the service accepts, so they must be `Send + Sync`.

mod basic_auth;
mod registry;

pub use basic_auth::BasicAuthConnector;
pub use registry::{
    Connector, ConnectorConstructor, ConnectorRegistry, HttpConnectorFactory, TcpConnectorFactory,
};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::credentials::ResolvedCredentials;
use crate::error::{BrokerError, Result};
use crate::server::NetworkStream;

/// Connector API version this broker implements.
pub const PLUGIN_API_VERSION: &str = "0.1.0";

/// What a connector plugs into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorKind {
    /// Per-connection TCP handshake
    Tcp,
    /// Per-request HTTP decoration
    Http,
}

impl ConnectorKind {
    /// Plugin type string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorKind::Tcp => "connector.tcp",
            ConnectorKind::Http => "connector.http",
        }
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "connector.tcp" => Ok(ConnectorKind::Tcp),
            "connector.http" => Ok(ConnectorKind::Http),
            other => Err(format!("unknown connector type '{}'", other)),
        }
    }
}

/// Self-description a connector registers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    /// API version the connector was written against
    pub api_version: String,
    /// `connector.tcp` or `connector.http`
    pub kind: String,
    /// Id services refer to in their `connector` field
    pub id: String,
    /// One-line description
    pub description: String,
}

impl PluginInfo {
    /// Info for a connector built against this broker's API version.
    pub fn new(kind: ConnectorKind, id: &str, description: &str) -> Self {
        Self {
            api_version: PLUGIN_API_VERSION.to_string(),
            kind: kind.as_str().to_string(),
            id: id.to_string(),
            description: description.to_string(),
        }
    }
}

/// Everything a connector receives at construction.
#[derive(Debug, Clone)]
pub struct Resources {
    /// Owning service name
    pub service_name: String,
    /// Opaque connector configuration (YAML text, possibly empty)
    pub config: Bytes,
    /// Span connector logs should be recorded under
    pub span: tracing::Span,
    /// Deadline for one backend handshake, measured from the start of `connect`
    pub handshake_timeout: Option<Duration>,
}

impl Resources {
    /// Resources for `service_name` with a span naming the service and connector.
    pub fn new(service_name: &str, connector_id: &str, config: Bytes) -> Self {
        Self {
            service_name: service_name.to_string(),
            config,
            span: tracing::info_span!(target: "credbroker", "connector", service = %service_name, connector = %connector_id),
            handshake_timeout: None,
        }
    }

    /// Bound every handshake by `limit`.
    pub fn with_handshake_timeout(mut self, limit: Option<Duration>) -> Self {
        self.handshake_timeout = limit;
        self
    }
}

/// Per-connection TCP connector.
#[async_trait]
pub trait TcpConnector: Send + Sync {
    /// Authenticate to the backend on the client's behalf.
    ///
    /// May read from and write to `client` (for example to consume its
    /// startup packet). On error the connector has already told the client
    /// what went wrong where its protocol allows it. `credentials` must not
    /// be retained past the call.
    async fn connect(
        &self,
        client: &mut NetworkStream,
        credentials: &ResolvedCredentials,
    ) -> Result<NetworkStream>;

    /// Credential names every service using this connector must configure.
    ///
    /// A service missing any of them is refused at startup.
    fn required_credentials(&self) -> &'static [&'static str] {
        &[]
    }

    /// Tell the client about a failure that happened before `connect` ran,
    /// such as a credential resolution error.
    async fn report_failure(&self, _client: &mut NetworkStream, _error: &BrokerError) -> Result<()> {
        Ok(())
    }
}

/// Per-request HTTP connector.
#[async_trait]
pub trait HttpConnector: Send + Sync {
    /// Add authentication to `request` in place.
    async fn connect(
        &self,
        request: &mut http::Request<Bytes>,
        credentials: &ResolvedCredentials,
    ) -> Result<()>;

    /// Credential names every service using this connector must configure.
    fn required_credentials(&self) -> &'static [&'static str] {
        &[]
    }
}
