//! credbroker - Credential-brokering network proxy
//!
//! This library provides the core of a proxy that:
//! - Listens on behalf of a backend service (PostgreSQL, HTTP APIs, ...)
//! - Resolves credentials fresh for every client connection from pluggable providers
//! - Authenticates to the real backend with those credentials
//! - Relays all traffic transparently once authenticated
//!
//! Client processes never observe the secrets: they are fetched, used for the
//! backend handshake and zeroized before any application data flows.

#[macro_use]
mod logging;

pub mod config;
pub mod connector;
pub mod connectors;
pub mod credentials;
pub mod error;
pub mod health;
pub mod protocol;
pub mod server;
pub mod tls;

pub use config::{Config, ListenAddress, Service};
pub use connector::{
    ConnectorKind, ConnectorRegistry, HttpConnector, PluginInfo, Resources, TcpConnector,
    PLUGIN_API_VERSION,
};
pub use credentials::{
    Credential, CredentialSource, Provider, ResolveError, ResolvedCredentials, Resolver,
    SecretBytes, ServiceCredentials,
};
pub use error::{BrokerError, Result};
pub use health::{HealthState, HealthStatus};
pub use server::{Broker, DuplexStreamer, NetworkStream, ProxyService, ServiceSpec, ServiceState};
pub use tls::{TlsConnector, TlsError};
