//! Configuration types

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use bytes::Bytes;
use serde::Deserialize;

use crate::credentials::Credential;
use crate::error::{BrokerError, Result};

/// The only configuration format version understood.
pub const CONFIG_VERSION: &str = "2";

/// Root configuration structure
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Configuration format version
    #[serde(default = "default_version")]
    pub version: String,

    /// Settings shared by every service
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Services keyed by name
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

impl Config {
    /// Validate the document as a whole.
    ///
    /// Individual services are validated separately by
    /// [`ServiceConfig::to_service`] so that one broken service does not
    /// prevent the others from starting.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.version != CONFIG_VERSION {
            return Err(format!(
                "Unsupported config version '{}' (expected '{}')",
                self.version, CONFIG_VERSION
            ));
        }
        if self.services.is_empty() {
            return Err("No services configured".to_string());
        }
        Ok(())
    }

    /// Convert every service entry, keeping per-service failures separate.
    pub fn services(&self) -> Vec<(String, Result<Service>)> {
        self.services
            .iter()
            .map(|(name, service)| (name.clone(), service.to_service(name)))
            .collect()
    }
}

/// Broker-wide settings
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Deadline for credential resolution and, separately, for the backend handshake, in seconds (0 = none)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Maximum concurrent connections per service (0 = unlimited)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout(),
            max_connections: default_max_connections(),
        }
    }
}

/// One service entry as written in the configuration file
#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    /// Connector id, e.g. "pg" or "basic_auth"
    pub connector: String,
    /// Listen address: `tcp://host:port` or `unix:///abs/path`
    #[serde(rename = "listenOn", alias = "listen_on")]
    pub listen_on: String,
    /// Credentials keyed by the name the connector expects
    #[serde(default)]
    pub credentials: BTreeMap<String, CredentialSpec>,
    /// Connector-specific configuration, passed through opaquely
    #[serde(default)]
    pub config: Option<serde_yaml::Value>,
}

impl ServiceConfig {
    /// Validate and convert into a [`Service`].
    pub fn to_service(&self, name: &str) -> Result<Service> {
        if self.connector.trim().is_empty() {
            return Err(BrokerError::Config(format!(
                "Service '{}' does not name a connector",
                name
            )));
        }

        let listen_on = self.listen_on.parse::<ListenAddress>().map_err(|e| {
            BrokerError::Config(format!("Service '{}': {}", name, e))
        })?;

        if self.credentials.is_empty() {
            return Err(BrokerError::Config(format!(
                "Service '{}' declares no credentials",
                name
            )));
        }

        let credentials = self
            .credentials
            .iter()
            .map(|(cred_name, spec)| spec.to_credential(cred_name))
            .collect();

        let connector_config = match &self.config {
            None | Some(serde_yaml::Value::Null) => Bytes::new(),
            Some(value) => Bytes::from(serde_yaml::to_string(value)?),
        };

        Ok(Service {
            name: name.to_string(),
            connector: self.connector.clone(),
            listen_on,
            credentials,
            connector_config,
        })
    }
}

/// A credential as written in configuration: a literal scalar or a provider reference.
#[derive(Clone, Deserialize)]
#[serde(untagged)]
pub enum CredentialSpec {
    /// `{ from: <provider>, get: <key> }`
    Reference {
        /// Provider id
        from: String,
        /// Provider-specific key
        get: String,
    },
    /// Literal string
    Text(String),
    /// Literal number, e.g. a port
    Number(serde_yaml::Number),
    /// Literal boolean
    Bool(bool),
}

impl CredentialSpec {
    /// Convert into a [`Credential`] named `name`.
    pub fn to_credential(&self, name: &str) -> Credential {
        match self {
            CredentialSpec::Reference { from, get } => Credential::new(name, from, get),
            CredentialSpec::Text(value) => Credential::literal(name, value),
            CredentialSpec::Number(value) => Credential::literal(name, value.to_string()),
            CredentialSpec::Bool(value) => Credential::literal(name, value.to_string()),
        }
    }
}

// Literal values may be secrets.
impl fmt::Debug for CredentialSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSpec::Reference { from, get } => f
                .debug_struct("Reference")
                .field("from", from)
                .field("get", get)
                .finish(),
            _ => f.write_str("Literal([REDACTED])"),
        }
    }
}

/// A validated service definition
#[derive(Debug, Clone)]
pub struct Service {
    /// Service name
    pub name: String,
    /// Connector id
    pub connector: String,
    /// Where the service listens
    pub listen_on: ListenAddress,
    /// Credential references resolved per connection
    pub credentials: Vec<Credential>,
    /// Opaque connector configuration (YAML text, empty if absent)
    pub connector_config: Bytes,
}

/// Network address a service listens on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    /// TCP `host:port`
    Tcp(String),
    /// Unix domain socket path (absolute)
    Unix(PathBuf),
}

impl FromStr for ListenAddress {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Some(addr) = s.strip_prefix("tcp://") {
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| format!("Listen address '{}' is missing a port", s))?;
            if host.is_empty() {
                return Err(format!("Listen address '{}' is missing a host", s));
            }
            port.parse::<u16>()
                .map_err(|_| format!("Listen address '{}' has an invalid port", s))?;
            return Ok(ListenAddress::Tcp(addr.to_string()));
        }

        if let Some(path) = s.strip_prefix("unix://") {
            let path = PathBuf::from(path);
            if !path.is_absolute() {
                return Err(format!("Unix socket path in '{}' must be absolute", s));
            }
            return Ok(ListenAddress::Unix(path));
        }

        Err(format!(
            "Invalid listen address '{}': expected tcp://host:port or unix:///path",
            s
        ))
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddress::Tcp(addr) => write!(f, "tcp://{}", addr),
            ListenAddress::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

fn default_version() -> String {
    CONFIG_VERSION.to_string()
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}
