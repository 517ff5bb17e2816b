//! Connector registry
//!
//! Connectors are compiled in and registered by id at startup. Registration
//! is checked the way a plugin loader would check a loaded unit: duplicate
//! ids, foreign API versions and a type string that disagrees with the
//! constructor are all rejected, and only the offending connector is lost.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::{
    BasicAuthConnector, ConnectorKind, HttpConnector, PluginInfo, Resources, TcpConnector,
    PLUGIN_API_VERSION,
};
use crate::connectors::pg::PgConnector;
use crate::error::{BrokerError, Result};

/// Builds a TCP connector for one service.
pub type TcpConnectorFactory = Arc<dyn Fn(Resources) -> Result<Arc<dyn TcpConnector>> + Send + Sync>;

/// Builds an HTTP connector for one service.
pub type HttpConnectorFactory =
    Arc<dyn Fn(Resources) -> Result<Arc<dyn HttpConnector>> + Send + Sync>;

/// A registered constructor.
#[derive(Clone)]
pub enum ConnectorConstructor {
    /// TCP connector constructor
    Tcp(TcpConnectorFactory),
    /// HTTP connector constructor
    Http(HttpConnectorFactory),
}

impl ConnectorConstructor {
    /// Kind of connector this constructor builds.
    pub fn kind(&self) -> ConnectorKind {
        match self {
            ConnectorConstructor::Tcp(_) => ConnectorKind::Tcp,
            ConnectorConstructor::Http(_) => ConnectorKind::Http,
        }
    }
}

/// A connector built for a service.
#[derive(Clone)]
pub enum Connector {
    /// TCP connector
    Tcp(Arc<dyn TcpConnector>),
    /// HTTP connector
    Http(Arc<dyn HttpConnector>),
}

impl Connector {
    /// Kind of the built connector.
    pub fn kind(&self) -> ConnectorKind {
        match self {
            Connector::Tcp(_) => ConnectorKind::Tcp,
            Connector::Http(_) => ConnectorKind::Http,
        }
    }

    /// Credential names the connector cannot work without.
    pub fn required_credentials(&self) -> &'static [&'static str] {
        match self {
            Connector::Tcp(connector) => connector.required_credentials(),
            Connector::Http(connector) => connector.required_credentials(),
        }
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Connector").field(&self.kind()).finish()
    }
}

struct Registration {
    info: PluginInfo,
    constructor: ConnectorConstructor,
}

/// Connectors available to services, keyed by id.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<String, Registration>,
}

impl ConnectorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `pg` and `basic_auth` connectors.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let builtins = [
            (
                PgConnector::plugin_info(),
                ConnectorConstructor::Tcp(Arc::new(
                    |resources: Resources| -> Result<Arc<dyn TcpConnector>> {
                        Ok(Arc::new(PgConnector::new(resources)?))
                    },
                )),
            ),
            (
                BasicAuthConnector::plugin_info(),
                ConnectorConstructor::Http(Arc::new(
                    |resources: Resources| -> Result<Arc<dyn HttpConnector>> {
                        Ok(Arc::new(BasicAuthConnector::new(resources)))
                    },
                )),
            ),
        ];
        for (info, constructor) in builtins {
            if let Err(e) = registry.register(info, constructor) {
                error!("Failed to register built-in connector: {}", e);
            }
        }
        registry
    }

    /// Register a connector.
    pub fn register(&mut self, info: PluginInfo, constructor: ConnectorConstructor) -> Result<()> {
        if info.api_version != PLUGIN_API_VERSION {
            return Err(BrokerError::Registry(format!(
                "connector '{}' targets API version {} but the broker implements {}",
                info.id, info.api_version, PLUGIN_API_VERSION
            )));
        }

        let kind: ConnectorKind = info
            .kind
            .parse()
            .map_err(|e| BrokerError::Registry(format!("connector '{}': {}", info.id, e)))?;
        if kind != constructor.kind() {
            return Err(BrokerError::Registry(format!(
                "connector '{}' declares type {} but provides a {} constructor",
                info.id,
                kind,
                constructor.kind()
            )));
        }

        if self.connectors.contains_key(&info.id) {
            return Err(BrokerError::Registry(format!(
                "connector id '{}' is already registered",
                info.id
            )));
        }

        debug!("Registered connector {} ({})", info.id, info.kind);
        self.connectors
            .insert(info.id.clone(), Registration { info, constructor });
        Ok(())
    }

    /// Register a TCP connector.
    pub fn register_tcp<F>(&mut self, info: PluginInfo, factory: F) -> Result<()>
    where
        F: Fn(Resources) -> Result<Arc<dyn TcpConnector>> + Send + Sync + 'static,
    {
        self.register(info, ConnectorConstructor::Tcp(Arc::new(factory)))
    }

    /// Register an HTTP connector.
    pub fn register_http<F>(&mut self, info: PluginInfo, factory: F) -> Result<()>
    where
        F: Fn(Resources) -> Result<Arc<dyn HttpConnector>> + Send + Sync + 'static,
    {
        self.register(info, ConnectorConstructor::Http(Arc::new(factory)))
    }

    /// Info for a registered connector.
    pub fn info(&self, id: &str) -> Option<&PluginInfo> {
        self.connectors.get(id).map(|r| &r.info)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        self.connectors.keys().map(|k| k.as_str()).collect()
    }

    /// Construct the connector `id` for a service.
    pub fn build(&self, id: &str, resources: Resources) -> Result<Connector> {
        let registration = self.connectors.get(id).ok_or_else(|| {
            BrokerError::Config(format!("no connector registered with id '{}'", id))
        })?;

        match &registration.constructor {
            ConnectorConstructor::Tcp(factory) => factory(resources).map(Connector::Tcp),
            ConnectorConstructor::Http(factory) => factory(resources).map(Connector::Http),
        }
    }
}

impl fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("connectors", &self.ids())
            .finish()
    }
}
