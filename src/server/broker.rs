//! Starts one proxy service per configured service

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::proxy_service::{ProxyService, ServiceSpec};
use crate::config::{BrokerConfig, Config, Service};
use crate::connector::{Connector, ConnectorRegistry, Resources};
use crate::credentials::{Resolver, ServiceCredentials};
use crate::error::{BrokerError, Result};

/// The set of running proxy services.
///
/// A service whose configuration, connector or listener is broken, or that
/// lacks a credential its connector requires, is logged and skipped; the
/// others still start.
#[derive(Debug, Default)]
pub struct Broker {
    services: Vec<ProxyService>,
    failures: Vec<(String, BrokerError)>,
}

impl Broker {
    /// Build, bind and start every service in `config`.
    pub async fn launch(
        config: &Config,
        registry: &ConnectorRegistry,
        resolver: Arc<Resolver>,
    ) -> Self {
        let mut broker = Broker::default();

        for (name, service) in config.services() {
            let result = match service {
                Ok(service) => {
                    launch_service(service, &config.broker, registry, Arc::clone(&resolver)).await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(proxy) => broker.services.push(proxy),
                Err(e) => {
                    error!("Service '{}' not started: {}", name, e);
                    broker.failures.push((name, e));
                }
            }
        }

        info!(
            "{} service(s) running, {} failed to start",
            broker.services.len(),
            broker.failures.len()
        );
        broker
    }

    /// Running services.
    pub fn services(&self) -> &[ProxyService] {
        &self.services
    }

    /// Look up a running service by name.
    pub fn service(&self, name: &str) -> Option<&ProxyService> {
        self.services.iter().find(|s| s.name() == name)
    }

    /// Services that failed to start, with the reason.
    pub fn failures(&self) -> &[(String, BrokerError)] {
        &self.failures
    }

    /// Stop every service and wait for their accept loops to exit.
    pub async fn stop_all(&self) {
        for service in &self.services {
            service.stop();
        }
        for service in &self.services {
            service.wait().await;
            let stats = service.stats();
            info!(
                "Service '{}': {} connection(s) accepted, {} rejected, {} failed",
                service.name(),
                stats.connections_accepted.load(Ordering::Relaxed),
                stats.connections_rejected.load(Ordering::Relaxed),
                stats.connections_failed.load(Ordering::Relaxed)
            );
        }
    }
}

async fn launch_service(
    service: Service,
    settings: &BrokerConfig,
    registry: &ConnectorRegistry,
    resolver: Arc<Resolver>,
) -> Result<ProxyService> {
    if let Some(missing) = service
        .credentials
        .iter()
        .find(|c| !resolver.has_provider(&c.from))
    {
        return Err(BrokerError::Config(format!(
            "credential '{}' uses unknown provider '{}'",
            missing.name, missing.from
        )));
    }

    let handshake_timeout = match settings.handshake_timeout_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let resources = Resources::new(&service.name, &service.connector, service.connector_config)
        .with_handshake_timeout(handshake_timeout);
    let connector = registry.build(&service.connector, resources)?;

    let missing: Vec<&str> = connector
        .required_credentials()
        .iter()
        .copied()
        .filter(|name| !service.credentials.iter().any(|c| c.name == *name))
        .collect();
    if !missing.is_empty() {
        return Err(BrokerError::Config(format!(
            "connector '{}' requires credential(s) {} which are not configured",
            service.connector,
            missing.join(", ")
        )));
    }

    let connector = match connector {
        Connector::Tcp(connector) => connector,
        Connector::Http(_) => {
            return Err(BrokerError::Config(format!(
                "connector '{}' is an HTTP connector and cannot serve a TCP listener",
                service.connector
            )))
        }
    };

    let spec = ServiceSpec {
        name: service.name.clone(),
        listen_on: service.listen_on,
        connector,
        credentials: Arc::new(ServiceCredentials::new(resolver, service.credentials)),
        handshake_timeout,
        max_connections: settings.max_connections,
        tap: None,
    };

    let proxy = ProxyService::bind(spec).await?;
    proxy.start()?;
    Ok(proxy)
}
