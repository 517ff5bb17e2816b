//! Per-service credential retrieval.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Credential, ResolveError, ResolvedCredentials, Resolver};

/// Produces a fresh credential set for each client connection.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Resolve this service's credentials.
    async fn retrieve(&self) -> Result<ResolvedCredentials, ResolveError>;
}

/// A service's declared credentials bound to a shared resolver.
#[derive(Debug)]
pub struct ServiceCredentials {
    resolver: Arc<Resolver>,
    credentials: Vec<Credential>,
}

impl ServiceCredentials {
    /// Bind `credentials` to `resolver`.
    pub fn new(resolver: Arc<Resolver>, credentials: Vec<Credential>) -> Self {
        Self {
            resolver,
            credentials,
        }
    }

    /// The declared credential references.
    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }
}

#[async_trait]
impl CredentialSource for ServiceCredentials {
    async fn retrieve(&self) -> Result<ResolvedCredentials, ResolveError> {
        self.resolver.resolve(&self.credentials).await
    }
}
