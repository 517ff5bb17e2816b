//! Provider trait definition.
//!
//! A [`Provider`] is a secret store (environment, files, a vault, ...)
//! queried by key. Providers are asked for all keys a connection needs from
//! them in a single batched call.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use super::SecretBytes;

/// Per-key outcome of a provider lookup.
pub type ProviderResult = Result<SecretBytes, ProviderError>;

/// Errors a provider reports for an individual key.
///
/// Messages may name the lookup key (an environment variable, a path) but
/// never the value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The key does not exist in the store
    #[error("{0} not found")]
    NotFound(String),

    /// The key exists but could not be read
    #[error("{0}")]
    Unavailable(String),

    /// The key is not valid for this provider
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Trait for pluggable secret providers.
///
/// # Thread Safety
///
/// Provider instances are cached by the resolver and shared by every
/// connection of every service, so implementations must be `Send + Sync`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider id, as used in the `from` field of a credential.
    fn name(&self) -> &str;

    /// Look up a batch of keys.
    ///
    /// Must return exactly one entry per distinct requested id.
    async fn get_values(&self, ids: &[String]) -> HashMap<String, ProviderResult>;
}
