//! Credential resolution.
//!
//! This module turns the declarative credential references found in a
//! service's configuration into live secret bytes, once per client
//! connection.
//!
//! # Overview
//!
//! - [`Credential`] - A named reference `{name, from, get}` from configuration
//! - [`Provider`] - Trait for a secret store queried by key, in batches
//! - [`Resolver`] - Groups credentials by provider and calls each provider once
//! - [`ResolvedCredentials`] - The per-connection name → [`SecretBytes`] map
//! - [`CredentialSource`] - The per-service credential-retrieval function
//!
//! # Security
//!
//! [`SecretBytes`] zeroizes its buffer on drop and can be wiped in place.
//! [`ResolvedCredentials`] is never cached across connections, so a secret
//! rotated in its store takes effect on the next connection. `Debug` output
//! of every secret-carrying type is redacted.

mod credential;
mod provider;
pub mod providers;
mod resolver;
mod secret;
mod source;

pub use credential::{Credential, LITERAL_PROVIDER};
pub use provider::{Provider, ProviderError, ProviderResult};
pub use resolver::{
    CredentialError, FatalConfigurationError, PartialResolutionError, ProviderFactory,
    ResolutionObserver, ResolveError, Resolver,
};
pub use secret::{ResolvedCredentials, SecretBytes, WipeGuard};
pub use source::{CredentialSource, ServiceCredentials};
