//! Credential resolver.
//!
//! The [`Resolver`] turns a list of [`Credential`] references into a
//! [`ResolvedCredentials`] set. Credentials are grouped by provider so that
//! each provider is asked exactly once per resolution, for every key its
//! group needs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use super::providers::{EnvProvider, FileProvider, LiteralProvider};
use super::{Credential, Provider, ProviderError, ResolvedCredentials, SecretBytes};

/// Constructor for a provider instance.
pub type ProviderFactory =
    Arc<dyn Fn() -> Result<Arc<dyn Provider>, ProviderError> + Send + Sync>;

/// Receives a notification for every credential the resolver produces.
///
/// Implementations see secret values and must never persist or log them.
pub trait ResolutionObserver: Send + Sync {
    /// Called once per successfully resolved credential.
    fn credential_resolved(&self, name: &str, provider: &str, value: &[u8]);
}

/// Failures that make a resolution request meaningless.
///
/// These indicate a broken service configuration rather than a transient
/// provider problem; callers typically refuse to start the service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalConfigurationError {
    /// Nothing was asked for
    #[error("no credentials to resolve")]
    EmptyCredentialList,

    /// A credential names a provider the resolver does not know
    #[error("unknown credential provider '{0}'")]
    UnknownProvider(String),

    /// The provider factory failed
    #[error("failed to initialize provider '{provider}': {reason}")]
    ProviderInit {
        /// Provider id
        provider: String,
        /// Factory error
        reason: ProviderError,
    },
}

/// One credential that could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialError {
    /// Credential name
    pub name: String,
    /// Provider id
    pub provider: String,
    /// Provider-reported cause
    pub reason: ProviderError,
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "credential '{}' from provider '{}': {}",
            self.name, self.provider, self.reason
        )
    }
}

/// Some credentials resolved, some did not.
///
/// Carries the partial set so callers that can work with it may do so;
/// callers needing all-or-nothing semantics just drop the error, which
/// zeroizes the partial values.
pub struct PartialResolutionError {
    /// Per-credential failures
    pub errors: Vec<CredentialError>,
    /// Values that did resolve
    pub resolved: ResolvedCredentials,
}

impl fmt::Display for PartialResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        f.write_str(&messages.join("\n"))
    }
}

impl fmt::Debug for PartialResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialResolutionError")
            .field("errors", &self.errors)
            .field("resolved", &self.resolved)
            .finish()
    }
}

impl std::error::Error for PartialResolutionError {}

/// Result of a failed [`Resolver::resolve`].
#[derive(Error, Debug)]
pub enum ResolveError {
    /// The request cannot be served at all
    #[error(transparent)]
    Fatal(#[from] FatalConfigurationError),

    /// One or more individual credentials failed
    #[error(transparent)]
    Partial(#[from] PartialResolutionError),
}

impl ResolveError {
    /// Whether this error points at a configuration problem.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ResolveError::Fatal(_))
    }

    /// Zero and release any partially resolved values, keeping only the
    /// per-credential failures.
    pub fn without_values(self) -> Self {
        match self {
            ResolveError::Partial(PartialResolutionError {
                errors,
                mut resolved,
            }) => {
                resolved.wipe();
                drop(resolved);
                ResolveError::Partial(PartialResolutionError {
                    errors,
                    resolved: ResolvedCredentials::new(),
                })
            }
            fatal => fatal,
        }
    }
}

/// Resolves credential references through cached provider instances.
///
/// Provider instances are created lazily on first use and shared across all
/// connections; the cache is guarded by a single mutex created with the
/// resolver.
pub struct Resolver {
    factories: HashMap<String, ProviderFactory>,
    providers: Mutex<HashMap<String, Arc<dyn Provider>>>,
    observer: Option<Arc<dyn ResolutionObserver>>,
}

impl Resolver {
    /// Create a resolver with no providers registered.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            providers: Mutex::new(HashMap::new()),
            observer: None,
        }
    }

    /// Create a resolver with the built-in `literal`, `env` and `file` providers.
    pub fn with_builtin_providers() -> Self {
        Self::new()
            .with_provider("literal", || Ok(Arc::new(LiteralProvider) as Arc<dyn Provider>))
            .with_provider("env", || Ok(Arc::new(EnvProvider) as Arc<dyn Provider>))
            .with_provider("file", || Ok(Arc::new(FileProvider) as Arc<dyn Provider>))
    }

    /// Register a provider factory under `name` (builder pattern).
    ///
    /// Registering the same name twice replaces the earlier factory.
    pub fn with_provider<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Provider>, ProviderError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Attach a resolution observer (builder pattern).
    pub fn with_observer(mut self, observer: Arc<dyn ResolutionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Whether a provider with this id is registered.
    pub fn has_provider(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Get the provider instance for `name`, creating it on first use.
    pub fn provider(&self, name: &str) -> Result<Arc<dyn Provider>, FatalConfigurationError> {
        let mut providers = self.providers.lock();
        if let Some(provider) = providers.get(name) {
            return Ok(Arc::clone(provider));
        }

        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| FatalConfigurationError::UnknownProvider(name.to_string()))?;
        let provider = factory().map_err(|reason| FatalConfigurationError::ProviderInit {
            provider: name.to_string(),
            reason,
        })?;

        debug!("Initialized credential provider '{}'", name);
        providers.insert(name.to_string(), Arc::clone(&provider));
        Ok(provider)
    }

    /// Resolve `credentials` into a fresh credential set.
    ///
    /// Each distinct provider receives one `get_values` call with its
    /// de-duplicated keys. Individual key failures are collected; if any
    /// occurred the result is [`ResolveError::Partial`] carrying both the
    /// errors and whatever did resolve.
    pub async fn resolve(
        &self,
        credentials: &[Credential],
    ) -> Result<ResolvedCredentials, ResolveError> {
        if credentials.is_empty() {
            return Err(FatalConfigurationError::EmptyCredentialList.into());
        }

        // Group by provider, keeping first-seen order.
        let mut groups: Vec<(&str, Vec<&Credential>)> = Vec::new();
        for credential in credentials {
            match groups.iter_mut().find(|(from, _)| *from == credential.from) {
                Some((_, members)) => members.push(credential),
                None => groups.push((credential.from.as_str(), vec![credential])),
            }
        }

        // Every provider must be known before any of them is queried.
        let mut batches = Vec::with_capacity(groups.len());
        for (from, members) in groups {
            let provider = self.provider(from)?;
            batches.push((provider, from, members));
        }

        let mut resolved = ResolvedCredentials::new();
        let mut errors = Vec::new();

        for (provider, from, members) in batches {
            let mut ids: Vec<String> = Vec::with_capacity(members.len());
            for member in &members {
                if !ids.contains(&member.get) {
                    ids.push(member.get.clone());
                }
            }

            trace!(
                "Requesting {} value(s) from provider '{}'",
                ids.len(),
                from
            );
            let mut values = provider.get_values(&ids).await;

            for member in members {
                match values.get(&member.get) {
                    Some(Ok(value)) => {
                        if let Some(observer) = &self.observer {
                            observer.credential_resolved(&member.name, from, value.expose());
                        }
                        resolved.insert(member.name.clone(), SecretBytes::copy_from(value.expose()));
                    }
                    Some(Err(reason)) => errors.push(CredentialError {
                        name: member.name.clone(),
                        provider: from.to_string(),
                        reason: reason.clone(),
                    }),
                    None => errors.push(CredentialError {
                        name: member.name.clone(),
                        provider: from.to_string(),
                        reason: ProviderError::Unavailable(
                            "provider returned no value for the requested key".into(),
                        ),
                    }),
                }
            }

            // Provider-owned copies are zeroized here.
            values.clear();
        }

        if errors.is_empty() {
            Ok(resolved)
        } else {
            Err(PartialResolutionError { errors, resolved }.into())
        }
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::with_builtin_providers()
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Resolver")
            .field("providers", &names)
            .finish()
    }
}
