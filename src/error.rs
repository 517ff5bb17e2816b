//! Error types for credbroker

use thiserror::Error;

use crate::credentials::ResolveError;
use crate::tls::TlsError;

/// Main error type for the broker
///
/// Messages carry enough context (phase, service, host) to diagnose a
/// failure but never the secret material involved in it.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// I/O error (network, file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol parsing error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Backend rejected or could not complete authentication
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Backend asked for an authentication method the broker refuses to use
    #[error("Unsupported authentication method: {0}")]
    UnsupportedAuthMethod(String),

    /// Credential resolution failure. Never holds resolved values.
    #[error("Failed to retrieve credentials: {0}")]
    CredentialRetrieval(ResolveError),

    /// TLS/SSL error
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// Connector registration or lookup failure
    #[error("Connector registry error: {0}")]
    Registry(String),

    /// Illegal proxy service lifecycle transition
    #[error("Service state error: {0}")]
    ServiceState(String),

    /// Work abandoned because the owning service is stopping
    #[error("Shutdown in progress")]
    Shutdown,
}

/// Result type alias for BrokerError
pub type Result<T> = std::result::Result<T, BrokerError>;

// Values that did resolve are wiped before the error travels any further.
impl From<ResolveError> for BrokerError {
    fn from(err: ResolveError) -> Self {
        BrokerError::CredentialRetrieval(err.without_values())
    }
}

impl From<serde_yaml::Error> for BrokerError {
    fn from(err: serde_yaml::Error) -> Self {
        BrokerError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: BrokerError = io_err.into();
        assert!(err.to_string().starts_with("I/O error"));
    }

    #[test]
    fn test_tls_error_conversion() {
        let err: BrokerError = TlsError::handshake("peer closed").into();
        assert_eq!(err.to_string(), "TLS error: TLS handshake failed: peer closed");
    }

    #[test]
    fn test_resolve_error_conversion_discards_values() {
        use crate::credentials::{
            CredentialError, PartialResolutionError, ProviderError, ResolvedCredentials, SecretBytes,
        };

        let mut resolved = ResolvedCredentials::new();
        resolved.insert("username", SecretBytes::from("svc_orders"));
        let partial = PartialResolutionError {
            errors: vec![CredentialError {
                name: "password".into(),
                provider: "env".into(),
                reason: ProviderError::NotFound("DB_PASSWORD".into()),
            }],
            resolved,
        };

        let err: BrokerError = ResolveError::Partial(partial).into();
        match &err {
            BrokerError::CredentialRetrieval(ResolveError::Partial(partial)) => {
                assert!(partial.resolved.is_empty());
                assert_eq!(partial.errors.len(), 1);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(err.to_string().contains("'password'"));
        assert!(!err.to_string().contains("svc_orders"));
    }

    #[test]
    fn test_yaml_error_is_config_error() {
        let yaml_err = serde_yaml::from_str::<u32>("not a number").unwrap_err();
        let err: BrokerError = yaml_err.into();
        assert!(matches!(err, BrokerError::Config(_)));
    }
}
