//! TLS-specific error types

use thiserror::Error;

/// TLS-specific errors
///
/// Certificate material arrives as PEM text through credentials, so load
/// errors name the credential the material came from rather than a path.
#[derive(Error, Debug)]
pub enum TlsError {
    /// Failed to parse certificates
    #[error("Failed to load certificate from {source_name}: {reason}")]
    CertificateLoad {
        /// Credential the PEM text came from
        source_name: String,
        /// Reason for the failure
        reason: String,
    },

    /// Failed to parse a private key
    #[error("Failed to load private key from {source_name}: {reason}")]
    PrivateKeyLoad {
        /// Credential the PEM text came from
        source_name: String,
        /// Reason for the failure
        reason: String,
    },

    /// TLS handshake failed
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// Certificate verification failed
    #[error("Certificate verification failed: {0}")]
    Verification(String),

    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    Config(String),

    /// I/O error during TLS operation
    #[error("TLS I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TlsError {
    /// Create a certificate load error
    pub fn cert_load(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        TlsError::CertificateLoad {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Create a private key load error
    pub fn key_load(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        TlsError::PrivateKeyLoad {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Create a handshake error
    pub fn handshake(reason: impl Into<String>) -> Self {
        TlsError::Handshake(reason.into())
    }

    /// Create a verification error
    pub fn verification(reason: impl Into<String>) -> Self {
        TlsError::Verification(reason.into())
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        TlsError::Config(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_certificate_load_error_display() {
        let err = TlsError::cert_load("sslrootcert", "no certificates found");
        assert_eq!(
            err.to_string(),
            "Failed to load certificate from sslrootcert: no certificates found"
        );
    }

    #[test]
    fn test_private_key_load_error_display() {
        let err = TlsError::key_load("sslkey", "invalid format");
        assert!(err.to_string().contains("sslkey"));
    }

    #[test]
    fn test_handshake_error_display() {
        let err = TlsError::handshake("peer closed");
        assert_eq!(err.to_string(), "TLS handshake failed: peer closed");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let tls_err: TlsError = io_err.into();
        assert!(tls_err.to_string().contains("eof"));
    }
}
