//! Client-side TLS towards backends
//!
//! The broker never terminates client TLS; it only upgrades the backend
//! connection when a service's credentials ask for it. Trust anchors are
//! the bundled webpki roots plus an optional CA bundle supplied as PEM text.

mod connector;
mod error;

pub use connector::TlsConnector;
pub use error::TlsError;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use zeroize::Zeroizing;

/// How much of the backend certificate is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVerifyMode {
    /// Encrypt only; the certificate is not validated
    None,
    /// Chain must lead to a trusted root; the host name is not checked
    VerifyCa,
    /// Chain and host name are both checked
    VerifyFull,
}

/// Inputs for building a [`TlsConnector`]
#[derive(Clone)]
pub struct TlsClientOptions {
    /// Verification level
    pub verify_mode: TlsVerifyMode,
    /// Extra trust anchors (PEM)
    pub root_certs_pem: Option<Zeroizing<Vec<u8>>>,
    /// Client certificate chain (PEM)
    pub client_cert_pem: Option<Zeroizing<Vec<u8>>>,
    /// Client private key (PEM)
    pub client_key_pem: Option<Zeroizing<Vec<u8>>>,
}

impl TlsClientOptions {
    /// Options with no extra material.
    pub fn new(verify_mode: TlsVerifyMode) -> Self {
        Self {
            verify_mode,
            root_certs_pem: None,
            client_cert_pem: None,
            client_key_pem: None,
        }
    }

    /// Validate the combination of options.
    pub fn validate(&self) -> Result<(), String> {
        if self.client_cert_pem.is_some() != self.client_key_pem.is_some() {
            return Err("sslcert and sslkey must be provided together".into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for TlsClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClientOptions")
            .field("verify_mode", &self.verify_mode)
            .field("root_certs", &self.root_certs_pem.is_some())
            .field("client_cert", &self.client_cert_pem.is_some())
            .field("client_key", &self.client_key_pem.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Parse every certificate in a PEM bundle.
pub(crate) fn parse_certificates(
    source_name: &str,
    pem: &[u8],
) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = pem;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::cert_load(source_name, e.to_string()))?;
    if certs.is_empty() {
        return Err(TlsError::cert_load(source_name, "no certificates found"));
    }
    Ok(certs)
}

/// Parse the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM document.
pub(crate) fn parse_private_key(
    source_name: &str,
    pem: &[u8],
) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = pem;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::key_load(source_name, e.to_string()))?
        .ok_or_else(|| TlsError::key_load(source_name, "no private key found"))
}
