//! TLS connector for backend connections

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::tls::{parse_certificates, parse_private_key, TlsClientOptions, TlsError, TlsVerifyMode};

/// Establishes TLS sessions to backend servers.
///
/// ```ignore
/// let connector = TlsConnector::new(&TlsClientOptions::new(TlsVerifyMode::VerifyFull))?;
/// let tls_stream = connector.connect(tcp_stream, "db.example.com").await?;
/// ```
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    /// Build a connector from options.
    ///
    /// Fails if the PEM material cannot be parsed or the client
    /// certificate does not match its key.
    pub fn new(options: &TlsClientOptions) -> Result<Self, TlsError> {
        options.validate().map_err(TlsError::config)?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let roots = Arc::new(build_root_store(options)?);

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::config(format!("Failed to set protocol versions: {}", e)))?;

        let builder = match options.verify_mode {
            TlsVerifyMode::VerifyFull => builder.with_root_certificates(roots),
            TlsVerifyMode::VerifyCa => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(RelaxedVerifier {
                    roots: Some(roots),
                    provider,
                })),
            TlsVerifyMode::None => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(RelaxedVerifier {
                    roots: None,
                    provider,
                })),
        };

        let client_config = match (&options.client_cert_pem, &options.client_key_pem) {
            (Some(cert_pem), Some(key_pem)) => {
                let certs = parse_certificates("sslcert", cert_pem)?;
                let key = parse_private_key("sslkey", key_pem)?;
                builder.with_client_auth_cert(certs, key).map_err(|e| {
                    TlsError::config(format!("Failed to build client TLS config: {}", e))
                })?
            }
            _ => builder.with_no_client_auth(),
        };

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Run the TLS handshake over an established TCP connection.
    ///
    /// `server_name` is sent as SNI and, in full verification mode,
    /// matched against the certificate.
    pub async fn connect(
        &self,
        stream: TcpStream,
        server_name: &str,
    ) -> Result<TlsStream<TcpStream>, TlsError> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::config(format!("Invalid server name: {}", server_name)))?;

        self.inner
            .connect(server_name, stream)
            .await
            .map_err(|e| TlsError::handshake(e.to_string()))
    }
}

fn build_root_store(options: &TlsClientOptions) -> Result<RootCertStore, TlsError> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(pem) = &options.root_certs_pem {
        for cert in parse_certificates("sslrootcert", pem)? {
            root_store
                .add(cert)
                .map_err(|e| TlsError::cert_load("sslrootcert", e.to_string()))?;
        }
    }

    Ok(root_store)
}

/// Verifier for the modes that skip host name checks.
///
/// With `roots` set the chain must still lead to a trusted anchor; without
/// it any certificate is accepted. Handshake signatures are always checked.
#[derive(Debug)]
struct RelaxedVerifier {
    roots: Option<Arc<RootCertStore>>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for RelaxedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Some(roots) = &self.roots {
            let cert = ParsedCertificate::try_from(end_entity)?;
            rustls::client::verify_server_cert_signed_by_trust_anchor(
                &cert,
                roots,
                intermediates,
                now,
                self.provider.signature_verification_algorithms.all,
            )?;
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
