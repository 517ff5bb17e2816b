//! Backend handshake state machine
//!
//! ```text
//! Unconnected -> BackendDialed -> [TlsNegotiating -> TlsEstablished]
//!             -> StartupSent -> AuthChallengeReceived <-> AuthResponseSent
//!             -> Authenticated | Failed
//! ```
//!
//! Steps run strictly in order and never retry. TLS, once requested, is
//! never given up, and authentication never falls back to a weaker method.

use std::fmt;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{BrokerError, Result};
use crate::protocol::postgres::*;
use crate::server::NetworkStream;
use crate::tls::TlsConnector;

use super::details::BackendConnectionDetails;

/// Position in the backend handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing done yet
    Unconnected,
    /// TCP connection open
    BackendDialed,
    /// SSLRequest sent, TLS handshake in progress
    TlsNegotiating,
    /// TLS session established
    TlsEstablished,
    /// Startup packet sent
    StartupSent,
    /// Authentication request read from the backend
    AuthChallengeReceived,
    /// Response to the last challenge sent
    AuthResponseSent,
    /// Backend sent AuthenticationOk
    Authenticated,
    /// Terminal failure
    Failed,
}

impl HandshakeState {
    /// Phase name used in client-facing error messages.
    pub fn phase(&self) -> &'static str {
        match self {
            HandshakeState::Unconnected => "connecting to backend",
            HandshakeState::BackendDialed | HandshakeState::TlsNegotiating => {
                "negotiating TLS with backend"
            }
            HandshakeState::TlsEstablished => "sending startup to backend",
            HandshakeState::StartupSent
            | HandshakeState::AuthChallengeReceived
            | HandshakeState::AuthResponseSent => "authenticating to backend",
            HandshakeState::Authenticated => "completing backend handshake",
            HandshakeState::Failed => "backend handshake",
        }
    }
}

/// Why a handshake failed.
#[derive(Debug)]
pub enum FailureCause {
    /// The backend sent an ErrorResponse; it is relayed to the client as is
    Backend(ErrorResponse),
    /// The broker gave up
    Local(BrokerError),
}

impl From<BrokerError> for FailureCause {
    fn from(err: BrokerError) -> Self {
        FailureCause::Local(err)
    }
}

/// A failed handshake and the state it failed in.
#[derive(Debug)]
pub struct HandshakeFailure {
    /// Last state reached before failing
    pub failed_in: HandshakeState,
    /// What went wrong
    pub cause: FailureCause,
}

impl HandshakeFailure {
    /// Convert into the crate error type.
    pub fn into_error(self) -> BrokerError {
        match self.cause {
            FailureCause::Backend(response) => {
                BrokerError::Auth(format!("backend rejected the connection: {}", response))
            }
            FailureCause::Local(err) => err,
        }
    }
}

impl fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            FailureCause::Backend(response) => write!(f, "{} failed: {}", self.failed_in.phase(), response),
            FailureCause::Local(err) => write!(f, "{} failed: {}", self.failed_in.phase(), err),
        }
    }
}

/// One backend handshake, performed with one set of connection details.
pub struct HandshakeSession<'a> {
    details: &'a BackendConnectionDetails,
    connect_timeout: Duration,
    state: HandshakeState,
}

impl<'a> HandshakeSession<'a> {
    /// Prepare a handshake.
    pub fn new(details: &'a BackendConnectionDetails, connect_timeout: Duration) -> Self {
        Self {
            details,
            connect_timeout,
            state: HandshakeState::Unconnected,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Drive the handshake to completion, returning the authenticated
    /// backend stream. Nothing has been written to the client either way.
    pub async fn run(
        &mut self,
        startup: &StartupMessage,
    ) -> std::result::Result<NetworkStream, HandshakeFailure> {
        match self.drive(startup).await {
            Ok(stream) => Ok(stream),
            Err(cause) => {
                let failed_in = self.state;
                self.transition(HandshakeState::Failed);
                Err(HandshakeFailure { failed_in, cause })
            }
        }
    }

    async fn drive(
        &mut self,
        startup: &StartupMessage,
    ) -> std::result::Result<NetworkStream, FailureCause> {
        let tcp = self.dial().await?;
        let mut backend = self.negotiate_tls(tcp).await?;

        write_startup(&mut backend, startup).await?;
        self.transition(HandshakeState::StartupSent);

        self.authenticate(&mut backend).await?;
        Ok(backend)
    }

    fn transition(&mut self, next: HandshakeState) {
        trace!("pg handshake {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    async fn dial(&mut self) -> Result<TcpStream> {
        let addr = self.details.address();
        debug!("Connecting to PostgreSQL backend at {}", addr);

        let stream = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| BrokerError::Timeout(format!("connecting to {}", addr)))?
            .map_err(|e| BrokerError::Connection(format!("failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        self.transition(HandshakeState::BackendDialed);
        Ok(stream)
    }

    async fn negotiate_tls(&mut self, mut tcp: TcpStream) -> Result<NetworkStream> {
        let options = match self.details.tls_options() {
            Some(options) => options,
            None => return Ok(NetworkStream::Tcp(tcp)),
        };

        self.transition(HandshakeState::TlsNegotiating);
        let answer = probe_ssl(&mut tcp).await?;
        if answer != SSL_ALLOWED {
            warn!(
                "Backend {} refused TLS (answered 0x{:02X})",
                self.details.address(),
                answer
            );
            return Err(BrokerError::Connection("backend does not allow TLS".into()));
        }

        let connector = TlsConnector::new(&options)?;
        let tls = connector.connect(tcp, &self.details.host).await?;
        self.transition(HandshakeState::TlsEstablished);

        let stream = NetworkStream::ClientTls(Box::new(tls));
        if let Some(version) = stream.tls_version() {
            debug!("TLS established with backend: {}", version);
        }
        Ok(stream)
    }

    async fn authenticate(
        &mut self,
        backend: &mut NetworkStream,
    ) -> std::result::Result<(), FailureCause> {
        let details = self.details;
        let username = details.username.as_str();
        let password = details.password.expose();
        let mut scram: Option<ScramSha256> = None;

        loop {
            let (tag, body) = read_message(backend).await?;
            match tag {
                MSG_AUTH_REQUEST => {}
                MSG_ERROR_RESPONSE => {
                    let response = parse_error_response(&body)?;
                    warn!("Backend rejected authentication: {}", response);
                    return Err(FailureCause::Backend(response));
                }
                MSG_NOTICE_RESPONSE => {
                    debug!("Ignoring notice during authentication");
                    continue;
                }
                other => {
                    return Err(BrokerError::Protocol(format!(
                        "unexpected message '{}' during authentication",
                        other as char
                    ))
                    .into());
                }
            }

            self.transition(HandshakeState::AuthChallengeReceived);
            let request = parse_auth_request(&body)?;
            debug!("Backend requested {}", auth_method_name(request.code()));

            match request {
                AuthRequest::Ok => {
                    if scram.as_ref().is_some_and(|s| !s.is_verified()) {
                        return Err(BrokerError::Auth(
                            "backend completed SCRAM without proving its identity".into(),
                        )
                        .into());
                    }
                    self.transition(HandshakeState::Authenticated);
                    return Ok(());
                }
                AuthRequest::CleartextPassword => {
                    write_message(backend, MSG_PASSWORD, &password_body(password)).await?;
                }
                AuthRequest::Md5Password { salt } => {
                    let hashed = compute_md5_password(username, password, &salt);
                    write_message(backend, MSG_PASSWORD, &password_body(hashed.as_bytes())).await?;
                }
                AuthRequest::Sasl { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == SASL_SCRAM_SHA_256) {
                        return Err(BrokerError::UnsupportedAuthMethod(format!(
                            "SASL mechanisms [{}]",
                            mechanisms.join(", ")
                        ))
                        .into());
                    }
                    let mut client = ScramSha256::new(username, password);
                    let first = client.client_first();
                    write_message(
                        backend,
                        MSG_PASSWORD,
                        &sasl_initial_response_body(SASL_SCRAM_SHA_256, &first),
                    )
                    .await?;
                    scram = Some(client);
                }
                AuthRequest::SaslContinue(data) => {
                    let client = scram.as_mut().ok_or_else(|| {
                        BrokerError::Protocol("SASL continue without SASL start".into())
                    })?;
                    let reply = client.client_final(&data)?;
                    write_message(backend, MSG_PASSWORD, &reply).await?;
                }
                AuthRequest::SaslFinal(data) => {
                    let client = scram.as_mut().ok_or_else(|| {
                        BrokerError::Protocol("SASL final without SASL start".into())
                    })?;
                    client.verify_server_final(&data)?;
                    // No reply; AuthenticationOk follows.
                    continue;
                }
                AuthRequest::Unsupported(code) => {
                    return Err(
                        BrokerError::UnsupportedAuthMethod(auth_method_name(code).to_string())
                            .into(),
                    );
                }
            }
            self.transition(HandshakeState::AuthResponseSent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_name_the_step() {
        assert_eq!(HandshakeState::Unconnected.phase(), "connecting to backend");
        assert_eq!(HandshakeState::TlsNegotiating.phase(), "negotiating TLS with backend");
        assert_eq!(HandshakeState::AuthResponseSent.phase(), "authenticating to backend");
    }

    #[test]
    fn test_backend_failure_becomes_auth_error() {
        let failure = HandshakeFailure {
            failed_in: HandshakeState::AuthResponseSent,
            cause: FailureCause::Backend(ErrorResponse::fatal("28P01", "password authentication failed")),
        };
        assert!(failure.to_string().starts_with("authenticating to backend failed"));
        let err = failure.into_error();
        assert!(matches!(err, BrokerError::Auth(_)));
        assert!(err.to_string().contains("28P01"));
    }
}
