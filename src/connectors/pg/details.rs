//! Backend connection details taken from resolved credentials

use std::fmt;
use std::str::FromStr;

use zeroize::{Zeroize, Zeroizing};

use crate::credentials::{ResolvedCredentials, SecretBytes};
use crate::error::{BrokerError, Result};
use crate::protocol::postgres::StartupMessage;
use crate::tls::{TlsClientOptions, TlsVerifyMode};

/// Default PostgreSQL port.
pub const DEFAULT_PORT: u16 = 5432;

/// Credentials a `pg` service cannot run without.
pub const REQUIRED_CREDENTIALS: &[&str] = &["host", "username", "password"];

/// Backend TLS requirement, named as libpq names it.
///
/// `allow` and `prefer` are not accepted: both may fall back to plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Plaintext
    #[default]
    Disable,
    /// TLS without certificate validation
    Require,
    /// TLS, certificate chain validated
    VerifyCa,
    /// TLS, chain and host name validated
    VerifyFull,
}

impl SslMode {
    /// Whether TLS must be negotiated.
    pub fn requires_tls(&self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    fn verify_mode(&self) -> TlsVerifyMode {
        match self {
            SslMode::Disable | SslMode::Require => TlsVerifyMode::None,
            SslMode::VerifyCa => TlsVerifyMode::VerifyCa,
            SslMode::VerifyFull => TlsVerifyMode::VerifyFull,
        }
    }
}

impl FromStr for SslMode {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "disable" => Ok(SslMode::Disable),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(BrokerError::Config(format!(
                "unsupported sslmode '{}' (expected disable, require, verify-ca or verify-full)",
                other
            ))),
        }
    }
}

/// Where and as whom to connect to the backend.
///
/// Every field is zeroed when the value is dropped.
pub struct BackendConnectionDetails {
    /// Backend host
    pub host: String,
    /// Backend port
    pub port: u16,
    /// Backend user
    pub username: String,
    /// Backend password
    pub password: SecretBytes,
    /// Database used when the client does not name one
    pub database: Option<String>,
    /// Value for the startup `options` parameter
    pub options: Option<Zeroizing<String>>,
    /// TLS requirement
    pub ssl_mode: SslMode,
    /// Extra trust anchors (PEM)
    pub ssl_root_cert: Option<Zeroizing<Vec<u8>>>,
    /// Client certificate (PEM)
    pub ssl_cert: Option<Zeroizing<Vec<u8>>>,
    /// Client key (PEM)
    pub ssl_key: Option<Zeroizing<Vec<u8>>>,
}

impl BackendConnectionDetails {
    /// Read details from credentials.
    ///
    /// `host`, `username` and `password` are required; `port` defaults to
    /// 5432 and `sslmode` to `disable`.
    pub fn from_credentials(credentials: &ResolvedCredentials) -> Result<Self> {
        let host = required_str(credentials, "host")?.to_string();
        if host.is_empty() {
            return Err(BrokerError::Config("credential 'host' is empty".into()));
        }

        let port = match optional_str(credentials, "port")? {
            Some(port) => port.trim().parse::<u16>().map_err(|_| {
                BrokerError::Config("credential 'port' is not a valid port number".into())
            })?,
            None => DEFAULT_PORT,
        };

        let username = required_str(credentials, "username")?.to_string();
        let password = credentials
            .get("password")
            .map(|p| SecretBytes::copy_from(p.expose()))
            .ok_or_else(|| missing("password"))?;

        let ssl_mode = match optional_str(credentials, "sslmode")? {
            Some(mode) => mode.parse()?,
            None => SslMode::Disable,
        };

        let ssl_cert = credentials
            .get("sslcert")
            .map(|c| Zeroizing::new(c.expose().to_vec()));
        let ssl_key = credentials
            .get("sslkey")
            .map(|k| Zeroizing::new(k.expose().to_vec()));
        if ssl_cert.is_some() != ssl_key.is_some() {
            return Err(BrokerError::Config(
                "credentials 'sslcert' and 'sslkey' must be provided together".into(),
            ));
        }

        Ok(Self {
            host,
            port,
            username,
            password,
            database: optional_str(credentials, "database")?.map(str::to_string),
            options: optional_str(credentials, "options")?.map(|o| Zeroizing::new(o.to_string())),
            ssl_mode,
            ssl_root_cert: credentials
                .get("sslrootcert")
                .map(|c| Zeroizing::new(c.expose().to_vec())),
            ssl_cert,
            ssl_key,
        })
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// TLS settings, when the mode asks for TLS.
    pub fn tls_options(&self) -> Option<TlsClientOptions> {
        if !self.ssl_mode.requires_tls() {
            return None;
        }
        Some(TlsClientOptions {
            verify_mode: self.ssl_mode.verify_mode(),
            root_certs_pem: self.ssl_root_cert.clone(),
            client_cert_pem: self.ssl_cert.clone(),
            client_key_pem: self.ssl_key.clone(),
        })
    }

    /// The startup packet to send to the backend for a client's startup.
    ///
    /// Client parameters are kept, `user` becomes the backend user and
    /// `options` from credentials replaces the client's.
    pub fn backend_startup(&self, client: &StartupMessage) -> StartupMessage {
        let mut startup = client.clone();
        startup.set("user", &self.username);
        if startup.database().is_none() {
            if let Some(database) = &self.database {
                startup.set("database", database);
            }
        }
        if let Some(options) = &self.options {
            startup.set("options", options);
        }
        startup
    }
}

impl Zeroize for BackendConnectionDetails {
    fn zeroize(&mut self) {
        self.host.zeroize();
        self.port.zeroize();
        self.username.zeroize();
        self.password.zeroize();
        self.database.zeroize();
        self.options.zeroize();
        self.ssl_root_cert.zeroize();
        self.ssl_cert.zeroize();
        self.ssl_key.zeroize();
    }
}

impl Drop for BackendConnectionDetails {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl fmt::Debug for BackendConnectionDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConnectionDetails")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password)
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .finish_non_exhaustive()
    }
}

fn missing(name: &str) -> BrokerError {
    BrokerError::Config(format!("required credential '{}' is missing", name))
}

fn required_str<'a>(credentials: &'a ResolvedCredentials, name: &str) -> Result<&'a str> {
    optional_str(credentials, name)?.ok_or_else(|| missing(name))
}

fn optional_str<'a>(credentials: &'a ResolvedCredentials, name: &str) -> Result<Option<&'a str>> {
    match credentials.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_str()
            .map(Some)
            .ok_or_else(|| BrokerError::Config(format!("credential '{}' is not UTF-8", name))),
    }
}
