//! PostgreSQL message structures

use std::fmt;

use zeroize::{Zeroize, Zeroizing};

use super::constants::*;

/// Startup packet sent by the client to open a session.
///
/// Parameters keep the order the client sent them in.
#[derive(Clone, PartialEq, Eq)]
pub struct StartupMessage {
    /// Protocol version (196608 for v3.0)
    pub protocol_version: u32,
    /// Connection parameters (user, database, options, ...)
    pub parameters: Vec<(String, String)>,
}

impl StartupMessage {
    /// Create a v3.0 startup message for `user`.
    pub fn new(user: &str) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION_3_0,
            parameters: vec![("user".to_string(), user.to_string())],
        }
    }

    /// Look up a parameter.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set a parameter, replacing an existing value in place.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.parameters.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => {
                entry.1.zeroize();
                entry.1 = value.to_string();
            }
            None => self.parameters.push((key.to_string(), value.to_string())),
        }
    }

    /// Remove a parameter, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Zeroizing<String>> {
        let index = self.parameters.iter().position(|(k, _)| k == key)?;
        let (mut name, value) = self.parameters.remove(index);
        name.zeroize();
        Some(Zeroizing::new(value))
    }

    /// The `user` parameter.
    pub fn user(&self) -> Option<&str> {
        self.get("user")
    }

    /// The `database` parameter.
    pub fn database(&self) -> Option<&str> {
        self.get("database")
    }
}

// Parameters hold the backend user and `options` taken from credentials.
impl Zeroize for StartupMessage {
    fn zeroize(&mut self) {
        for (key, value) in self.parameters.iter_mut() {
            key.zeroize();
            value.zeroize();
        }
        self.parameters.clear();
    }
}

impl Drop for StartupMessage {
    fn drop(&mut self) {
        self.zeroize();
    }
}

// The `options` parameter may carry secrets supplied through credentials.
impl fmt::Debug for StartupMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.parameters.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("StartupMessage")
            .field("protocol_version", &self.protocol_version)
            .field("user", &self.user())
            .field("database", &self.database())
            .field("parameters", &keys)
            .finish()
    }
}

/// The first packet a client sends, which has no type byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientHello {
    /// Regular startup packet
    Startup(StartupMessage),
    /// TLS upgrade probe
    SslRequest,
    /// GSSAPI encryption probe
    GssEncRequest,
    /// Query cancellation for another session
    CancelRequest {
        /// Backend process id
        process_id: u32,
        /// Cancellation key
        secret_key: u32,
    },
}

/// Authentication request from the backend (`R` message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    /// Authentication completed
    Ok,
    /// Password in clear text
    CleartextPassword,
    /// `md5` hashed password with the given salt
    Md5Password {
        /// Four-byte salt
        salt: [u8; 4],
    },
    /// SASL exchange with the listed mechanisms
    Sasl {
        /// Offered mechanism names
        mechanisms: Vec<String>,
    },
    /// SASL server challenge
    SaslContinue(Vec<u8>),
    /// SASL outcome data
    SaslFinal(Vec<u8>),
    /// A method the broker does not implement (Kerberos, GSS, SSPI, ...)
    Unsupported(u32),
}

impl AuthRequest {
    /// Request code on the wire.
    pub fn code(&self) -> u32 {
        match self {
            AuthRequest::Ok => AUTH_OK,
            AuthRequest::CleartextPassword => AUTH_CLEARTEXT_PASSWORD,
            AuthRequest::Md5Password { .. } => AUTH_MD5_PASSWORD,
            AuthRequest::Sasl { .. } => AUTH_SASL,
            AuthRequest::SaslContinue(_) => AUTH_SASL_CONTINUE,
            AuthRequest::SaslFinal(_) => AUTH_SASL_FINAL,
            AuthRequest::Unsupported(code) => *code,
        }
    }
}

/// ErrorResponse (`E`) or NoticeResponse (`N`) body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Fields in wire order
    pub fields: Vec<(u8, String)>,
}

impl ErrorResponse {
    /// Build an error with severity, SQLSTATE and message.
    pub fn new(severity: &str, code: &str, message: &str) -> Self {
        Self {
            fields: vec![
                (FIELD_SEVERITY, severity.to_string()),
                (FIELD_SEVERITY_V, severity.to_string()),
                (FIELD_CODE, code.to_string()),
                (FIELD_MESSAGE, message.to_string()),
            ],
        }
    }

    /// Build a FATAL error; the backend closes the session after a FATAL.
    pub fn fatal(code: &str, message: &str) -> Self {
        Self::new("FATAL", code, message)
    }

    /// Append a detail field.
    pub fn with_detail(mut self, detail: &str) -> Self {
        self.fields.push((FIELD_DETAIL, detail.to_string()));
        self
    }

    /// Look up a field by its code.
    pub fn field(&self, code: u8) -> Option<&str> {
        self.fields
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.as_str())
    }

    /// Severity, preferring the non-localized field.
    pub fn severity(&self) -> Option<&str> {
        self.field(FIELD_SEVERITY_V)
            .or_else(|| self.field(FIELD_SEVERITY))
    }

    /// SQLSTATE code.
    pub fn code(&self) -> Option<&str> {
        self.field(FIELD_CODE)
    }

    /// Primary message.
    pub fn message(&self) -> Option<&str> {
        self.field(FIELD_MESSAGE)
    }

    /// Encode the message body (without tag and length).
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        for (code, value) in &self.fields {
            payload.push(*code);
            payload.extend_from_slice(value.as_bytes());
            payload.push(0);
        }
        payload.push(0);
        payload
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {}",
            self.severity().unwrap_or("ERROR"),
            self.code().unwrap_or("?????"),
            self.message().unwrap_or("unknown error")
        )
    }
}
