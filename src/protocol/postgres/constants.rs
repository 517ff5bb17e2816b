//! PostgreSQL protocol constants

/// Protocol version 3.0, encoded as `(3 << 16) | 0`.
pub const PROTOCOL_VERSION_3_0: u32 = 196608;

/// Request code sent in place of a protocol version to ask for TLS.
pub const SSL_REQUEST_CODE: u32 = 80877103;

/// Request code for query cancellation.
pub const CANCEL_REQUEST_CODE: u32 = 80877102;

/// Request code for GSSAPI transport encryption.
pub const GSSENC_REQUEST_CODE: u32 = 80877104;

/// Single-byte answer to an SSL request: TLS may proceed.
pub const SSL_ALLOWED: u8 = b'S';

/// Single-byte answer to an SSL request: TLS is not available.
pub const SSL_NOT_ALLOWED: u8 = b'N';

// Frontend message types

/// Password, SASLInitialResponse and SASLResponse all share this tag.
pub const MSG_PASSWORD: u8 = b'p';

/// Terminate
pub const MSG_TERMINATE: u8 = b'X';

// Backend message types

/// Authentication request
pub const MSG_AUTH_REQUEST: u8 = b'R';

/// ErrorResponse
pub const MSG_ERROR_RESPONSE: u8 = b'E';

/// NoticeResponse
pub const MSG_NOTICE_RESPONSE: u8 = b'N';

/// ParameterStatus
pub const MSG_PARAMETER_STATUS: u8 = b'S';

/// BackendKeyData
pub const MSG_BACKEND_KEY_DATA: u8 = b'K';

/// ReadyForQuery
pub const MSG_READY_FOR_QUERY: u8 = b'Z';

// Authentication request codes

pub const AUTH_OK: u32 = 0;
pub const AUTH_KERBEROS_V5: u32 = 2;
pub const AUTH_CLEARTEXT_PASSWORD: u32 = 3;
pub const AUTH_MD5_PASSWORD: u32 = 5;
pub const AUTH_SCM_CREDENTIAL: u32 = 6;
pub const AUTH_GSS: u32 = 7;
pub const AUTH_GSS_CONTINUE: u32 = 8;
pub const AUTH_SSPI: u32 = 9;
pub const AUTH_SASL: u32 = 10;
pub const AUTH_SASL_CONTINUE: u32 = 11;
pub const AUTH_SASL_FINAL: u32 = 12;

// ErrorResponse field codes

/// Localized severity
pub const FIELD_SEVERITY: u8 = b'S';
/// Non-localized severity (9.6+)
pub const FIELD_SEVERITY_V: u8 = b'V';
/// SQLSTATE
pub const FIELD_CODE: u8 = b'C';
/// Primary message
pub const FIELD_MESSAGE: u8 = b'M';
/// Detail
pub const FIELD_DETAIL: u8 = b'D';

/// SCRAM-SHA-256 SASL mechanism name
pub const SASL_SCRAM_SHA_256: &str = "SCRAM-SHA-256";

// SQLSTATE codes used in broker-generated errors

/// internal_error
pub const SQLSTATE_INTERNAL_ERROR: &str = "XX000";
/// protocol_violation
pub const SQLSTATE_PROTOCOL_VIOLATION: &str = "08P01";
/// too_many_connections
pub const SQLSTATE_TOO_MANY_CONNECTIONS: &str = "53300";

/// Human-readable name of an authentication request code, for logs and errors.
pub fn auth_method_name(code: u32) -> &'static str {
    match code {
        AUTH_OK => "AuthenticationOk",
        AUTH_KERBEROS_V5 => "KerberosV5",
        AUTH_CLEARTEXT_PASSWORD => "CleartextPassword",
        AUTH_MD5_PASSWORD => "MD5Password",
        AUTH_SCM_CREDENTIAL => "SCMCredential",
        AUTH_GSS => "GSS",
        AUTH_GSS_CONTINUE => "GSSContinue",
        AUTH_SSPI => "SSPI",
        AUTH_SASL => "SASL",
        AUTH_SASL_CONTINUE => "SASLContinue",
        AUTH_SASL_FINAL => "SASLFinal",
        _ => "Unknown",
    }
}
