//! Password authentication against a PostgreSQL backend
//!
//! MD5 (`md5` + hex(md5(hex(md5(password + user)) + salt))) and the client
//! half of SCRAM-SHA-256 (RFC 5802 / RFC 7677) without channel binding.
//! Every buffer derived from the password is zeroized on drop.
//!
//! Passwords are used as given; SASLprep normalization is not applied, so
//! non-ASCII passwords only work if the server stored them unnormalized.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{BrokerError, Result};

type HmacSha256 = Hmac<Sha256>;

/// GS2 header for "client does not support channel binding".
const GS2_HEADER: &str = "n,,";

/// Highest PBKDF2 iteration count a backend may ask for. Key derivation runs
/// on a runtime worker, so the cost stays bounded. PostgreSQL defaults to 4096.
pub const MAX_SCRAM_ITERATIONS: u32 = 100_000;

/// Compute the response to an MD5 password request.
pub fn compute_md5_password(user: &str, password: &[u8], salt: &[u8; 4]) -> Zeroizing<String> {
    let mut inner = Md5::new();
    inner.update(password);
    inner.update(user.as_bytes());
    let inner_hex = Zeroizing::new(hex(&inner.finalize()));

    let mut outer = Md5::new();
    outer.update(inner_hex.as_bytes());
    outer.update(salt);
    Zeroizing::new(format!("md5{}", hex(&outer.finalize())))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

enum ScramState {
    Initial,
    ClientFirstSent {
        client_first_bare: String,
    },
    ClientFinalSent {
        expected_server_signature: Zeroizing<[u8; 32]>,
    },
    Verified,
    Failed,
}

/// Client side of a SCRAM-SHA-256 exchange.
///
/// ```ignore
/// let mut scram = ScramSha256::new("app", password);
/// send(scram.client_first());
/// send(scram.client_final(&server_first)?);
/// scram.verify_server_final(&server_final)?;
/// ```
pub struct ScramSha256 {
    username: String,
    password: Zeroizing<Vec<u8>>,
    client_nonce: String,
    state: ScramState,
}

impl ScramSha256 {
    /// Start an exchange with a fresh random nonce.
    pub fn new(username: &str, password: &[u8]) -> Self {
        let mut raw = [0u8; 18];
        rand::thread_rng().fill_bytes(&mut raw);
        Self::with_nonce(username, password, BASE64.encode(raw))
    }

    fn with_nonce(username: &str, password: &[u8], client_nonce: String) -> Self {
        Self {
            username: username.to_string(),
            password: Zeroizing::new(password.to_vec()),
            client_nonce,
            state: ScramState::Initial,
        }
    }

    /// The client-first-message.
    pub fn client_first(&mut self) -> Vec<u8> {
        let client_first_bare = format!(
            "n={},r={}",
            escape_username(&self.username),
            self.client_nonce
        );
        let message = format!("{}{}", GS2_HEADER, client_first_bare);
        self.state = ScramState::ClientFirstSent { client_first_bare };
        message.into_bytes()
    }

    /// Consume the server-first-message and produce the client-final-message.
    pub fn client_final(&mut self, server_first: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let client_first_bare = match std::mem::replace(&mut self.state, ScramState::Failed) {
            ScramState::ClientFirstSent { client_first_bare } => client_first_bare,
            _ => return Err(scram_error("server-first-message out of order")),
        };

        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| scram_error("server-first-message is not UTF-8"))?;
        let (nonce, salt, iterations) = parse_server_first(server_first)?;

        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(scram_error("server nonce does not extend client nonce"));
        }

        let mut salted_password = Zeroizing::new([0u8; 32]);
        pbkdf2_hmac::<Sha256>(&self.password, &salt, iterations, &mut *salted_password);

        let without_proof = format!("c={},r={}", BASE64.encode(GS2_HEADER), nonce);
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);

        let client_key = Zeroizing::new(hmac_sha256(&*salted_password, b"Client Key")?);
        let stored_key = Zeroizing::new(sha256(&*client_key));
        let client_signature = Zeroizing::new(hmac_sha256(&*stored_key, auth_message.as_bytes())?);
        let proof: Zeroizing<Vec<u8>> = Zeroizing::new(
            client_key
                .iter()
                .zip(client_signature.iter())
                .map(|(k, s)| k ^ s)
                .collect(),
        );

        let server_key = Zeroizing::new(hmac_sha256(&*salted_password, b"Server Key")?);
        let expected_server_signature =
            Zeroizing::new(hmac_sha256(&*server_key, auth_message.as_bytes())?);

        self.state = ScramState::ClientFinalSent {
            expected_server_signature,
        };

        let message = format!("{},p={}", without_proof, BASE64.encode(&*proof));
        Ok(Zeroizing::new(message.into_bytes()))
    }

    /// Verify the server-final-message, proving the server knows the password.
    pub fn verify_server_final(&mut self, server_final: &[u8]) -> Result<()> {
        let expected = match std::mem::replace(&mut self.state, ScramState::Failed) {
            ScramState::ClientFinalSent {
                expected_server_signature,
            } => expected_server_signature,
            _ => return Err(scram_error("server-final-message out of order")),
        };

        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| scram_error("server-final-message is not UTF-8"))?;

        if let Some(reason) = server_final.strip_prefix("e=") {
            return Err(scram_error(&format!("server reported {}", reason)));
        }

        let signature = server_final
            .split(',')
            .find_map(|attr| attr.strip_prefix("v="))
            .ok_or_else(|| scram_error("server-final-message has no verifier"))?;
        let signature = BASE64
            .decode(signature)
            .map_err(|_| scram_error("server verifier is not base64"))?;

        if bool::from(signature.as_slice().ct_eq(&expected[..])) {
            self.state = ScramState::Verified;
            Ok(())
        } else {
            Err(scram_error("server signature mismatch"))
        }
    }

    /// Whether the server signature has been verified.
    pub fn is_verified(&self) -> bool {
        matches!(self.state, ScramState::Verified)
    }
}

fn scram_error(detail: &str) -> BrokerError {
    BrokerError::Auth(format!("SCRAM-SHA-256: {}", detail))
}

/// `,` and `=` are reserved in SCRAM attribute values.
fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

/// Parse `r=<nonce>,s=<salt>,i=<iterations>`.
fn parse_server_first(message: &str) -> Result<(String, Vec<u8>, u32)> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for attr in message.split(',') {
        if let Some(value) = attr.strip_prefix("r=") {
            nonce = Some(value.to_string());
        } else if let Some(value) = attr.strip_prefix("s=") {
            salt = Some(
                BASE64
                    .decode(value)
                    .map_err(|_| scram_error("salt is not base64"))?,
            );
        } else if let Some(value) = attr.strip_prefix("i=") {
            iterations = Some(
                value
                    .parse::<u32>()
                    .map_err(|_| scram_error("invalid iteration count"))?,
            );
        } else if attr.starts_with("m=") {
            return Err(scram_error("mandatory extensions are not supported"));
        }
    }

    match (nonce, salt, iterations) {
        (Some(_), Some(_), Some(0)) => Err(scram_error("iteration count must be positive")),
        (Some(_), Some(_), Some(i)) if i > MAX_SCRAM_ITERATIONS => Err(scram_error(&format!(
            "iteration count {} exceeds the limit of {}",
            i, MAX_SCRAM_ITERATIONS
        ))),
        (Some(n), Some(s), Some(i)) => Ok((n, s, i)),
        _ => Err(scram_error("server-first-message is incomplete")),
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| scram_error("invalid HMAC key length"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
