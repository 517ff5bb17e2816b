//! PostgreSQL message codec
//!
//! Framing: startup-phase packets are `[len u32][code u32][body]`, every
//! other message is `[tag u8][len u32][body]`. Lengths include themselves.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

use crate::error::{BrokerError, Result};

use super::constants::*;
use super::messages::*;

/// Largest message accepted from either peer.
pub const MAX_MESSAGE_SIZE: u32 = 100 * 1024 * 1024;

/// Largest startup packet accepted from a client (the server uses the same cap).
pub const MAX_STARTUP_PACKET_SIZE: u32 = 10_000;

/// The 8-byte SSLRequest packet.
pub const SSL_REQUEST: [u8; 8] = [0, 0, 0, 8, 0x04, 0xD2, 0x16, 0x2F];

/// The synthesized AuthenticationOk message: `R`, length 8, code 0.
pub const AUTHENTICATION_OK: [u8; 9] = [MSG_AUTH_REQUEST, 0, 0, 0, 8, 0, 0, 0, 0];

async fn read_u32<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}

/// Split a NUL-terminated string off the front of `buf`.
fn take_cstring(buf: &[u8]) -> Result<(&str, &[u8])> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| BrokerError::Protocol("missing string terminator".into()))?;
    let s = std::str::from_utf8(&buf[..end])
        .map_err(|_| BrokerError::Protocol("invalid UTF-8 in string".into()))?;
    Ok((s, &buf[end + 1..]))
}

/// Read the first packet of a client connection.
pub async fn read_client_hello<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ClientHello> {
    let length = read_u32(reader).await?;
    if length < 8 {
        return Err(BrokerError::Protocol(format!(
            "startup packet too short: {} bytes",
            length
        )));
    }
    if length > MAX_STARTUP_PACKET_SIZE {
        return Err(BrokerError::Protocol(format!(
            "startup packet too large: {} bytes",
            length
        )));
    }

    let code = read_u32(reader).await?;
    let mut body = Zeroizing::new(vec![0u8; (length - 8) as usize]);
    reader.read_exact(&mut body).await?;

    match code {
        SSL_REQUEST_CODE => Ok(ClientHello::SslRequest),
        GSSENC_REQUEST_CODE => Ok(ClientHello::GssEncRequest),
        CANCEL_REQUEST_CODE => {
            if body.len() < 8 {
                return Err(BrokerError::Protocol("truncated cancel request".into()));
            }
            Ok(ClientHello::CancelRequest {
                process_id: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                secret_key: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
            })
        }
        PROTOCOL_VERSION_3_0 => Ok(ClientHello::Startup(StartupMessage {
            protocol_version: code,
            parameters: parse_startup_parameters(&body)?,
        })),
        other => Err(BrokerError::Protocol(format!(
            "unsupported protocol version {}.{}",
            other >> 16,
            other & 0xFFFF
        ))),
    }
}

fn parse_startup_parameters(mut body: &[u8]) -> Result<Vec<(String, String)>> {
    let mut parameters = Vec::new();
    while !body.is_empty() {
        let (key, rest) = take_cstring(body)?;
        if key.is_empty() {
            break;
        }
        let (value, rest) = take_cstring(rest)?;
        parameters.push((key.to_string(), value.to_string()));
        body = rest;
    }
    Ok(parameters)
}

/// Encode a startup packet.
pub fn encode_startup(msg: &StartupMessage) -> Zeroizing<Vec<u8>> {
    let mut body = Zeroizing::new(Vec::new());
    body.extend_from_slice(&msg.protocol_version.to_be_bytes());
    for (key, value) in &msg.parameters {
        body.extend_from_slice(key.as_bytes());
        body.push(0);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);

    let mut packet = Zeroizing::new(Vec::with_capacity(body.len() + 4));
    packet.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
    packet.extend_from_slice(&body);
    packet
}

/// Write a startup packet and flush.
pub async fn write_startup<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &StartupMessage,
) -> Result<()> {
    writer.write_all(&encode_startup(msg)).await?;
    writer.flush().await?;
    Ok(())
}

/// Send an SSLRequest and read the single-byte answer.
pub async fn probe_ssl<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<u8> {
    stream.write_all(&SSL_REQUEST).await?;
    stream.flush().await?;
    let mut answer = [0u8; 1];
    stream.read_exact(&mut answer).await?;
    Ok(answer[0])
}

/// Read a tagged message, returning the tag and body.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(u8, Vec<u8>)> {
    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag).await?;

    let length = read_u32(reader).await?;
    if length < 4 {
        return Err(BrokerError::Protocol(format!(
            "invalid message length {}",
            length
        )));
    }
    if length > MAX_MESSAGE_SIZE {
        return Err(BrokerError::Protocol(format!(
            "message too large: {} bytes",
            length
        )));
    }

    let mut body = vec![0u8; (length - 4) as usize];
    reader.read_exact(&mut body).await?;
    Ok((tag[0], body))
}

/// Encode a tagged message.
pub fn encode_message(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(tag);
    out.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Write a tagged message and flush.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, tag: u8, body: &[u8]) -> Result<()> {
    writer.write_all(&[tag]).await?;
    writer.write_all(&((body.len() + 4) as u32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Write an ErrorResponse and flush.
pub async fn write_error<W: AsyncWrite + Unpin>(writer: &mut W, error: &ErrorResponse) -> Result<()> {
    write_message(writer, MSG_ERROR_RESPONSE, &error.to_payload()).await
}

/// Parse the body of an `R` message.
pub fn parse_auth_request(body: &[u8]) -> Result<AuthRequest> {
    if body.len() < 4 {
        return Err(BrokerError::Protocol(
            "authentication request too short".into(),
        ));
    }
    let code = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    let data = &body[4..];

    let request = match code {
        AUTH_OK => AuthRequest::Ok,
        AUTH_CLEARTEXT_PASSWORD => AuthRequest::CleartextPassword,
        AUTH_MD5_PASSWORD => {
            if data.len() < 4 {
                return Err(BrokerError::Protocol("MD5 request missing salt".into()));
            }
            AuthRequest::Md5Password {
                salt: [data[0], data[1], data[2], data[3]],
            }
        }
        AUTH_SASL => {
            let mut mechanisms = Vec::new();
            let mut rest = data;
            while !rest.is_empty() {
                let (name, tail) = take_cstring(rest)?;
                if name.is_empty() {
                    break;
                }
                mechanisms.push(name.to_string());
                rest = tail;
            }
            AuthRequest::Sasl { mechanisms }
        }
        AUTH_SASL_CONTINUE => AuthRequest::SaslContinue(data.to_vec()),
        AUTH_SASL_FINAL => AuthRequest::SaslFinal(data.to_vec()),
        other => AuthRequest::Unsupported(other),
    };
    Ok(request)
}

/// Parse an ErrorResponse or NoticeResponse body.
pub fn parse_error_response(body: &[u8]) -> Result<ErrorResponse> {
    let mut fields = Vec::new();
    let mut rest = body;
    while let Some((&code, tail)) = rest.split_first() {
        if code == 0 {
            break;
        }
        let (value, tail) = take_cstring(tail)?;
        fields.push((code, value.to_string()));
        rest = tail;
    }
    Ok(ErrorResponse { fields })
}

/// Body of a PasswordMessage carrying `password` (NUL terminated).
pub fn password_body(password: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut body = Zeroizing::new(Vec::with_capacity(password.len() + 1));
    body.extend_from_slice(password);
    body.push(0);
    body
}

/// Body of a SASLInitialResponse.
pub fn sasl_initial_response_body(mechanism: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(mechanism.len() + data.len() + 5);
    body.extend_from_slice(mechanism.as_bytes());
    body.push(0);
    body.extend_from_slice(&(data.len() as i32).to_be_bytes());
    body.extend_from_slice(data);
    body
}
