//! Loopback PostgreSQL backends and client helpers for integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::{Digest as _, Md5};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use credbroker::config::load_config_from_str;
use credbroker::protocol::postgres::{
    encode_message, encode_startup, read_message, ErrorResponse, StartupMessage,
    AUTHENTICATION_OK, SSL_REQUEST_CODE,
};
use credbroker::{Broker, ConnectorRegistry, Resolver};

/// Default test timeout
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Helper macro to run test with timeout
macro_rules! with_timeout {
    ($body:expr) => {
        match tokio::time::timeout($crate::common::TEST_TIMEOUT, async { $body }).await {
            Ok(result) => result,
            Err(_) => panic!("Test timed out after {:?}", $crate::common::TEST_TIMEOUT),
        }
    };
}

/// How the mock backend authenticates its clients.
#[derive(Clone)]
pub enum BackendAuth {
    /// No password exchange
    Trust,
    /// AuthenticationCleartextPassword
    Cleartext(&'static str),
    /// AuthenticationMD5Password with a fixed salt
    Md5(&'static str),
    /// SASL SCRAM-SHA-256
    Scram(&'static str),
    /// Answer the startup with this ErrorResponse
    Reject(ErrorResponse),
    /// Answer an SSLRequest with 'N' and count what arrives afterwards
    RefuseTls,
    /// Read the startup and never answer it
    Silent,
}

/// What a backend connection saw.
#[derive(Debug, Default, Clone)]
pub struct Observed {
    /// Startup parameters received
    pub startup: Vec<(String, String)>,
    /// Whether the password exchange succeeded
    pub authenticated: bool,
    /// Bytes received after refusing TLS, until the broker hung up
    pub bytes_after_tls_refusal: Option<usize>,
}

impl Observed {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.startup
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A listening mock backend. Each connection is recorded in `observed`.
pub struct MockBackend {
    pub addr: SocketAddr,
    pub observed: Arc<Mutex<Vec<Observed>>>,
    handle: JoinHandle<()>,
}

impl MockBackend {
    pub async fn spawn(auth: BackendAuth) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let observed = Arc::new(Mutex::new(Vec::new()));

        let recorder = Arc::clone(&observed);
        let handle = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let auth = auth.clone();
                let recorder = Arc::clone(&recorder);
                tokio::spawn(async move {
                    let seen = serve(socket, auth).await;
                    recorder.lock().push(seen);
                });
            }
        });

        Self {
            addr,
            observed,
            handle,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Wait until `count` connections have finished.
    pub async fn wait_for(&self, count: usize) -> Vec<Observed> {
        for _ in 0..500 {
            {
                let observed = self.observed.lock();
                if observed.len() >= count {
                    return observed.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("backend saw fewer than {} connections", count);
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn read_startup_packet(socket: &mut TcpStream) -> Option<(u32, Vec<u8>)> {
    let len = socket.read_u32().await.ok()? as usize;
    let mut body = vec![0u8; len.checked_sub(4)?];
    socket.read_exact(&mut body).await.ok()?;
    let code = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    Some((code, body[4..].to_vec()))
}

fn parse_params(body: &[u8]) -> Vec<(String, String)> {
    let mut parts = body
        .split(|b| *b == 0)
        .map(|s| String::from_utf8_lossy(s).into_owned());
    let mut params = Vec::new();
    while let (Some(k), Some(v)) = (parts.next(), parts.next()) {
        if k.is_empty() {
            break;
        }
        params.push((k, v));
    }
    params
}

fn auth_request(code: u32, extra: &[u8]) -> Vec<u8> {
    let mut body = code.to_be_bytes().to_vec();
    body.extend_from_slice(extra);
    encode_message(b'R', &body)
}

fn password_failed() -> Vec<u8> {
    encode_message(
        b'E',
        &ErrorResponse::fatal("28P01", "password authentication failed").to_payload(),
    )
}

fn cstr(body: &[u8]) -> &[u8] {
    body.strip_suffix(&[0]).unwrap_or(body)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn md5_response(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = hex(&Md5::digest(format!("{}{}", password, user).as_bytes()));
    let mut outer = Md5::new();
    outer.update(inner.as_bytes());
    outer.update(salt);
    format!("md5{}", hex(&outer.finalize()))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

async fn scram_exchange(socket: &mut TcpStream, password: &str) -> bool {
    socket
        .write_all(&auth_request(10, b"SCRAM-SHA-256\0\0"))
        .await
        .unwrap();

    let (tag, body) = read_message(socket).await.unwrap();
    assert_eq!(tag, b'p');
    let mech_end = body.iter().position(|b| *b == 0).unwrap();
    assert_eq!(&body[..mech_end], b"SCRAM-SHA-256");
    let client_first = String::from_utf8(body[mech_end + 5..].to_vec()).unwrap();
    let client_first_bare = client_first.strip_prefix("n,,").unwrap().to_string();
    let client_nonce = client_first_bare
        .split(',')
        .find_map(|a| a.strip_prefix("r="))
        .unwrap()
        .to_string();

    let salt = b"credbroker-salt!";
    let iterations = 4096;
    let server_first = format!(
        "r={}srvnonce,s={},i={}",
        client_nonce,
        BASE64.encode(salt),
        iterations
    );
    socket
        .write_all(&auth_request(11, server_first.as_bytes()))
        .await
        .unwrap();

    let (tag, body) = read_message(socket).await.unwrap();
    assert_eq!(tag, b'p');
    let client_final = String::from_utf8(body).unwrap();
    let (without_proof, proof) = client_final.rsplit_once(",p=").unwrap();
    let proof = BASE64.decode(proof).unwrap();

    let mut salted = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut salted);
    let client_key = hmac_sha256(&salted, b"Client Key");
    let stored_key = Sha256::digest(&client_key);
    let server_key = hmac_sha256(&salted, b"Server Key");
    let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
    let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
    let expected: Vec<u8> = client_key
        .iter()
        .zip(client_signature.iter())
        .map(|(k, s)| k ^ s)
        .collect();
    if expected != proof {
        return false;
    }

    let server_signature = hmac_sha256(&server_key, auth_message.as_bytes());
    let server_final = format!("v={}", BASE64.encode(server_signature));
    socket
        .write_all(&auth_request(12, server_final.as_bytes()))
        .await
        .unwrap();
    true
}

async fn serve(mut socket: TcpStream, auth: BackendAuth) -> Observed {
    let mut seen = Observed::default();

    let Some((mut code, mut body)) = read_startup_packet(&mut socket).await else {
        return seen;
    };
    if code == SSL_REQUEST_CODE {
        socket.write_all(b"N").await.unwrap();
        if let BackendAuth::RefuseTls = auth {
            let mut total = 0;
            let mut buf = [0u8; 256];
            while let Ok(Ok(n)) = timeout(Duration::from_secs(5), socket.read(&mut buf)).await {
                if n == 0 {
                    break;
                }
                total += n;
            }
            seen.bytes_after_tls_refusal = Some(total);
            return seen;
        }
        match read_startup_packet(&mut socket).await {
            Some(next) => (code, body) = next,
            None => return seen,
        }
    }
    assert_eq!(code, 196608, "expected protocol 3.0 startup");
    seen.startup = parse_params(&body);
    let user = seen.param("user").unwrap_or_default().to_string();

    let ok = match &auth {
        BackendAuth::Trust => true,
        BackendAuth::Cleartext(password) => {
            socket.write_all(&auth_request(3, &[])).await.unwrap();
            let (tag, body) = read_message(&mut socket).await.unwrap();
            tag == b'p' && cstr(&body) == password.as_bytes()
        }
        BackendAuth::Md5(password) => {
            let salt = [0x01, 0x02, 0x03, 0x04];
            socket.write_all(&auth_request(5, &salt)).await.unwrap();
            let (tag, body) = read_message(&mut socket).await.unwrap();
            tag == b'p' && cstr(&body) == md5_response(&user, password, &salt).as_bytes()
        }
        BackendAuth::Scram(password) => scram_exchange(&mut socket, password).await,
        BackendAuth::Reject(error) => {
            socket
                .write_all(&encode_message(b'E', &error.to_payload()))
                .await
                .unwrap();
            return seen;
        }
        BackendAuth::Silent => {
            let mut buf = [0u8; 256];
            while let Ok(n) = socket.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
            return seen;
        }
        BackendAuth::RefuseTls => unreachable!("client did not request TLS"),
    };

    if !ok {
        let _ = socket.write_all(&password_failed()).await;
        return seen;
    }
    seen.authenticated = true;

    let mut greeting = auth_request(0, &[]);
    greeting.extend(encode_message(b'S', b"server_version\016.0\0"));
    let mut key_data = 4242u32.to_be_bytes().to_vec();
    key_data.extend_from_slice(&99u32.to_be_bytes());
    greeting.extend(encode_message(b'K', &key_data));
    greeting.extend(encode_message(b'Z', b"I"));
    socket.write_all(&greeting).await.unwrap();

    // Echo everything afterwards.
    let mut buf = [0u8; 4096];
    loop {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if socket.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    seen
}

/// Start a broker from YAML and return it with the address of `service`.
pub async fn start_broker(yaml: &str, service: &str) -> (Broker, SocketAddr) {
    start_broker_with(yaml, service, Resolver::with_builtin_providers()).await
}

/// Like [`start_broker`] with a custom resolver.
pub async fn start_broker_with(
    yaml: &str,
    service: &str,
    resolver: Resolver,
) -> (Broker, SocketAddr) {
    let config = load_config_from_str(yaml).unwrap();
    let broker = Broker::launch(
        &config,
        &ConnectorRegistry::with_builtins(),
        Arc::new(resolver),
    )
    .await;
    let addr = broker
        .service(service)
        .unwrap_or_else(|| panic!("service '{}' did not start: {:?}", service, broker.failures()))
        .local_addr()
        .unwrap();
    (broker, addr)
}

/// Connect as a PostgreSQL client and send a startup packet.
pub async fn connect_client(addr: SocketAddr, user: &str, database: Option<&str>) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut startup = StartupMessage::new(user);
    if let Some(database) = database {
        startup.set("database", database);
    }
    stream.write_all(&encode_startup(&startup)).await.unwrap();
    stream
}

/// Read the synthesized AuthenticationOk and the backend's greeting up to ReadyForQuery.
pub async fn expect_ready(stream: &mut TcpStream) {
    let mut auth_ok = [0u8; 9];
    stream.read_exact(&mut auth_ok).await.unwrap();
    assert_eq!(auth_ok, AUTHENTICATION_OK);

    let mut tags = Vec::new();
    loop {
        let (tag, body) = read_message(stream).await.unwrap();
        tags.push(tag);
        if tag == b'Z' {
            assert_eq!(body, b"I");
            break;
        }
    }
    assert_eq!(tags, vec![b'S', b'K', b'Z']);
}

/// Read one message and then expect the broker to hang up.
pub async fn expect_single_error(stream: &mut TcpStream) -> ErrorResponse {
    let (tag, body) = read_message(stream).await.unwrap();
    assert_eq!(tag, b'E', "expected ErrorResponse");
    let error = credbroker::protocol::postgres::parse_error_response(&body).unwrap();

    let mut rest = Vec::new();
    let _ = timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .expect("broker did not close the connection");
    assert!(rest.is_empty(), "unexpected bytes after ErrorResponse");
    error
}
