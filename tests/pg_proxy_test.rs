//! Integration tests for the `pg` connector through a running broker
//!
//! Each test starts a loopback mock PostgreSQL backend, so no database is
//! needed:
//! ```bash
//! cargo test --test pg_proxy_test
//! ```

#[macro_use]
mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use common::{
    connect_client, expect_ready, expect_single_error, start_broker, start_broker_with,
    BackendAuth, MockBackend,
};
use credbroker::config::load_config_from_str;
use credbroker::credentials::{Provider, ProviderResult};
use credbroker::protocol::postgres::{encode_message, read_message, ErrorResponse};
use credbroker::{Broker, ConnectorRegistry, Resolver, SecretBytes};

fn pg_service(backend_port: u16, extra_credentials: &str) -> String {
    format!(
        r#"
version: "2"
services:
  db:
    connector: pg
    listenOn: tcp://127.0.0.1:0
    credentials:
      host: 127.0.0.1
      port: {}
{}
"#,
        backend_port, extra_credentials
    )
}

const APP_CREDENTIALS: &str = r#"      username: app_user
      password: s3cret"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cleartext_backend_then_pass_through() {
    with_timeout!({
        let backend = MockBackend::spawn(BackendAuth::Cleartext("s3cret")).await;
        let (broker, addr) = start_broker(&pg_service(backend.port(), APP_CREDENTIALS), "db").await;

        let mut client = connect_client(addr, "anyone", Some("analytics")).await;
        expect_ready(&mut client).await;

        let query = encode_message(b'Q', b"SELECT 1\0");
        client.write_all(&query).await.unwrap();
        let (tag, body) = read_message(&mut client).await.unwrap();
        assert_eq!(tag, b'Q');
        assert_eq!(body, b"SELECT 1\0");

        let mut payload = vec![0u8; 64 * 1024];
        rand::thread_rng().fill_bytes(&mut payload);
        client.write_all(&payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);

        drop(client);
        let seen = backend.wait_for(1).await;
        assert!(seen[0].authenticated);
        assert_eq!(seen[0].param("user"), Some("app_user"));
        assert_eq!(seen[0].param("database"), Some("analytics"));

        broker.stop_all().await;
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_database_credential_used_when_client_names_none() {
    with_timeout!({
        let backend = MockBackend::spawn(BackendAuth::Trust).await;
        let credentials = format!("{}\n      database: inventory", APP_CREDENTIALS);
        let (broker, addr) = start_broker(&pg_service(backend.port(), &credentials), "db").await;

        let mut client = connect_client(addr, "anyone", None).await;
        expect_ready(&mut client).await;
        drop(client);

        let seen = backend.wait_for(1).await;
        assert_eq!(seen[0].param("database"), Some("inventory"));
        broker.stop_all().await;
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_md5_backend() {
    with_timeout!({
        let backend = MockBackend::spawn(BackendAuth::Md5("s3cret")).await;
        let (broker, addr) = start_broker(&pg_service(backend.port(), APP_CREDENTIALS), "db").await;

        let mut client = connect_client(addr, "anyone", Some("app")).await;
        expect_ready(&mut client).await;
        drop(client);

        assert!(backend.wait_for(1).await[0].authenticated);
        broker.stop_all().await;
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scram_backend() {
    with_timeout!({
        let backend = MockBackend::spawn(BackendAuth::Scram("s3cret")).await;
        let (broker, addr) = start_broker(&pg_service(backend.port(), APP_CREDENTIALS), "db").await;

        let mut client = connect_client(addr, "anyone", Some("app")).await;
        expect_ready(&mut client).await;

        client.write_all(&encode_message(b'Q', b"SELECT now()\0")).await.unwrap();
        let (tag, _) = read_message(&mut client).await.unwrap();
        assert_eq!(tag, b'Q');
        drop(client);

        assert!(backend.wait_for(1).await[0].authenticated);
        broker.stop_all().await;
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wrong_password_is_reported_by_backend() {
    with_timeout!({
        let backend = MockBackend::spawn(BackendAuth::Scram("other")).await;
        let (broker, addr) = start_broker(&pg_service(backend.port(), APP_CREDENTIALS), "db").await;

        let mut client = connect_client(addr, "anyone", Some("app")).await;
        let error = expect_single_error(&mut client).await;
        assert_eq!(error.code(), Some("28P01"));
        broker.stop_all().await;
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backend_error_relayed_verbatim() {
    with_timeout!({
        let rejection = ErrorResponse::fatal("3D000", "database \"nope\" does not exist")
            .with_detail("no such database");
        let backend = MockBackend::spawn(BackendAuth::Reject(rejection.clone())).await;
        let (broker, addr) = start_broker(&pg_service(backend.port(), APP_CREDENTIALS), "db").await;

        let mut client = connect_client(addr, "anyone", Some("nope")).await;
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, encode_message(b'E', &rejection.to_payload()));

        broker.stop_all().await;
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_host_credential_fails_service_at_startup() {
    with_timeout!({
        let backend = MockBackend::spawn(BackendAuth::Trust).await;
        let yaml = format!(
            r#"
version: "2"
services:
  no_host:
    connector: pg
    listenOn: tcp://127.0.0.1:0
    credentials:
      username: app_user
      password: s3cret
  db:
    connector: pg
    listenOn: tcp://127.0.0.1:0
    credentials:
      host: 127.0.0.1
      port: {}
      username: app_user
      password: s3cret
"#,
            backend.port()
        );
        let config = load_config_from_str(&yaml).unwrap();
        let broker = Broker::launch(
            &config,
            &ConnectorRegistry::with_builtins(),
            Arc::new(Resolver::with_builtin_providers()),
        )
        .await;

        assert!(broker.service("no_host").is_none());
        let (name, error) = &broker.failures()[0];
        assert_eq!(name, "no_host");
        assert!(error.to_string().contains("host"), "{}", error);

        let addr = broker.service("db").unwrap().local_addr().unwrap();
        let mut client = connect_client(addr, "anyone", Some("app")).await;
        expect_ready(&mut client).await;

        broker.stop_all().await;
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_port_credential_keeps_listener_running() {
    with_timeout!({
        let yaml = r#"
version: "2"
services:
  db:
    connector: pg
    listenOn: tcp://127.0.0.1:0
    credentials:
      host: 127.0.0.1
      port: not-a-port
      username: app_user
      password: s3cret
"#;
        let (broker, addr) = start_broker(yaml, "db").await;

        for _ in 0..2 {
            let mut client = connect_client(addr, "anyone", Some("app")).await;
            let error = expect_single_error(&mut client).await;
            assert_eq!(error.severity(), Some("FATAL"));
            assert_eq!(error.code(), Some("XX000"));
            assert!(error.message().unwrap().contains("loading backend credentials"));
            assert!(error.field(b'D').unwrap().contains("port"));
        }

        let stats = broker.service("db").unwrap().stats();
        for _ in 0..100 {
            if stats.connections_failed.load(Ordering::Relaxed) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats.connections_failed.load(Ordering::Relaxed), 2);
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 2);
        broker.stop_all().await;
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_backend_hits_handshake_timeout() {
    with_timeout!({
        let backend = MockBackend::spawn(BackendAuth::Silent).await;
        let yaml = format!(
            r#"
version: "2"
broker:
  handshake_timeout_secs: 1
services:
  db:
    connector: pg
    listenOn: tcp://127.0.0.1:0
    credentials:
      host: 127.0.0.1
      port: {}
      username: app_user
      password: s3cret
"#,
            backend.port()
        );
        let (broker, addr) = start_broker(&yaml, "db").await;

        let mut client = connect_client(addr, "anyone", Some("app")).await;
        let error = expect_single_error(&mut client).await;
        assert_eq!(error.severity(), Some("FATAL"));
        assert_eq!(error.code(), Some("XX000"));
        assert!(error.message().unwrap().contains("authenticating to backend"));
        assert!(error.field(b'D').unwrap().contains("did not finish within 1s"));

        let stats = broker.service("db").unwrap().stats();
        for _ in 0..100 {
            if stats.connections_failed.load(Ordering::Relaxed) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats.connections_failed.load(Ordering::Relaxed), 1);
        broker.stop_all().await;
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unresolvable_credential_sends_error_without_secrets() {
    with_timeout!({
        std::env::remove_var("CREDBROKER_IT_MISSING_PASSWORD");
        let backend = MockBackend::spawn(BackendAuth::Trust).await;
        let credentials = r#"      username: app_user
      password:
        from: env
        get: CREDBROKER_IT_MISSING_PASSWORD"#;
        let (broker, addr) = start_broker(&pg_service(backend.port(), credentials), "db").await;

        let mut client = connect_client(addr, "anyone", Some("app")).await;
        let error = expect_single_error(&mut client).await;
        assert!(error.message().unwrap().contains("retrieving credentials"));
        let detail = error.field(b'D').unwrap();
        assert!(detail.contains("CREDBROKER_IT_MISSING_PASSWORD"));
        assert!(!detail.contains("app_user"));

        // The backend was never contacted.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(backend.observed.lock().is_empty());

        let mut again = connect_client(addr, "anyone", Some("app")).await;
        expect_single_error(&mut again).await;
        broker.stop_all().await;
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tls_required_but_refused_by_backend() {
    with_timeout!({
        let backend = MockBackend::spawn(BackendAuth::RefuseTls).await;
        let credentials = format!("{}\n      sslmode: require", APP_CREDENTIALS);
        let (broker, addr) = start_broker(&pg_service(backend.port(), &credentials), "db").await;

        let mut client = connect_client(addr, "anyone", Some("app")).await;
        let error = expect_single_error(&mut client).await;
        assert!(error.message().unwrap().contains("negotiating TLS"));
        assert!(error.field(b'D').unwrap().contains("backend does not allow TLS"));

        let seen = backend.wait_for(1).await;
        assert_eq!(seen[0].bytes_after_tls_refusal, Some(0));
        broker.stop_all().await;
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_ssl_request_is_declined() {
    with_timeout!({
        let backend = MockBackend::spawn(BackendAuth::Trust).await;
        let (broker, addr) = start_broker(&pg_service(backend.port(), APP_CREDENTIALS), "db").await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&credbroker::protocol::postgres::SSL_REQUEST)
            .await
            .unwrap();
        let mut answer = [0u8; 1];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(&answer, b"N");

        let mut startup = credbroker::protocol::postgres::StartupMessage::new("anyone");
        startup.set("database", "app");
        client
            .write_all(&credbroker::protocol::postgres::encode_startup(&startup))
            .await
            .unwrap();
        expect_ready(&mut client).await;
        broker.stop_all().await;
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_request_is_closed() {
    with_timeout!({
        let backend = MockBackend::spawn(BackendAuth::Trust).await;
        let (broker, addr) = start_broker(&pg_service(backend.port(), APP_CREDENTIALS), "db").await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut cancel = Vec::new();
        cancel.extend_from_slice(&16u32.to_be_bytes());
        cancel.extend_from_slice(&80877102u32.to_be_bytes());
        cancel.extend_from_slice(&4242u32.to_be_bytes());
        cancel.extend_from_slice(&99u32.to_be_bytes());
        client.write_all(&cancel).await.unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        broker.stop_all().await;
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stopped_broker_refuses_connections() {
    with_timeout!({
        let backend = MockBackend::spawn(BackendAuth::Trust).await;
        let (broker, addr) = start_broker(&pg_service(backend.port(), APP_CREDENTIALS), "db").await;

        let mut client = connect_client(addr, "anyone", Some("app")).await;
        expect_ready(&mut client).await;

        broker.stop_all().await;
        let service = broker.service("db").unwrap();
        assert!(service.start().is_err());

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("in-flight connection survived stop");
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(TcpStream::connect(addr).await.is_err());
    })
}

/// Vault stand-in that counts batches and can rotate its values.
struct CountingProvider {
    batches: Arc<Mutex<Vec<Vec<String>>>>,
    values: Arc<Mutex<HashMap<String, String>>>,
}

#[async_trait]
impl Provider for CountingProvider {
    fn name(&self) -> &str {
        "vault"
    }

    async fn get_values(&self, ids: &[String]) -> HashMap<String, ProviderResult> {
        self.batches.lock().push(ids.to_vec());
        let values = self.values.lock();
        ids.iter()
            .map(|id| {
                let value = values
                    .get(id)
                    .map(|v| SecretBytes::from(v.as_str()))
                    .ok_or_else(|| credbroker::credentials::ProviderError::NotFound(id.clone()));
                (id.clone(), value)
            })
            .collect()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_credentials_batched_and_fresh_per_connection() {
    with_timeout!({
        let batches = Arc::new(Mutex::new(Vec::new()));
        let values = Arc::new(Mutex::new(HashMap::from([
            ("db/user".to_string(), "first_user".to_string()),
            ("db/password".to_string(), "s3cret".to_string()),
        ])));
        let instances = Arc::new(AtomicUsize::new(0));

        let resolver = {
            let batches = Arc::clone(&batches);
            let values = Arc::clone(&values);
            let instances = Arc::clone(&instances);
            Resolver::with_builtin_providers().with_provider("vault", move || {
                instances.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(CountingProvider {
                    batches: Arc::clone(&batches),
                    values: Arc::clone(&values),
                }) as Arc<dyn Provider>)
            })
        };

        let backend = MockBackend::spawn(BackendAuth::Cleartext("s3cret")).await;
        let credentials = r#"      username:
        from: vault
        get: db/user
      password:
        from: vault
        get: db/password"#;
        let (broker, addr) =
            start_broker_with(&pg_service(backend.port(), credentials), "db", resolver).await;

        let mut first = connect_client(addr, "anyone", Some("app")).await;
        expect_ready(&mut first).await;
        drop(first);
        backend.wait_for(1).await;

        values
            .lock()
            .insert("db/user".to_string(), "rotated_user".to_string());

        let mut second = connect_client(addr, "anyone", Some("app")).await;
        expect_ready(&mut second).await;
        drop(second);
        let seen = backend.wait_for(2).await;

        let users: Vec<_> = seen.iter().map(|o| o.param("user").unwrap().to_string()).collect();
        assert!(users.contains(&"first_user".to_string()));
        assert!(users.contains(&"rotated_user".to_string()));

        let batches = batches.lock();
        assert_eq!(batches.len(), 2);
        for batch in batches.iter() {
            let mut ids = batch.clone();
            ids.sort();
            assert_eq!(ids, vec!["db/password", "db/user"]);
        }
        assert_eq!(instances.load(Ordering::SeqCst), 1);

        broker.stop_all().await;
    })
}
