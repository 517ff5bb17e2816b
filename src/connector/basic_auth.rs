//! `basic_auth` HTTP connector
//!
//! Adds `Authorization: Basic base64(username:password)` to every request.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use http::header::{HeaderValue, AUTHORIZATION};
use zeroize::Zeroizing;

use super::{ConnectorKind, HttpConnector, PluginInfo, Resources};
use crate::credentials::ResolvedCredentials;
use crate::error::{BrokerError, Result};

/// HTTP Basic authentication connector
#[derive(Debug)]
pub struct BasicAuthConnector {
    resources: Resources,
}

impl BasicAuthConnector {
    /// Connector id.
    pub const ID: &'static str = "basic_auth";

    /// Registration info.
    pub fn plugin_info() -> PluginInfo {
        PluginInfo::new(
            ConnectorKind::Http,
            Self::ID,
            "HTTP Basic authentication from username/password credentials",
        )
    }

    /// Build the connector for a service.
    pub fn new(resources: Resources) -> Self {
        Self { resources }
    }
}

#[async_trait]
impl HttpConnector for BasicAuthConnector {
    async fn connect(
        &self,
        request: &mut http::Request<Bytes>,
        credentials: &ResolvedCredentials,
    ) -> Result<()> {
        let _span = self.resources.span.enter();

        let username = credentials.get("username").ok_or_else(|| missing("username"))?;
        let password = credentials.get("password").ok_or_else(|| missing("password"))?;

        let mut pair = Zeroizing::new(Vec::with_capacity(username.len() + password.len() + 1));
        pair.extend_from_slice(username.expose());
        pair.push(b':');
        pair.extend_from_slice(password.expose());

        let header = Zeroizing::new(format!("Basic {}", BASE64.encode(&*pair)));
        let mut value = HeaderValue::from_str(&header)
            .map_err(|_| BrokerError::Auth("basic_auth: credentials are not a valid header".into()))?;
        value.set_sensitive(true);

        request.headers_mut().insert(AUTHORIZATION, value);
        debug!("Injected basic auth for {}", request.uri());
        Ok(())
    }

    fn required_credentials(&self) -> &'static [&'static str] {
        &["username", "password"]
    }
}

fn missing(name: &str) -> BrokerError {
    BrokerError::Auth(format!("basic_auth: credential '{}' was not resolved", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::SecretBytes;

    fn connector() -> BasicAuthConnector {
        BasicAuthConnector::new(Resources::new("api", BasicAuthConnector::ID, Bytes::new()))
    }

    fn request() -> http::Request<Bytes> {
        http::Request::builder()
            .uri("http://backend.internal/v1/items")
            .body(Bytes::new())
            .unwrap()
    }

    #[tokio::test]
    async fn test_sets_sensitive_authorization_header() {
        let mut creds = ResolvedCredentials::new();
        creds.insert("username", SecretBytes::from("Aladdin"));
        creds.insert("password", SecretBytes::from("open sesame"));

        let mut req = request();
        connector().connect(&mut req, &creds).await.unwrap();

        let value = req.headers().get(AUTHORIZATION).unwrap();
        assert_eq!(value.to_str().unwrap(), "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
        assert!(value.is_sensitive());
    }

    #[tokio::test]
    async fn test_replaces_client_authorization() {
        let mut creds = ResolvedCredentials::new();
        creds.insert("username", SecretBytes::from("u"));
        creds.insert("password", SecretBytes::from("p"));

        let mut req = request();
        req.headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_static("Bearer client-token"));
        connector().connect(&mut req, &creds).await.unwrap();

        assert_eq!(req.headers().get_all(AUTHORIZATION).iter().count(), 1);
        assert_eq!(req.headers()[AUTHORIZATION], "Basic dTpw");
    }

    #[tokio::test]
    async fn test_missing_password() {
        let mut creds = ResolvedCredentials::new();
        creds.insert("username", SecretBytes::from("u"));

        let mut req = request();
        let err = connector().connect(&mut req, &creds).await.unwrap_err();
        assert!(err.to_string().contains("'password'"));
        assert!(req.headers().get(AUTHORIZATION).is_none());
    }
}
