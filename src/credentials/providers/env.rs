//! Provider backed by process environment variables.

use std::collections::HashMap;
use std::env::VarError;

use async_trait::async_trait;

use crate::credentials::{Provider, ProviderError, ProviderResult, SecretBytes};

/// Reads each id as an environment variable name.
#[derive(Debug, Default)]
pub struct EnvProvider;

impl EnvProvider {
    fn lookup(id: &str) -> ProviderResult {
        if id.is_empty() || id.contains('=') || id.contains('\0') {
            return Err(ProviderError::InvalidKey(format!(
                "'{}' is not an environment variable name",
                id
            )));
        }
        match std::env::var(id) {
            Ok(value) => Ok(SecretBytes::from(value)),
            Err(VarError::NotPresent) => Err(ProviderError::NotFound(format!(
                "environment variable '{}'",
                id
            ))),
            Err(VarError::NotUnicode(_)) => Err(ProviderError::Unavailable(format!(
                "environment variable '{}' is not valid unicode",
                id
            ))),
        }
    }
}

#[async_trait]
impl Provider for EnvProvider {
    fn name(&self) -> &str {
        "env"
    }

    async fn get_values(&self, ids: &[String]) -> HashMap<String, ProviderResult> {
        ids.iter().map(|id| (id.clone(), Self::lookup(id))).collect()
    }
}
