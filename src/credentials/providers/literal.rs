//! Provider for values declared inline in configuration.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::credentials::{Provider, ProviderResult, SecretBytes, LITERAL_PROVIDER};

/// Returns each id as its own value.
#[derive(Debug, Default)]
pub struct LiteralProvider;

#[async_trait]
impl Provider for LiteralProvider {
    fn name(&self) -> &str {
        LITERAL_PROVIDER
    }

    async fn get_values(&self, ids: &[String]) -> HashMap<String, ProviderResult> {
        ids.iter()
            .map(|id| (id.clone(), Ok(SecretBytes::copy_from(id.as_bytes()))))
            .collect()
    }
}
