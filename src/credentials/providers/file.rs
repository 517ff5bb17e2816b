//! Provider backed by files on disk.

use std::collections::HashMap;
use std::io::ErrorKind;

use async_trait::async_trait;

use crate::credentials::{Provider, ProviderError, ProviderResult, SecretBytes};

/// Reads each id as a file path and returns the file's contents.
#[derive(Debug, Default)]
pub struct FileProvider;

impl FileProvider {
    async fn lookup(id: &str) -> ProviderResult {
        match tokio::fs::read(id).await {
            Ok(bytes) => Ok(SecretBytes::new(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ProviderError::NotFound(format!("file '{}'", id)))
            }
            Err(e) => Err(ProviderError::Unavailable(format!(
                "failed to read file '{}': {}",
                id,
                e.kind()
            ))),
        }
    }
}

#[async_trait]
impl Provider for FileProvider {
    fn name(&self) -> &str {
        "file"
    }

    async fn get_values(&self, ids: &[String]) -> HashMap<String, ProviderResult> {
        let mut values = HashMap::with_capacity(ids.len());
        for id in ids {
            values.insert(id.clone(), Self::lookup(id).await);
        }
        values
    }
}
