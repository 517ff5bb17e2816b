//! Configuration loader

use super::Config;
use crate::error::{BrokerError, Result};
use std::path::Path;

/// Load configuration from a YAML file
///
/// Also applies CREDBROKER_* env var overrides after loading.
pub fn load_config(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)?;
    load_config_from_str(&contents)
}

/// Load configuration from a YAML string (useful for testing)
///
/// Also applies CREDBROKER_* env var overrides after loading.
pub fn load_config_from_str(yaml: &str) -> Result<Config> {
    let mut config: Config = serde_yaml::from_str(yaml)?;
    apply_env_overrides(&mut config);
    config.validate().map_err(BrokerError::Config)?;
    Ok(config)
}

/// Apply CREDBROKER_* environment variable overrides to a config.
///
/// Supported env vars:
/// - `CREDBROKER_HANDSHAKE_TIMEOUT_SECS` - Override the per-connection handshake deadline
/// - `CREDBROKER_MAX_CONNECTIONS` - Override the per-service connection limit
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("CREDBROKER_HANDSHAKE_TIMEOUT_SECS") {
        if let Ok(secs) = val.parse::<u64>() {
            debug!("Overriding handshake_timeout from CREDBROKER_HANDSHAKE_TIMEOUT_SECS");
            config.broker.handshake_timeout_secs = secs;
        }
    }
    if let Ok(val) = std::env::var("CREDBROKER_MAX_CONNECTIONS") {
        if let Ok(max) = val.parse::<usize>() {
            debug!("Overriding max_connections from CREDBROKER_MAX_CONNECTIONS");
            config.broker.max_connections = max;
        }
    }
}
