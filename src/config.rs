//! Runtime configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The name of this node in the cluster.
    pub node_name: String,

    /// The per-command submission timeout used by the client layer, in seconds.
    #[serde(default = "Config::default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// The throttle sleep applied before reporting a transient aux action failure, in seconds.
    #[serde(default = "Config::default_aux_retry_sleep_secs")]
    pub aux_retry_sleep_secs: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the
    /// application config from that. In the future, this may take into account an
    /// optional config file as well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        Ok(config)
    }

    fn default_command_timeout_secs() -> u64 {
        30
    }

    fn default_aux_retry_sleep_secs() -> u64 {
        5
    }

    /// Build an instance for use in tests.
    #[cfg(test)]
    pub fn new_test() -> Arc<Self> {
        Arc::new(Self {
            rust_log: "".into(),
            node_name: "node-0".into(),
            command_timeout_secs: 1,
            aux_retry_sleep_secs: 0,
        })
    }
}
