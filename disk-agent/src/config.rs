// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with disk agent configuration.

use camino::Utf8PathBuf;
use serde::Deserialize;

/// Configuration for a disk agent.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Namespace in which the agent watches block-device resources.
    pub namespace: String,
    /// This agent's node identity. Only resources whose `spec.node_name`
    /// matches are reconciled.
    pub node_name: String,
    /// Maximum number of format operations run concurrently on this node.
    #[serde(default = "default_max_concurrent_ops")]
    pub max_concurrent_ops: usize,
    /// Device path globs the scanner considers for auto-provisioning.
    #[serde(default)]
    pub auto_provision_filters: Vec<String>,
}

fn default_max_concurrent_ops() -> usize {
    5
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}: {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

impl Config {
    pub fn from_file(path: &Utf8PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.clone(), err })?;
        let config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.clone(), err })?;
        Ok(config)
    }
}
