//! Engine Configuration

use crate::storage::config::StorageConfig;
use serde::{Deserialize, Serialize};

/// Fabric settings of an engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Libfabric provider, e.g. `ofi+verbs;ofi_rxm`
    pub provider: String,
    /// Network interface, e.g. `ib0`
    pub interface: String,
}

/// Static configuration of one engine instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ordinal of the instance on this node
    pub index: u32,
    /// Number of I/O targets
    pub targets: u32,
    pub fabric: FabricConfig,
    /// `KEY=VALUE` entries added to the engine environment
    pub env_vars: Vec<String>,
    pub storage: StorageConfig,
}

impl EngineConfig {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    /// Whether the environment already sets `name`
    pub fn has_env_var(&self, name: &str) -> bool {
        self.env_vars
            .iter()
            .any(|kv| kv.split_once('=').map(|(k, _)| k) == Some(name))
    }

    pub fn with_env_var(mut self, kv: impl Into<String>) -> Self {
        self.env_vars.push(kv.into());
        self
    }

    /// Environment pairs for the engine process
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .env_vars
            .iter()
            .filter_map(|kv| kv.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if let Some(vos_env) = self.storage.bdev.vos_env() {
            env.push(("VOS_BDEV_CLASS".to_string(), vos_env.to_string()));
        }
        env
    }
}
