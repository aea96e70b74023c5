//! Server Configuration
//!
//! Node-level configuration loaded from YAML, plus the queries the server
//! derives from it at startup.

use crate::engine::config::EngineConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default management port
pub const DEFAULT_CONTROL_PORT: u16 = 10001;

/// Directory under the first engine's SCM mount holding RAFT state
pub const RAFT_DIR_NAME: &str = "control_raft";

/// Log file variable read by the privileged storage helper
pub const HELPER_LOG_FILE_ENV: &str = "DAOS_ADMIN_LOG_FILE";

/// Log file variable read by the privileged firmware helper
pub const FW_HELPER_LOG_FILE_ENV: &str = "DAOS_FIRMWARE_LOG_FILE";

fn default_name() -> String {
    "daos_server".to_string()
}

fn default_access_points() -> Vec<String> {
    vec!["localhost".to_string()]
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_nr_hugepages() -> u64 {
    4096
}

fn default_engine_binary() -> PathBuf {
    PathBuf::from("daos_engine")
}

fn default_setup_script() -> PathBuf {
    PathBuf::from("/usr/share/daos/control/setup_spdk.sh")
}

/// Static configuration of a storage node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// System name recorded in every superblock
    #[serde(default = "default_name")]
    pub name: String,
    /// Management service replicas as `host[:port]`
    #[serde(default = "default_access_points")]
    pub access_points: Vec<String>,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Huge pages per engine
    #[serde(default = "default_nr_hugepages")]
    pub nr_hugepages: u64,
    #[serde(default)]
    pub disable_vfio: bool,
    #[serde(default)]
    pub disable_vmd: bool,
    /// PCI addresses to prepare
    #[serde(default)]
    pub bdev_include: Vec<String>,
    /// PCI addresses to leave alone
    #[serde(default)]
    pub bdev_exclude: Vec<String>,
    #[serde(default)]
    pub helper_log_file: Option<PathBuf>,
    #[serde(default)]
    pub fw_helper_log_file: Option<PathBuf>,
    /// Prometheus exporter port, 0 disables it
    #[serde(default)]
    pub telemetry_port: u16,
    #[serde(default = "default_engine_binary")]
    pub engine_binary: PathBuf,
    #[serde(default = "default_setup_script")]
    pub spdk_setup_script: PathBuf,
    #[serde(default)]
    pub engines: Vec<EngineConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            access_points: default_access_points(),
            control_port: DEFAULT_CONTROL_PORT,
            nr_hugepages: default_nr_hugepages(),
            disable_vfio: false,
            disable_vmd: false,
            bdev_include: Vec::new(),
            bdev_exclude: Vec::new(),
            helper_log_file: None,
            fw_helper_log_file: None,
            telemetry_port: 0,
            engine_binary: default_engine_binary(),
            spdk_setup_script: default_setup_script(),
            engines: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        let cfg: ServerConfig = serde_yaml::from_str(&data)?;
        cfg.validate()?;
        debug!("loaded config from {}", path.display());
        Ok(cfg)
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engines.push(engine);
        self
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Configuration("system name must not be empty".into()));
        }
        if self.access_points.is_empty() {
            return Err(Error::Configuration("at least one access point is required".into()));
        }

        let mut seen = HashSet::new();
        for (pos, engine) in self.engines.iter().enumerate() {
            if engine.index as usize != pos {
                return Err(Error::Configuration(format!(
                    "engine at position {} has index {}",
                    pos, engine.index
                )));
            }
            let mount = &engine.storage.scm.mount_point;
            if mount.as_os_str().is_empty() {
                return Err(Error::Configuration(format!(
                    "engine {}: scm mount point not set",
                    engine.index
                )));
            }
            if !seen.insert(mount.clone()) {
                return Err(Error::Configuration(format!(
                    "engine {}: scm mount point {} already in use",
                    engine.index,
                    mount.display()
                )));
            }
        }

        Ok(())
    }

    /// Whether any engine has devices listed
    pub fn has_bdevs(&self) -> bool {
        self.engines.iter().any(|e| e.storage.bdev.has_devices())
    }

    /// Addresses of the system database replicas
    pub fn replica_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.access_points
            .iter()
            .map(|ap| {
                let addr = if ap.contains(':') {
                    ap.clone()
                } else {
                    format!("{}:{}", ap, self.control_port)
                };
                addr.to_socket_addrs()
                    .ok()
                    .and_then(|mut addrs| addrs.next())
                    .ok_or_else(|| Error::BadAccessPoints { address: ap.clone() })
            })
            .collect()
    }

    /// Directory for RAFT state; `None` without engines to hold it
    pub fn raft_dir(&self) -> Option<PathBuf> {
        self.engines
            .first()
            .map(|e| e.storage.scm.mount_point.join(RAFT_DIR_NAME))
    }

    /// Environment for the privileged helpers
    pub fn helper_env(&self) -> Vec<(&'static str, String)> {
        let mut env = Vec::new();
        if let Some(path) = &self.helper_log_file {
            env.push((HELPER_LOG_FILE_ENV, path.display().to_string()));
        }
        if let Some(path) = &self.fw_helper_log_file {
            env.push((FW_HELPER_LOG_FILE_ENV, path.display().to_string()));
        }
        env
    }
}
