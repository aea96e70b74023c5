//! Host Probe
//!
//! Reads sysfs and procfs for the host facts device preparation depends on:
//! IOMMU presence, huge page availability, the hostname and the running user.

use crate::error::{Error, Result};
use crate::storage::bdev::HugePageInfo;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

// =============================================================================
// Probe Configuration
// =============================================================================

/// Configuration for the host probe
#[derive(Debug, Clone)]
pub struct HostProbeConfig {
    /// Path to sysfs (for testing)
    pub sysfs_path: PathBuf,
    /// Path to procfs (for testing)
    pub procfs_path: PathBuf,
    /// File holding the hostname
    pub hostname_path: PathBuf,
}

impl Default for HostProbeConfig {
    fn default() -> Self {
        Self {
            sysfs_path: PathBuf::from("/sys"),
            procfs_path: PathBuf::from("/proc"),
            hostname_path: PathBuf::from("/etc/hostname"),
        }
    }
}

// =============================================================================
// Host Probe
// =============================================================================

/// Reads host facts from the kernel's pseudo filesystems
#[derive(Debug, Clone, Default)]
pub struct HostProbe {
    config: HostProbeConfig,
}

impl HostProbe {
    pub fn new(config: HostProbeConfig) -> Self {
        Self { config }
    }

    /// Whether the kernel exposes any IOMMU units
    pub fn iommu_detected(&self) -> bool {
        // Any DMAR entry under the class directory is good enough.
        let iommu_path = self.config.sysfs_path.join("class/iommu");
        match fs::read_dir(&iommu_path) {
            Ok(entries) => entries.count() > 0,
            Err(e) => {
                debug!("no iommu at {}: {}", iommu_path.display(), e);
                false
            }
        }
    }

    /// Current huge page availability from `meminfo`
    pub fn hugepage_info(&self) -> Result<HugePageInfo> {
        let path = self.config.procfs_path.join("meminfo");
        let meminfo = fs::read_to_string(&path)
            .map_err(|e| Error::HugePageInfo(format!("failed to read {}: {}", path.display(), e)))?;
        HugePageInfo::parse_meminfo(&meminfo)
    }

    /// Hostname of this node
    pub fn hostname(&self) -> String {
        if let Ok(hostname) = fs::read_to_string(&self.config.hostname_path) {
            let hostname = hostname.trim();
            if !hostname.is_empty() {
                return hostname.to_string();
            }
        }

        #[cfg(unix)]
        {
            use std::process::Command;
            if let Ok(output) = Command::new("hostname").output() {
                if output.status.success() {
                    return String::from_utf8_lossy(&output.stdout).trim().to_string();
                }
            }
        }

        "unknown".to_string()
    }
}

// =============================================================================
// Target User
// =============================================================================

/// User the control plane runs as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUser {
    pub name: String,
    pub uid: u32,
}

impl TargetUser {
    pub fn new(name: impl Into<String>, uid: u32) -> Self {
        Self {
            name: name.into(),
            uid,
        }
    }

    /// The effective user of this process
    pub fn current() -> Self {
        // SAFETY: geteuid has no preconditions and cannot fail.
        let uid = unsafe { libc::geteuid() };
        let name = std::env::var("USER")
            .ok()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| if uid == 0 { "root".into() } else { uid.to_string() });
        Self { name, uid }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}
