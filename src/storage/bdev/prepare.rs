//! Bdev Preparation
//!
//! Host resource allocation that must happen before any engine touches
//! NVMe storage: huge pages, and binding devices to a user-space driver.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, info};

/// Huge pages requested when no bdevs are configured; enough for scans.
pub const MIN_HUGE_PAGE_COUNT: u64 = 128;

// =============================================================================
// Request / Response
// =============================================================================

/// Host resource allocation request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    /// Number of huge pages to allocate
    pub huge_page_count: u64,
    /// User the devices and huge pages are made accessible to
    pub target_user: String,
    /// Space separated PCI addresses to prepare
    pub pci_allowlist: String,
    /// Space separated PCI addresses to leave alone
    pub pci_blocklist: String,
    /// Bind devices to uio instead of vfio
    pub disable_vfio: bool,
    /// Do not prepare VMD domains
    pub disable_vmd: bool,
}

/// Outcome of a preparation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareResponse {
    /// Output of the preparation step, for logging
    pub output: String,
}

/// Observed huge page availability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HugePageInfo {
    pub total: u64,
    pub free: u64,
    pub page_size_kb: u64,
}

impl HugePageInfo {
    /// Parse the huge page lines of `/proc/meminfo`
    pub fn parse_meminfo(meminfo: &str) -> Result<Self> {
        let mut info = HugePageInfo::default();
        let mut seen = false;

        for line in meminfo.lines() {
            let mut parts = line.split_whitespace();
            let (key, value) = match (parts.next(), parts.next()) {
                (Some(k), Some(v)) => (k, v),
                _ => continue,
            };
            let slot = match key {
                "HugePages_Total:" => &mut info.total,
                "HugePages_Free:" => &mut info.free,
                "Hugepagesize:" => &mut info.page_size_kb,
                _ => continue,
            };
            *slot = value
                .parse()
                .map_err(|_| Error::HugePageInfo(format!("invalid value in line {:?}", line)))?;
            seen = true;
        }

        if !seen {
            return Err(Error::HugePageInfo("no hugepage entries in meminfo".into()));
        }
        Ok(info)
    }
}

// =============================================================================
// Preparer Port
// =============================================================================

/// Performs privileged bdev preparation
pub trait BdevPreparer: Send + Sync {
    /// Allocate resources described by `req`; blocking
    fn prepare(&self, req: &PrepareRequest) -> Result<PrepareResponse>;
}

/// Preparer driving the SPDK setup script
#[derive(Debug, Clone)]
pub struct SpdkSetupScript {
    script_path: PathBuf,
    /// Extra variables for the privileged helper, e.g. its log file
    helper_env: Vec<(String, String)>,
}

impl SpdkSetupScript {
    pub fn new(script_path: impl Into<PathBuf>) -> Self {
        Self {
            script_path: script_path.into(),
            helper_env: Vec::new(),
        }
    }

    pub fn with_helper_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.helper_env
            .extend(env.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Environment passed to the setup script for `req`
    pub fn script_env(req: &PrepareRequest) -> Vec<(&'static str, String)> {
        let driver = if req.disable_vfio {
            "uio_pci_generic"
        } else {
            "vfio-pci"
        };
        let mut env = vec![
            ("PATH", "/sbin:/usr/sbin:/bin:/usr/bin".to_string()),
            ("_NRHUGE", req.huge_page_count.to_string()),
            ("_TARGET_USER", req.target_user.clone()),
            ("_DRIVER_OVERRIDE", driver.to_string()),
        ];
        if !req.pci_allowlist.is_empty() {
            env.push(("_PCI_ALLOWED", req.pci_allowlist.clone()));
        }
        if !req.pci_blocklist.is_empty() {
            env.push(("_PCI_BLOCKED", req.pci_blocklist.clone()));
        }
        if req.disable_vmd {
            env.push(("_DISABLE_VMD", "1".to_string()));
        }
        env
    }
}

impl BdevPreparer for SpdkSetupScript {
    fn prepare(&self, req: &PrepareRequest) -> Result<PrepareResponse> {
        info!("running {} for {} hugepages", self.script_path.display(), req.huge_page_count);

        let output = Command::new(&self.script_path)
            .env_clear()
            .envs(Self::script_env(req))
            .envs(self.helper_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()
            .map_err(|e| Error::Prepare(format!("{}: {}", self.script_path.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Prepare(format!(
                "{} exited with {}: {}",
                self.script_path.display(),
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        debug!("setup script output: {}", stdout);
        Ok(PrepareResponse { output: stdout })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const MEMINFO: &str = "MemTotal:       263518364 kB
MemFree:        254021188 kB
HugePages_Total:    4096
HugePages_Free:     4000
HugePages_Rsvd:        0
Hugepagesize:       2048 kB
";

    #[test]
    fn test_parse_meminfo() {
        let info = HugePageInfo::parse_meminfo(MEMINFO).unwrap();
        assert_eq!(info.total, 4096);
        assert_eq!(info.free, 4000);
        assert_eq!(info.page_size_kb, 2048);
    }

    #[test]
    fn test_parse_meminfo_errors() {
        assert_matches!(HugePageInfo::parse_meminfo("MemTotal: 1 kB\n"), Err(Error::HugePageInfo(_)));
        assert_matches!(
            HugePageInfo::parse_meminfo("HugePages_Free: lots\n"),
            Err(Error::HugePageInfo(_))
        );
    }

    #[test]
    fn test_script_env() {
        let req = PrepareRequest {
            huge_page_count: 256,
            target_user: "daos".into(),
            pci_allowlist: "0000:81:00.0 0000:82:00.0".into(),
            disable_vfio: true,
            ..Default::default()
        };
        let env = SpdkSetupScript::script_env(&req);
        assert!(env.contains(&("_NRHUGE", "256".to_string())));
        assert!(env.contains(&("_DRIVER_OVERRIDE", "uio_pci_generic".to_string())));
        assert!(env.contains(&("_PCI_ALLOWED", "0000:81:00.0 0000:82:00.0".to_string())));
        assert!(!env.iter().any(|(k, _)| *k == "_PCI_BLOCKED"));
        assert!(!env.iter().any(|(k, _)| *k == "_DISABLE_VMD"));
    }

    #[test]
    fn test_missing_script_is_prepare_error() {
        let script = SpdkSetupScript::new("/nonexistent/setup_spdk.sh");
        assert_matches!(script.prepare(&PrepareRequest::default()), Err(Error::Prepare(_)));
    }
}
