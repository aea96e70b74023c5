//! Storage Configuration
//!
//! Declarative per-engine storage description: the SCM mount holding the
//! superblock and the ordered list of bdev tiers.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

// =============================================================================
// Bdev Class
// =============================================================================

/// Backend access mode of a bdev tier
///
/// Serialized through `Display`/`FromStr`, so the unset class is `""`
/// everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BdevClass {
    #[default]
    None,
    Nvme,
    Malloc,
    Kdev,
    File,
}

impl std::fmt::Display for BdevClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BdevClass::None => write!(f, ""),
            BdevClass::Nvme => write!(f, "nvme"),
            BdevClass::Malloc => write!(f, "malloc"),
            BdevClass::Kdev => write!(f, "kdev"),
            BdevClass::File => write!(f, "file"),
        }
    }
}

impl FromStr for BdevClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(BdevClass::None),
            "nvme" => Ok(BdevClass::Nvme),
            "malloc" => Ok(BdevClass::Malloc),
            "kdev" => Ok(BdevClass::Kdev),
            "file" => Ok(BdevClass::File),
            other => Err(Error::UnknownBdevClass(other.to_string())),
        }
    }
}

impl TryFrom<String> for BdevClass {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<BdevClass> for String {
    fn from(class: BdevClass) -> Self {
        class.to_string()
    }
}

/// Bdev class tag exported to the engine as `VOS_BDEV_CLASS`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VosEnv {
    Nvme,
    Malloc,
    Aio,
}

impl VosEnv {
    pub fn as_str(&self) -> &'static str {
        match self {
            VosEnv::Nvme => "NVME",
            VosEnv::Malloc => "MALLOC",
            VosEnv::Aio => "AIO",
        }
    }
}

impl std::fmt::Display for VosEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Bdev Tier
// =============================================================================

/// One declared storage-device tier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BdevConfig {
    /// Device class of the tier
    #[serde(rename = "bdev_class")]
    pub class: BdevClass,
    /// PCI addresses, kernel devices or backing file paths
    #[serde(rename = "bdev_list")]
    pub device_list: Vec<String>,
    /// Number of malloc devices
    #[serde(rename = "bdev_number")]
    pub device_count: u32,
    /// Requested size in GB for file and malloc classes
    #[serde(rename = "bdev_size")]
    pub file_size: i64,
    /// Skip the VMD wrapper for NVMe tiers
    pub vmd_disabled: bool,
    /// Derived by the class provider; consumed by the engine at start
    #[serde(skip)]
    pub vos_env: Option<VosEnv>,
}

impl BdevConfig {
    pub fn new(class: BdevClass) -> Self {
        Self {
            class,
            ..Default::default()
        }
    }

    pub fn with_devices<I, S>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.device_list = devices.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_device_count(mut self, count: u32) -> Self {
        self.device_count = count;
        self
    }

    pub fn with_size(mut self, gbytes: i64) -> Self {
        self.file_size = gbytes;
        self
    }

    pub fn with_vmd_disabled(mut self, disabled: bool) -> Self {
        self.vmd_disabled = disabled;
        self
    }
}

/// Ordered tier list of one engine plus the fields derived from it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BdevTier {
    #[serde(rename = "tiers")]
    pub tiers: Vec<BdevConfig>,
    /// Generated engine bdev config file, set when one is required
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
    /// Number of tiers the engine should attach
    #[serde(skip)]
    pub tiers_num: usize,
}

impl BdevTier {
    pub fn new(tiers: Vec<BdevConfig>) -> Self {
        Self {
            tiers,
            ..Default::default()
        }
    }

    /// Whether any tier lists devices
    pub fn has_devices(&self) -> bool {
        self.tiers.iter().any(|t| !t.device_list.is_empty())
    }

    /// `VOS_BDEV_CLASS` value for the engine, taken from the first tier
    pub fn vos_env(&self) -> Option<VosEnv> {
        self.tiers.first().and_then(|t| t.vos_env)
    }
}

// =============================================================================
// Engine Storage
// =============================================================================

/// SCM (persistent memory) mount of an engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScmConfig {
    pub mount_point: PathBuf,
}

/// All storage assigned to one engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub scm: ScmConfig,
    pub bdev: BdevTier,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_bdev_class_from_str() {
        assert_eq!("nvme".parse::<BdevClass>().unwrap(), BdevClass::Nvme);
        assert_eq!("".parse::<BdevClass>().unwrap(), BdevClass::None);
        assert_matches!("tape".parse::<BdevClass>(), Err(Error::UnknownBdevClass(c)) if c == "tape");
    }

    #[test]
    fn test_tier_yaml() {
        let yaml = r#"
tiers:
  - bdev_class: nvme
    bdev_list: ["0000:81:00.0", "0000:82:00.0"]
  - bdev_class: file
    bdev_list: ["/mnt/t1"]
    bdev_size: 4
"#;
        let tier: BdevTier = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(tier.tiers.len(), 2);
        assert_eq!(tier.tiers[0].class, BdevClass::Nvme);
        assert_eq!(tier.tiers[1].file_size, 4);
        assert!(tier.has_devices());
        assert_eq!(tier.vos_env(), None);
    }

    #[test]
    fn test_bdev_class_spelling_matches_yaml() {
        for class in [
            BdevClass::None,
            BdevClass::Nvme,
            BdevClass::Malloc,
            BdevClass::Kdev,
            BdevClass::File,
        ] {
            let yaml = serde_yaml::to_string(&class).unwrap();
            let parsed: BdevClass = serde_yaml::from_str(&yaml).unwrap();
            assert_eq!(parsed, class);
            assert_eq!(class.to_string().parse::<BdevClass>().unwrap(), class);
        }

        let tier: BdevTier = serde_yaml::from_str("tiers:\n  - bdev_class: \"\"\n").unwrap();
        assert_eq!(tier.tiers[0].class, BdevClass::None);
        assert!(serde_yaml::from_str::<BdevClass>("none").is_err());
    }

    #[test]
    fn test_unknown_class_rejected_by_yaml() {
        let yaml = "tiers:\n  - bdev_class: tape\n";
        assert!(serde_yaml::from_str::<BdevTier>(yaml).is_err());
    }
}
