//! Error types for the engine control plane
//!
//! Every fault surfaced by the control plane is a variant of [`Error`]. Each
//! variant belongs to a [`FaultClass`] that decides how the caller reacts, and
//! user-facing faults carry a resolution hint for the operator.

use crate::domain::ports::Rank;
use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for the control plane
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("spdk: generated nvme config is unexpectedly empty (tier {tier})")]
    EmptyBdevConfig { tier: usize },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("unable to map {0:?} to BdevClass")]
    UnknownBdevClass(String),

    #[error("invalid nvme config: bdev device list entry empty (tier {tier}, index {index})")]
    BdevEntryEmpty { tier: usize, index: usize },

    #[error("invalid nvme config: backfile_size should be between 1 and 9223372036 GB (tier {tier})")]
    BdevBadFileSize { tier: usize },

    #[error("please specify absolute path ({})", .0.display())]
    RelativeBackingFile(PathBuf),

    #[error("unable to resolve access point {address}")]
    BadAccessPoints { address: String },

    // =========================================================================
    // Environment / Privilege Errors
    // =========================================================================
    #[error("VFIO can not be disabled if running as non-root user")]
    VfioDisabled,

    #[error("no IOMMU detected while running as non-root user with NVMe devices")]
    IommuDisabled,

    #[error("unable to read system hugepage info: {0}")]
    HugePageInfo(String),

    #[error("failed to resolve alias for {interface}: {reason}")]
    FabricAlias { interface: String, reason: String },

    // =========================================================================
    // Resource Errors
    // =========================================================================
    #[error("insufficient free hugepages: requested {requested}, free {free}")]
    InsufficientFreeHugePages { free: u64, requested: u64 },

    // =========================================================================
    // Transient Errors
    // =========================================================================
    #[error("automatic NVMe prepare failed: {0}")]
    Prepare(String),

    // =========================================================================
    // Engine Lifecycle Errors
    // =========================================================================
    #[error("instance {instance}: invalid phase transition {from} -> {to}")]
    InvalidTransition {
        instance: u32,
        from: String,
        to: String,
    },

    #[error("instance {instance}: superblock error: {reason}")]
    Superblock { instance: u32, reason: String },

    #[error("instance {instance}: failed to start engine process: {reason}")]
    EngineStart { instance: u32, reason: String },

    #[error("failed to start system db: {0}")]
    SystemDb(String),

    #[error("system join failed: {0}")]
    Join(String),

    #[error("rank {rank} not found in membership")]
    RankNotFound { rank: Rank },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broad class of a fault, deciding how the control plane reacts to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Bad static configuration, surfaced at construction time
    Configuration,
    /// Host privilege or environment not suitable for the configuration
    Environment,
    /// Host resources short of what was requested
    Resources,
    /// Internal consistency failure, never retried
    Internal,
    /// Transient failure, logged and re-checked elsewhere
    Transient,
    /// Runtime failure of a single instance or collaborator
    Runtime,
}

impl std::fmt::Display for FaultClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultClass::Configuration => write!(f, "configuration"),
            FaultClass::Environment => write!(f, "environment"),
            FaultClass::Resources => write!(f, "resources"),
            FaultClass::Internal => write!(f, "internal"),
            FaultClass::Transient => write!(f, "transient"),
            FaultClass::Runtime => write!(f, "runtime"),
        }
    }
}

impl Error {
    /// Classify this fault
    pub fn class(&self) -> FaultClass {
        match self {
            Error::Configuration(_)
            | Error::UnknownBdevClass(_)
            | Error::BdevEntryEmpty { .. }
            | Error::BdevBadFileSize { .. }
            | Error::RelativeBackingFile(_)
            | Error::BadAccessPoints { .. }
            | Error::Yaml(_) => FaultClass::Configuration,

            Error::VfioDisabled
            | Error::IommuDisabled
            | Error::HugePageInfo(_)
            | Error::FabricAlias { .. } => FaultClass::Environment,

            Error::InsufficientFreeHugePages { .. } => FaultClass::Resources,

            Error::Internal(_)
            | Error::EmptyBdevConfig { .. }
            | Error::InvalidTransition { .. } => FaultClass::Internal,

            Error::Prepare(_) => FaultClass::Transient,

            Error::Superblock { .. }
            | Error::EngineStart { .. }
            | Error::SystemDb(_)
            | Error::Join(_)
            | Error::RankNotFound { .. }
            | Error::Io(_) => FaultClass::Runtime,
        }
    }

    /// Operator-facing hint on how to resolve this fault, if one exists
    pub fn resolution(&self) -> Option<&'static str> {
        match self {
            Error::VfioDisabled => Some(
                "disable_vfio: true in config while running as non-root user \
                 is unsupported; remove the setting or run as root",
            ),
            Error::IommuDisabled => Some(
                "enable IOMMU per the platform documentation, or run the \
                 control plane as root",
            ),
            Error::InsufficientFreeHugePages { .. } => Some(
                "reboot the system or manually clear /dev/hugepages as \
                 appropriate, or lower nr_hugepages",
            ),
            Error::BdevEntryEmpty { .. } | Error::BdevBadFileSize { .. } => {
                Some("fix the bdev tier definitions in the server config")
            }
            Error::BadAccessPoints { .. } => {
                Some("correct the access_points entries in the server config")
            }
            _ => None,
        }
    }

    /// Check if this error may succeed when attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), FaultClass::Transient)
    }

    /// Operator-facing report: message, fault class and resolution hint
    pub fn report(&self) -> String {
        match self.resolution() {
            Some(hint) => format!("{} [{}]: {}", self, self.class(), hint),
            None => format!("{} [{}]", self, self.class()),
        }
    }
}

/// Result type alias for the control plane
pub type Result<T> = std::result::Result<T, Error>;
