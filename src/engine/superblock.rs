//! Engine Superblock
//!
//! Persisted identity of an engine instance, stored as YAML on the
//! instance's SCM mount. Its absence means the storage needs formatting.

use crate::domain::ports::Rank;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// File name of the superblock on the SCM mount
pub const SUPERBLOCK_NAME: &str = "superblock";

const SUPERBLOCK_VERSION: u8 = 0;

/// Persisted engine identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub version: u8,
    pub uuid: Uuid,
    pub system: String,
    /// Rank, possibly provisional until `valid_rank` is set
    pub rank: Option<Rank>,
    /// Whether `rank` was confirmed by a successful join
    pub valid_rank: bool,
}

impl Superblock {
    /// Fresh identity for newly formatted storage
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            version: SUPERBLOCK_VERSION,
            uuid: Uuid::new_v4(),
            system: system.into(),
            rank: None,
            valid_rank: false,
        }
    }
}

/// Reads and writes the superblock of one instance
#[derive(Debug, Clone)]
pub struct SuperblockStore {
    instance: u32,
    path: PathBuf,
}

impl SuperblockStore {
    pub fn new(instance: u32, scm_mount: impl AsRef<Path>) -> Self {
        Self {
            instance,
            path: scm_mount.as_ref().join(SUPERBLOCK_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the superblock; `None` if it has never been written
    pub fn load(&self) -> Result<Option<Superblock>> {
        let data = match fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.fault(format!("read {}: {}", self.path.display(), e))),
        };
        serde_yaml::from_str(&data)
            .map(Some)
            .map_err(|e| self.fault(format!("decode {}: {}", self.path.display(), e)))
    }

    /// Persist the superblock, replacing any previous one atomically
    pub fn store(&self, sb: &Superblock) -> Result<()> {
        let data = serde_yaml::to_string(sb)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, data)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|e| self.fault(format!("write {}: {}", self.path.display(), e)))
    }

    fn fault(&self, reason: String) -> Error {
        Error::Superblock {
            instance: self.instance,
            reason,
        }
    }
}
