//! Bdev Class Provider
//!
//! Validates the bdev tiers of one engine and renders the SPDK configuration
//! file the engine loads to attach its storage backend.

use crate::error::{Error, Result};
use crate::storage::config::{BdevClass, BdevConfig, BdevTier, VosEnv};
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::debug;

// =============================================================================
// Constants
// =============================================================================

/// Name of the generated config file inside the config directory
pub const CONFIG_FILE_NAME: &str = "daos_nvme.conf";

/// Block size backing files are aligned to
pub const BLOCK_SIZE: i64 = 4096;

const GBYTE: i64 = 1_000_000_000;

const VMD_PREFIX: &str = "[Vmd]\n    Enable True\n\n";

const MSG_BDEV_NONE: &str = "in config, no nvme.conf generated for server";

// =============================================================================
// Templates
// =============================================================================

/// Config section rendered for a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Template {
    Nvme { vmd: bool },
    AioFile,
    AioKdev,
    Malloc,
}

struct RenderContext<'a> {
    hostname: &'a str,
    tier_idx: usize,
    cfg: &'a BdevConfig,
}

impl Template {
    fn render(&self, ctx: &RenderContext<'_>) -> String {
        let mut out = String::new();
        let (host, tier) = (ctx.hostname, ctx.tier_idx);

        // Writing into a String cannot fail.
        match self {
            Template::Nvme { vmd } => {
                if *vmd {
                    out.push_str(VMD_PREFIX);
                }
                out.push_str("[Nvme]\n");
                for (i, addr) in ctx.cfg.device_list.iter().enumerate() {
                    let _ = writeln!(
                        out,
                        "    TransportID \"trtype:PCIe traddr:{addr}\" Nvme_{host}_{i}_{tier}"
                    );
                }
                out.push_str(
                    "    RetryCount 4\n    TimeoutUsec 0\n    ActionOnTimeout None\n    \
                     AdminPollRate 100000\n    HotplugEnable No\n    HotplugPollRate 0\n",
                );
            }
            Template::AioFile => {
                out.push_str("[AIO]\n");
                for (i, path) in ctx.cfg.device_list.iter().enumerate() {
                    let _ = writeln!(out, "    AIO {path} AIO_{host}_{i}_{tier} {BLOCK_SIZE}");
                }
            }
            Template::AioKdev => {
                out.push_str("[AIO]\n");
                for (i, dev) in ctx.cfg.device_list.iter().enumerate() {
                    let _ = writeln!(out, "    AIO {dev} AIO_{host}_{i}_{tier}");
                }
            }
            Template::Malloc => {
                let _ = write!(
                    out,
                    "[Malloc]\n    NumberOfLuns {}\n    LunSizeInMB {}000\n",
                    ctx.cfg.device_count, ctx.cfg.file_size
                );
            }
        }

        out
    }
}

// =============================================================================
// Class Behaviour
// =============================================================================

type EmptyCheck = fn(&BdevConfig) -> Option<&'static str>;
type ValidCheck = fn(usize, &BdevConfig) -> Result<()>;
type DeviceInit = fn(usize, &BdevConfig) -> Result<()>;

/// Parameters and behaviours of one bdev class
struct ClassBehaviour {
    template: Template,
    vos_env: Option<VosEnv>,
    is_empty: EmptyCheck,
    is_valid: ValidCheck,
    init: DeviceInit,
}

impl ClassBehaviour {
    fn for_config(cfg: &BdevConfig) -> Self {
        match cfg.class {
            BdevClass::None => Self {
                template: Template::Nvme { vmd: false },
                vos_env: None,
                is_empty: empty_list,
                is_valid: valid_list,
                init: nil_init,
            },
            BdevClass::Nvme => Self {
                template: Template::Nvme {
                    vmd: !cfg.vmd_disabled,
                },
                vos_env: Some(VosEnv::Nvme),
                is_empty: empty_list,
                is_valid: valid_list,
                init: nil_init,
            },
            BdevClass::Malloc => Self {
                template: Template::Malloc,
                vos_env: Some(VosEnv::Malloc),
                is_empty: empty_number,
                is_valid: nil_validate,
                init: nil_init,
            },
            BdevClass::Kdev => Self {
                template: Template::AioKdev,
                vos_env: Some(VosEnv::Aio),
                is_empty: empty_list,
                is_valid: valid_list,
                init: nil_init,
            },
            BdevClass::File => Self {
                template: Template::AioFile,
                vos_env: Some(VosEnv::Aio),
                is_empty: empty_list,
                is_valid: valid_file,
                init: file_init,
            },
        }
    }
}

fn empty_list(cfg: &BdevConfig) -> Option<&'static str> {
    cfg.device_list.is_empty().then_some("bdev_list empty")
}

fn empty_number(cfg: &BdevConfig) -> Option<&'static str> {
    (cfg.device_count == 0).then_some("bdev_number == 0")
}

fn nil_validate(_: usize, _: &BdevConfig) -> Result<()> {
    Ok(())
}

fn valid_list(tier: usize, cfg: &BdevConfig) -> Result<()> {
    match cfg.device_list.iter().position(|d| d.is_empty()) {
        Some(index) => Err(Error::BdevEntryEmpty { tier, index }),
        None => Ok(()),
    }
}

fn valid_size(tier: usize, cfg: &BdevConfig) -> Result<()> {
    if cfg.file_size < 1 || backing_file_size(cfg.file_size).is_none() {
        return Err(Error::BdevBadFileSize { tier });
    }
    Ok(())
}

fn valid_file(tier: usize, cfg: &BdevConfig) -> Result<()> {
    valid_list(tier, cfg)?;
    valid_size(tier, cfg)
}

fn nil_init(_: usize, _: &BdevConfig) -> Result<()> {
    Ok(())
}

/// Create backing files for AIO file emulation, sized to whole blocks
fn file_init(tier: usize, cfg: &BdevConfig) -> Result<()> {
    let size = backing_file_size(cfg.file_size).ok_or(Error::BdevBadFileSize { tier })?;
    for path in &cfg.device_list {
        create_empty_file(Path::new(path), size)?;
    }
    Ok(())
}

/// Requested GB converted to bytes, rounded down to the block size
///
/// `None` when the byte count does not fit in an `i64`.
pub fn backing_file_size(gbytes: i64) -> Option<i64> {
    gbytes
        .checked_mul(GBYTE)
        .map(|bytes| (bytes / BLOCK_SIZE) * BLOCK_SIZE)
}

fn create_empty_file(path: &Path, size: i64) -> Result<()> {
    if !path.is_absolute() {
        return Err(Error::RelativeBackingFile(path.to_path_buf()));
    }

    // Existing backing files keep their data.
    match fs::metadata(path) {
        Ok(_) => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    debug!("allocating new file {} of size {} bytes", path.display(), size);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;

    allocate(&file, size)
}

#[cfg(target_os = "linux")]
fn allocate(file: &File, size: i64) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `file`, which outlives the call.
    let rc = unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, size as libc::off_t) };
    if rc == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENOSYS) | Some(libc::EOPNOTSUPP) => {
            debug!("warning: fallocate not supported, attempting truncate: {}", err);
            file.set_len(size as u64)?;
            Ok(())
        }
        _ => Err(err.into()),
    }
}

#[cfg(not(target_os = "linux"))]
fn allocate(file: &File, size: i64) -> Result<()> {
    file.set_len(size as u64)?;
    Ok(())
}

// =============================================================================
// Class Provider
// =============================================================================

/// Fields the engine consumes at start, derived while validating the tiers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivedBdevFields {
    /// `VOS_BDEV_CLASS` per validated tier
    pub vos_envs: Vec<Option<VosEnv>>,
    /// Config file the engine should load, if one is generated
    pub config_path: Option<PathBuf>,
    /// Number of tiers when a config file is generated
    pub tiers_num: usize,
}

impl DerivedBdevFields {
    /// Write the derived fields back into the tier list seen by the engine
    pub fn apply(&self, tier: &mut BdevTier) {
        for (cfg, env) in tier.tiers.iter_mut().zip(self.vos_envs.iter()) {
            cfg.vos_env = *env;
        }
        if let Some(path) = &self.config_path {
            tier.config_path = Some(path.clone());
            tier.tiers_num = self.tiers_num;
        }
    }
}

/// Validates tiers and renders the engine bdev config
pub struct ClassProvider {
    hostname: String,
    tiers: Vec<BdevConfig>,
    behaviours: Vec<ClassBehaviour>,
    config_path: Option<PathBuf>,
}

impl ClassProvider {
    /// Validate `tier` and prepare to render it into `cfg_dir`
    ///
    /// Validation runs tier by tier and stops at the first problem. An empty
    /// tier is not an error: nothing gets configured and no file is written.
    /// An invalid tier fails construction outright. The derived fields are
    /// returned alongside the provider and must be applied to the engine's
    /// tier config before the engine starts.
    pub fn new(
        cfg_dir: impl AsRef<Path>,
        tier: &BdevTier,
        hostname: impl Into<String>,
    ) -> Result<(Self, DerivedBdevFields)> {
        let mut provider = Self {
            hostname: hostname.into(),
            tiers: tier.tiers.clone(),
            behaviours: Vec::with_capacity(tier.tiers.len()),
            config_path: None,
        };
        let mut derived = DerivedBdevFields::default();

        if tier.tiers.is_empty() {
            debug!("spdk: no bdev tiers {}", MSG_BDEV_NONE);
            return Ok((provider, derived));
        }

        for (idx, cfg) in tier.tiers.iter().enumerate() {
            let behaviour = ClassBehaviour::for_config(cfg);

            if let Some(msg) = (behaviour.is_empty)(cfg) {
                debug!("spdk {}: {} {}", cfg.class, msg, MSG_BDEV_NONE);
                provider.behaviours.push(behaviour);
                return Ok((provider, derived));
            }

            if let Err(e) = (behaviour.is_valid)(idx, cfg) {
                debug!("spdk {}: {}", cfg.class, e);
                return Err(e);
            }

            derived.vos_envs.push(behaviour.vos_env);
            provider.behaviours.push(behaviour);
        }

        let path = cfg_dir.as_ref().join(CONFIG_FILE_NAME);
        debug!("output bdev conf file set to {}", path.display());
        provider.config_path = Some(path.clone());
        derived.config_path = Some(path);
        derived.tiers_num = tier.tiers.len();

        Ok((provider, derived))
    }

    /// Path of the config file to generate, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Render one tier
    fn render_tier(&self, idx: usize) -> Result<String> {
        let ctx = RenderContext {
            hostname: &self.hostname,
            tier_idx: idx,
            cfg: &self.tiers[idx],
        };
        let out = self.behaviours[idx].template.render(&ctx);
        if out.is_empty() {
            return Err(Error::EmptyBdevConfig { tier: idx });
        }
        Ok(out)
    }

    /// Initialise devices and write the config file for every tier
    pub fn gen_config_file(&self) -> Result<()> {
        let path = match &self.config_path {
            Some(p) => p,
            None => {
                debug!("skip bdev conf file generation as no path set");
                return Ok(());
            }
        };

        let mut file = File::create(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("spdk: failed to create NVMe config file {}: {}", path.display(), e),
            ))
        })?;

        let mut written = 0;
        for (idx, behaviour) in self.behaviours.iter().enumerate() {
            let cfg = &self.tiers[idx];
            (behaviour.init)(idx, cfg).map_err(|e| match e {
                Error::Io(io) => Error::Io(std::io::Error::new(
                    io.kind(),
                    format!("bdev device init: {}", io),
                )),
                other => other,
            })?;

            let conf = self.render_tier(idx)?;
            debug!("create {} with {:?} bdevs", path.display(), cfg.device_list);
            file.write_all(conf.as_bytes())?;
            written += conf.len();
        }

        if written == 0 {
            return Err(Error::EmptyBdevConfig {
                tier: self.tiers.len(),
            });
        }

        file.sync_all()?;
        Ok(())
    }
}

impl std::fmt::Debug for ClassProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassProvider")
            .field("hostname", &self.hostname)
            .field("tiers", &self.tiers.len())
            .field("config_path", &self.config_path)
            .finish()
    }
}
