//! Engine Process Runner
//!
//! Starts the storage engine binary and relays its state as a stream of
//! status reports.

use super::config::EngineConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STATUS_CHANNEL_DEPTH: usize = 16;

/// How an engine process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    /// Process exit code, `None` when killed by a signal
    pub code: Option<i32>,
    pub reason: String,
}

impl ExitStatus {
    pub fn new(code: Option<i32>, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (exit code {})", self.reason, code),
            None => write!(f, "{}", self.reason),
        }
    }
}

/// State reported by (or on behalf of) a running engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    /// Storage must be formatted before the engine can proceed
    AwaitingFormat,
    /// Storage is mounted and the superblock is readable
    StorageReady,
    /// Engine is up and serving
    Ready,
    /// Engine process is gone
    Exited(ExitStatus),
}

/// Handle on a started engine process
#[derive(Debug)]
pub struct RunningEngine {
    pub pid: Option<u32>,
    /// Status reports; the last report is always [`EngineStatus::Exited`]
    pub statuses: mpsc::Receiver<EngineStatus>,
}

/// Port for starting engine processes
#[async_trait]
pub trait EngineRunner: Send + Sync {
    /// Start an engine for `cfg`; cancelling `shutdown` stops it
    async fn start(&self, cfg: &EngineConfig, shutdown: CancellationToken) -> Result<RunningEngine>;
}

// =============================================================================
// Process Runner
// =============================================================================

/// Runs the engine binary as a child process
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    binary: PathBuf,
}

impl ProcessRunner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Command line arguments for `cfg`
    pub fn args(cfg: &EngineConfig) -> Vec<String> {
        let mut args = vec![
            "-I".to_string(),
            cfg.index.to_string(),
            "-t".to_string(),
            cfg.targets.to_string(),
            "-s".to_string(),
            cfg.storage.scm.mount_point.display().to_string(),
        ];
        if let Some(path) = &cfg.storage.bdev.config_path {
            args.push("-n".to_string());
            args.push(path.display().to_string());
        }
        args
    }
}

#[async_trait]
impl EngineRunner for ProcessRunner {
    async fn start(&self, cfg: &EngineConfig, shutdown: CancellationToken) -> Result<RunningEngine> {
        let instance = cfg.index;
        let mut child = Command::new(&self.binary)
            .args(Self::args(cfg))
            .envs(cfg.env_pairs())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::EngineStart {
                instance,
                reason: format!("{}: {}", self.binary.display(), e),
            })?;

        let pid = child.id();
        info!("instance {} engine started (pid {:?})", instance, pid);

        let (tx, rx) = mpsc::channel(STATUS_CHANNEL_DEPTH);

        tokio::spawn(async move {
            // Readiness over the engine's notify channel is not wired here;
            // a successful spawn is treated as ready.
            let _ = tx.send(EngineStatus::Ready).await;

            let exit = tokio::select! {
                res = child.wait() => match res {
                    Ok(status) => ExitStatus::new(status.code(), format!("engine exited: {}", status)),
                    Err(e) => ExitStatus::new(None, format!("wait failed: {}", e)),
                },
                _ = shutdown.cancelled() => {
                    debug!("instance {} stopping engine on shutdown", instance);
                    if let Err(e) = child.kill().await {
                        warn!("instance {} failed to kill engine: {}", instance, e);
                    }
                    ExitStatus::new(None, "stopped on shutdown")
                }
            };

            let _ = tx.send(EngineStatus::Exited(exit)).await;
        });

        Ok(RunningEngine { pid, statuses: rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::config::{BdevClass, BdevConfig, BdevTier};
    use assert_matches::assert_matches;

    #[test]
    fn test_args() {
        let mut cfg = EngineConfig::new(1);
        cfg.targets = 8;
        cfg.storage.scm.mount_point = "/mnt/daos1".into();
        assert_eq!(ProcessRunner::args(&cfg), vec!["-I", "1", "-t", "8", "-s", "/mnt/daos1"]);

        cfg.storage.bdev = BdevTier::new(vec![BdevConfig::new(BdevClass::Nvme)]);
        cfg.storage.bdev.config_path = Some("/mnt/daos1/daos_nvme.conf".into());
        let args = ProcessRunner::args(&cfg);
        assert_eq!(&args[6..], &["-n", "/mnt/daos1/daos_nvme.conf"]);
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let runner = ProcessRunner::new("/nonexistent/daos_engine");
        let res = runner.start(&EngineConfig::new(0), CancellationToken::new()).await;
        assert_matches!(res, Err(Error::EngineStart { instance: 0, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exit_reported() {
        let runner = ProcessRunner::new("/bin/true");
        let mut running = runner
            .start(&EngineConfig::new(0), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(running.statuses.recv().await, Some(EngineStatus::Ready));
        assert_matches!(
            running.statuses.recv().await,
            Some(EngineStatus::Exited(ExitStatus { code: Some(0), .. }))
        );
    }
}
