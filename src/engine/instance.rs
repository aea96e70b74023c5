//! Engine Instance
//!
//! Lifecycle state machine of one supervised engine process. Status reports
//! from the process drive phase transitions; each transition into a phase
//! runs the callbacks registered for it, at most once per process
//! incarnation.

use super::config::EngineConfig;
use super::runner::{EngineRunner, EngineStatus, ExitStatus};
use super::superblock::{Superblock, SuperblockStore};
use crate::domain::ports::{JoinRequest, JoinResponse, Rank};
use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Phases
// =============================================================================

/// Lifecycle phase of an engine instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnginePhase {
    Unconfigured,
    AwaitingFormat,
    StorageReady,
    Ready,
    Exited,
}

impl EnginePhase {
    /// Whether a report of `next` is acceptable in this phase
    ///
    /// Re-reporting the current phase is accepted; the latches keep it from
    /// firing callbacks twice.
    pub fn can_transition_to(self, next: EnginePhase) -> bool {
        use EnginePhase::*;

        if self == next || next == Exited {
            return true;
        }
        matches!(
            (self, next),
            (Unconfigured, AwaitingFormat)
                | (Unconfigured, StorageReady)
                | (AwaitingFormat, StorageReady)
                | (StorageReady, Ready)
                | (StorageReady, AwaitingFormat)
                | (Ready, AwaitingFormat)
        )
    }

    /// Numeric encoding for metrics
    pub fn as_gauge(self) -> i64 {
        match self {
            EnginePhase::Unconfigured => 0,
            EnginePhase::AwaitingFormat => 1,
            EnginePhase::StorageReady => 2,
            EnginePhase::Ready => 3,
            EnginePhase::Exited => 4,
        }
    }
}

impl std::fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnginePhase::Unconfigured => write!(f, "unconfigured"),
            EnginePhase::AwaitingFormat => write!(f, "awaiting_format"),
            EnginePhase::StorageReady => write!(f, "storage_ready"),
            EnginePhase::Ready => write!(f, "ready"),
            EnginePhase::Exited => write!(f, "exited"),
        }
    }
}

impl EngineStatus {
    pub fn phase(&self) -> EnginePhase {
        match self {
            EngineStatus::AwaitingFormat => EnginePhase::AwaitingFormat,
            EngineStatus::StorageReady => EnginePhase::StorageReady,
            EngineStatus::Ready => EnginePhase::Ready,
            EngineStatus::Exited(_) => EnginePhase::Exited,
        }
    }
}

// =============================================================================
// Callbacks
// =============================================================================

/// What a phase callback gets to see
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub instance_idx: u32,
    pub incarnation: u64,
    pub phase: EnginePhase,
    pub rank: Option<Rank>,
    /// Set for [`EnginePhase::Exited`]
    pub exit: Option<ExitStatus>,
}

/// Callback run on entry into a phase
pub type PhaseCallback = Arc<dyn Fn(PhaseContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Function joining an instance to the system
pub type JoinFn = Arc<dyn Fn(JoinRequest) -> BoxFuture<'static, Result<JoinResponse>> + Send + Sync>;

#[derive(Default)]
struct PhaseCallbacks {
    await_format: Vec<PhaseCallback>,
    storage_ready: Vec<PhaseCallback>,
    ready: Vec<PhaseCallback>,
    exit: Vec<PhaseCallback>,
}

impl PhaseCallbacks {
    fn for_phase(&self, phase: EnginePhase) -> &[PhaseCallback] {
        match phase {
            EnginePhase::AwaitingFormat => &self.await_format,
            EnginePhase::StorageReady => &self.storage_ready,
            EnginePhase::Ready => &self.ready,
            EnginePhase::Exited => &self.exit,
            EnginePhase::Unconfigured => &[],
        }
    }
}

/// One-shot guards for a single process incarnation
#[derive(Debug, Default)]
struct PhaseLatches {
    await_format: AtomicBool,
    storage_ready: AtomicBool,
    ready: AtomicBool,
    exit: AtomicBool,
    joined: AtomicBool,
}

impl PhaseLatches {
    /// Returns true the first time `phase` is tripped
    fn trip(&self, phase: EnginePhase) -> bool {
        let latch = match phase {
            EnginePhase::AwaitingFormat => &self.await_format,
            EnginePhase::StorageReady => &self.storage_ready,
            EnginePhase::Ready => &self.ready,
            EnginePhase::Exited => &self.exit,
            EnginePhase::Unconfigured => return false,
        };
        !latch.swap(true, Ordering::AcqRel)
    }

    /// Returns true the first time the incarnation asks to join
    fn claim_join(&self) -> bool {
        !self.joined.swap(true, Ordering::AcqRel)
    }
}

// =============================================================================
// Restart Policy
// =============================================================================

/// Delay policy between engine restarts
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RestartPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_delay,
            current_interval: self.initial_delay,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

// =============================================================================
// Engine Instance
// =============================================================================

/// One supervised engine process and its persisted identity
pub struct EngineInstance {
    index: u32,
    hostname: String,
    system_name: String,
    config: RwLock<EngineConfig>,
    store: SuperblockStore,
    superblock: RwLock<Option<Superblock>>,
    phase: RwLock<EnginePhase>,
    incarnation: AtomicU64,
    latches: Mutex<Arc<PhaseLatches>>,
    callbacks: RwLock<PhaseCallbacks>,
    join_fn: RwLock<Option<JoinFn>>,
    formatted: Notify,
    restart_policy: RestartPolicy,
}

impl EngineInstance {
    /// Create an instance for `config`
    pub fn new(
        config: EngineConfig,
        hostname: impl Into<String>,
        system_name: impl Into<String>,
    ) -> Arc<Self> {
        Self::with_restart_policy(config, hostname, system_name, RestartPolicy::default())
    }

    pub fn with_restart_policy(
        config: EngineConfig,
        hostname: impl Into<String>,
        system_name: impl Into<String>,
        restart_policy: RestartPolicy,
    ) -> Arc<Self> {
        let store = SuperblockStore::new(config.index, &config.storage.scm.mount_point);
        Arc::new(Self {
            index: config.index,
            hostname: hostname.into(),
            system_name: system_name.into(),
            config: RwLock::new(config),
            store,
            superblock: RwLock::new(None),
            phase: RwLock::new(EnginePhase::Unconfigured),
            incarnation: AtomicU64::new(0),
            latches: Mutex::new(Arc::new(PhaseLatches::default())),
            callbacks: RwLock::new(PhaseCallbacks::default()),
            join_fn: RwLock::new(None),
            formatted: Notify::new(),
            restart_policy,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn phase(&self) -> EnginePhase {
        *self.phase.read()
    }

    /// Number of process incarnations started so far
    pub fn incarnation(&self) -> u64 {
        self.incarnation.load(Ordering::Acquire)
    }

    /// Snapshot of the engine configuration
    pub fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    /// Modify the engine configuration before the next start
    pub fn update_config(&self, f: impl FnOnce(&mut EngineConfig)) {
        f(&mut self.config.write());
    }

    // -------------------------------------------------------------------------
    // Callback registration
    // -------------------------------------------------------------------------

    fn register<F, Fut>(&self, phase: EnginePhase, f: F)
    where
        F: Fn(PhaseContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let cb: PhaseCallback = Arc::new(move |ctx: PhaseContext| f(ctx).boxed());
        let mut callbacks = self.callbacks.write();
        match phase {
            EnginePhase::AwaitingFormat => callbacks.await_format.push(cb),
            EnginePhase::StorageReady => callbacks.storage_ready.push(cb),
            EnginePhase::Ready => callbacks.ready.push(cb),
            EnginePhase::Exited => callbacks.exit.push(cb),
            EnginePhase::Unconfigured => {}
        }
    }

    /// Run `f` when the engine is ready
    pub fn on_ready<F, Fut>(&self, f: F)
    where
        F: Fn(PhaseContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(EnginePhase::Ready, f)
    }

    /// Run `f` when storage is ready; an error aborts the start
    pub fn on_storage_ready<F, Fut>(&self, f: F)
    where
        F: Fn(PhaseContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(EnginePhase::StorageReady, f)
    }

    /// Run `f` when the engine process exits
    pub fn on_instance_exit<F, Fut>(&self, f: F)
    where
        F: Fn(PhaseContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(EnginePhase::Exited, f)
    }

    /// Run `f` when storage needs formatting
    pub fn on_await_format<F, Fut>(&self, f: F)
    where
        F: Fn(PhaseContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(EnginePhase::AwaitingFormat, f)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Begin a new process incarnation with fresh latches
    pub fn start_incarnation(&self) -> u64 {
        *self.phase.write() = EnginePhase::Unconfigured;
        *self.latches.lock() = Arc::new(PhaseLatches::default());
        let incarnation = self.incarnation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("instance {}: starting incarnation {}", self.index, incarnation);
        incarnation
    }

    /// Apply a status report from the engine
    pub async fn report(&self, status: EngineStatus) -> Result<()> {
        let phase = status.phase();
        {
            let mut current = self.phase.write();
            if !current.can_transition_to(phase) {
                return Err(Error::InvalidTransition {
                    instance: self.index,
                    from: current.to_string(),
                    to: phase.to_string(),
                });
            }
            if *current != phase {
                debug!("instance {}: {} -> {}", self.index, *current, phase);
            }
            *current = phase;
        }

        let latches = self.latches.lock().clone();
        if !latches.trip(phase) {
            debug!(
                "instance {}: {} already handled in incarnation {}",
                self.index,
                phase,
                self.incarnation()
            );
            return Ok(());
        }

        let callbacks = self.callbacks.read().for_phase(phase).to_vec();
        let ctx = PhaseContext {
            instance_idx: self.index,
            incarnation: self.incarnation(),
            phase,
            rank: self.rank(),
            exit: match status {
                EngineStatus::Exited(exit) => Some(exit),
                _ => None,
            },
        };

        for cb in callbacks {
            if let Err(e) = cb(ctx.clone()).await {
                if phase == EnginePhase::StorageReady {
                    return Err(e);
                }
                error!("instance {}: {} callback failed: {}", self.index, phase, e);
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Superblock
    // -------------------------------------------------------------------------

    /// Snapshot of the in-memory superblock
    pub fn superblock(&self) -> Option<Superblock> {
        self.superblock.read().clone()
    }

    /// Whether storage has to be formatted before the engine can start
    pub fn needs_format(&self) -> bool {
        self.superblock.read().is_none()
    }

    /// Whether the instance holds a rank confirmed by a join
    pub fn has_valid_rank(&self) -> bool {
        self.superblock.read().as_ref().map_or(false, |sb| sb.valid_rank)
    }

    pub fn rank(&self) -> Option<Rank> {
        self.superblock.read().as_ref().and_then(|sb| sb.rank)
    }

    /// Record a rank in memory ahead of the join confirming it
    pub fn set_provisional_rank(&self, rank: Rank) {
        if let Some(sb) = self.superblock.write().as_mut() {
            sb.rank = Some(rank);
        }
    }

    /// Re-read the superblock from storage; returns whether one exists
    pub fn load_superblock(&self) -> Result<bool> {
        let sb = self.store.load()?;
        let exists = sb.is_some();
        *self.superblock.write() = sb;
        Ok(exists)
    }

    /// Write a fresh superblock and release a start waiting on format
    pub fn format(&self) -> Result<()> {
        if self.store.load()?.is_some() {
            info!("instance {}: storage already formatted", self.index);
            return Ok(());
        }

        let sb = Superblock::new(&self.system_name);
        self.store.store(&sb)?;
        info!("instance {}: formatted, engine uuid {}", self.index, sb.uuid);
        *self.superblock.write() = Some(sb);
        self.formatted.notify_one();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // System join
    // -------------------------------------------------------------------------

    /// Install the function used to join the system
    pub fn set_join_fn(&self, join: JoinFn) {
        *self.join_fn.write() = Some(join);
    }

    /// Join the system and persist the granted rank
    pub async fn join_system(&self) -> Result<JoinResponse> {
        let join = self
            .join_fn
            .read()
            .clone()
            .ok_or_else(|| Error::Join(format!("instance {}: no join function", self.index)))?;
        let sb = self.superblock().ok_or_else(|| Error::Superblock {
            instance: self.index,
            reason: "join attempted before format".into(),
        })?;

        let req = JoinRequest {
            uuid: sb.uuid,
            rank: if sb.valid_rank { sb.rank } else { None },
            hostname: self.hostname.clone(),
            instance_idx: self.index,
        };
        let resp = join(req).await?;

        let updated = {
            let mut guard = self.superblock.write();
            guard.as_mut().map(|sb| {
                sb.rank = Some(resp.rank);
                sb.valid_rank = true;
                sb.clone()
            })
        };
        if let Some(sb) = updated {
            self.store.store(&sb)?;
        }
        info!("instance {}: joined as rank {}", self.index, resp.rank);

        Ok(resp)
    }

    // -------------------------------------------------------------------------
    // Supervision
    // -------------------------------------------------------------------------

    /// Wait for formatted storage and report it ready
    ///
    /// Returns false if shutdown was requested while waiting.
    async fn prepare_storage(&self, shutdown: &CancellationToken) -> Result<bool> {
        if !self.load_superblock()? {
            self.report(EngineStatus::AwaitingFormat).await?;
            info!("instance {}: waiting for storage format", self.index);
            tokio::select! {
                _ = self.formatted.notified() => {}
                _ = shutdown.cancelled() => return Ok(false),
            }
        }
        self.report(EngineStatus::StorageReady).await?;
        Ok(true)
    }

    /// Supervise engine incarnations until shutdown
    ///
    /// Errors are returned only for faults fatal to the node start: an
    /// unreadable superblock or a failing storage-ready callback.
    pub async fn run(
        self: Arc<Self>,
        runner: Arc<dyn EngineRunner>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut backoff = self.restart_policy.backoff();

        while !shutdown.is_cancelled() {
            self.start_incarnation();
            if !self.prepare_storage(&shutdown).await? {
                break;
            }

            let mut became_ready = false;
            match runner.start(&self.config(), shutdown.child_token()).await {
                Ok(mut running) => {
                    while let Some(status) = running.statuses.recv().await {
                        let first_ready = status == EngineStatus::Ready
                            && self.latches.lock().clone().claim_join();
                        if first_ready {
                            became_ready = true;
                            if let Err(e) = self.join_system().await {
                                error!("instance {}: join failed: {}", self.index, e);
                            }
                        }
                        match self.report(status).await {
                            Ok(()) => {}
                            Err(e @ Error::InvalidTransition { .. }) => warn!("{}", e),
                            Err(e) => return Err(e),
                        }
                    }
                    if self.phase() != EnginePhase::Exited {
                        let exit = ExitStatus::new(None, "status channel closed");
                        self.report(EngineStatus::Exited(exit)).await?;
                    }
                }
                Err(e) => {
                    error!("instance {}: {}", self.index, e);
                    self.report(EngineStatus::Exited(ExitStatus::new(None, e.to_string())))
                        .await?;
                }
            }

            if shutdown.is_cancelled() {
                break;
            }
            if became_ready {
                backoff.reset();
            }
            let delay = backoff.next_backoff().unwrap_or(self.restart_policy.max_delay);
            warn!("instance {}: restarting engine in {:?}", self.index, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        info!("instance {}: supervision stopped", self.index);
        Ok(())
    }
}

impl std::fmt::Debug for EngineInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineInstance")
            .field("index", &self.index)
            .field("phase", &self.phase())
            .field("incarnation", &self.incarnation())
            .field("rank", &self.rank())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::runner::RunningEngine;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn instance(tmp: &TempDir, idx: u32) -> Arc<EngineInstance> {
        let mut cfg = EngineConfig::new(idx);
        cfg.storage.scm.mount_point = tmp.path().to_path_buf();
        EngineInstance::with_restart_policy(
            cfg,
            "host-1",
            "daos_server",
            RestartPolicy {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
        )
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[test]
    fn test_transitions() {
        use EnginePhase::*;
        assert!(Unconfigured.can_transition_to(AwaitingFormat));
        assert!(Unconfigured.can_transition_to(StorageReady));
        assert!(StorageReady.can_transition_to(StorageReady));
        assert!(Ready.can_transition_to(AwaitingFormat));
        assert!(Ready.can_transition_to(Exited));
        assert!(!Unconfigured.can_transition_to(Ready));
        assert!(!Exited.can_transition_to(Ready));
        assert!(!AwaitingFormat.can_transition_to(Ready));
    }

    #[tokio::test]
    async fn test_storage_ready_fires_once_per_incarnation() {
        let tmp = TempDir::new().unwrap();
        let inst = instance(&tmp, 0);
        let fired = counter();
        let f = fired.clone();
        inst.on_storage_ready(move |_| {
            let f = f.clone();
            async move {
                f.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        inst.start_incarnation();
        for _ in 0..3 {
            inst.report(EngineStatus::StorageReady).await.unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        inst.report(EngineStatus::Exited(ExitStatus::new(Some(1), "crash")))
            .await
            .unwrap();
        inst.start_incarnation();
        inst.report(EngineStatus::StorageReady).await.unwrap();
        inst.report(EngineStatus::StorageReady).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(inst.incarnation(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_reports() {
        let tmp = TempDir::new().unwrap();
        let inst = instance(&tmp, 0);
        let fired = counter();
        let f = fired.clone();
        inst.on_storage_ready(move |_| {
            let f = f.clone();
            async move {
                f.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        inst.start_incarnation();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let inst = inst.clone();
            handles.push(tokio::spawn(async move {
                inst.report(EngineStatus::StorageReady).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_callbacks_run_in_order_and_errors_do_not_stop_siblings() {
        let tmp = TempDir::new().unwrap();
        let inst = instance(&tmp, 0);
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, fail) in [("first", true), ("second", false)] {
            let order = order.clone();
            inst.on_ready(move |_| {
                let order = order.clone();
                async move {
                    order.lock().push(name);
                    if fail {
                        Err(Error::Internal("boom".into()))
                    } else {
                        Ok(())
                    }
                }
            });
        }

        inst.start_incarnation();
        inst.report(EngineStatus::StorageReady).await.unwrap();
        inst.report(EngineStatus::Ready).await.unwrap();
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_storage_ready_error_is_returned() {
        let tmp = TempDir::new().unwrap();
        let inst = instance(&tmp, 0);
        inst.on_storage_ready(|_| async { Err(Error::SystemDb("raft init".into())) });

        inst.start_incarnation();
        let res = inst.report(EngineStatus::StorageReady).await;
        assert_matches!(res, Err(Error::SystemDb(_)));
    }

    #[tokio::test]
    async fn test_exit_context_carries_status() {
        let tmp = TempDir::new().unwrap();
        let inst = instance(&tmp, 3);
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        inst.on_instance_exit(move |ctx| {
            let s = s.clone();
            async move {
                *s.lock() = Some(ctx);
                Ok(())
            }
        });

        inst.start_incarnation();
        inst.report(EngineStatus::Exited(ExitStatus::new(Some(137), "killed")))
            .await
            .unwrap();

        let ctx = seen.lock().clone().unwrap();
        assert_eq!(ctx.instance_idx, 3);
        assert_eq!(ctx.phase, EnginePhase::Exited);
        assert_eq!(ctx.exit.unwrap().code, Some(137));
    }

    #[tokio::test]
    async fn test_invalid_transition() {
        let tmp = TempDir::new().unwrap();
        let inst = instance(&tmp, 0);
        inst.start_incarnation();
        assert_matches!(
            inst.report(EngineStatus::Ready).await,
            Err(Error::InvalidTransition { instance: 0, .. })
        );
    }

    #[tokio::test]
    async fn test_format_and_join_persist_rank() {
        let tmp = TempDir::new().unwrap();
        let inst = instance(&tmp, 0);
        assert!(!inst.load_superblock().unwrap());
        assert!(inst.needs_format());

        inst.format().unwrap();
        assert!(!inst.needs_format());
        assert!(!inst.has_valid_rank());

        inst.set_join_fn(Arc::new(|req: JoinRequest| {
            async move {
                assert_eq!(req.rank, None);
                Ok::<_, Error>(JoinResponse { rank: Rank(9) })
            }
            .boxed()
        }));
        let resp = inst.join_system().await.unwrap();
        assert_eq!(resp.rank, Rank(9));
        assert!(inst.has_valid_rank());

        // Identity survives a reload from disk.
        let reloaded = instance(&tmp, 0);
        assert!(reloaded.load_superblock().unwrap());
        assert_eq!(reloaded.rank(), Some(Rank(9)));
        assert!(reloaded.has_valid_rank());
    }

    #[tokio::test]
    async fn test_join_without_join_fn() {
        let tmp = TempDir::new().unwrap();
        let inst = instance(&tmp, 0);
        inst.format().unwrap();
        assert_matches!(inst.join_system().await, Err(Error::Join(_)));
    }

    /// Runner emitting Ready then Exited for every start
    struct ScriptedRunner {
        starts: AtomicUsize,
    }

    #[async_trait]
    impl EngineRunner for ScriptedRunner {
        async fn start(&self, _cfg: &EngineConfig, _shutdown: CancellationToken) -> Result<RunningEngine> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(4);
            tx.send(EngineStatus::Ready).await.unwrap();
            tx.send(EngineStatus::Exited(ExitStatus::new(Some(1), "crash")))
                .await
                .unwrap();
            Ok(RunningEngine { pid: None, statuses: rx })
        }
    }

    #[tokio::test]
    async fn test_run_waits_for_format_then_restarts() {
        let tmp = TempDir::new().unwrap();
        let inst = instance(&tmp, 0);
        inst.set_join_fn(Arc::new(|_: JoinRequest| {
            async { Ok::<_, Error>(JoinResponse { rank: Rank(1) }) }.boxed()
        }));

        let awaiting = counter();
        let a = awaiting.clone();
        inst.on_await_format(move |_| {
            let a = a.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let ready = counter();
        let r = ready.clone();
        inst.on_ready(move |_| {
            let r = r.clone();
            async move {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let runner = Arc::new(ScriptedRunner {
            starts: AtomicUsize::new(0),
        });
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(inst.clone().run(runner.clone(), shutdown.clone()));

        while awaiting.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(inst.phase(), EnginePhase::AwaitingFormat);
        inst.format().unwrap();

        while ready.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert!(runner.starts.load(Ordering::SeqCst) >= 2);
        assert!(inst.incarnation() >= 2);
        assert_eq!(awaiting.load(Ordering::SeqCst), 1);
        assert_eq!(inst.rank(), Some(Rank(1)));
    }

    /// Runner retransmitting Ready before the engine exits
    struct RepeatedReadyRunner;

    #[async_trait]
    impl EngineRunner for RepeatedReadyRunner {
        async fn start(&self, _cfg: &EngineConfig, _shutdown: CancellationToken) -> Result<RunningEngine> {
            let (tx, rx) = mpsc::channel(4);
            for _ in 0..3 {
                tx.send(EngineStatus::Ready).await.unwrap();
            }
            tx.send(EngineStatus::Exited(ExitStatus::new(Some(0), "done")))
                .await
                .unwrap();
            Ok(RunningEngine { pid: None, statuses: rx })
        }
    }

    #[tokio::test]
    async fn test_duplicate_ready_joins_once() {
        let tmp = TempDir::new().unwrap();
        let inst = instance(&tmp, 0);
        inst.format().unwrap();

        let joins = counter();
        let j = joins.clone();
        inst.set_join_fn(Arc::new(move |_: JoinRequest| {
            j.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Error>(JoinResponse { rank: Rank(2) }) }.boxed()
        }));

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        inst.on_instance_exit(move |_| {
            token.cancel();
            async { Ok(()) }
        });

        inst.clone()
            .run(Arc::new(RepeatedReadyRunner), shutdown)
            .await
            .unwrap();

        assert_eq!(joins.load(Ordering::SeqCst), 1);
        assert_eq!(inst.incarnation(), 1);
        assert_eq!(inst.rank(), Some(Rank(2)));
    }

    #[tokio::test]
    async fn test_run_fails_when_storage_ready_callback_fails() {
        let tmp = TempDir::new().unwrap();
        let inst = instance(&tmp, 0);
        inst.format().unwrap();
        inst.on_storage_ready(|_| async { Err(Error::SystemDb("no quorum".into())) });

        let runner = Arc::new(ScriptedRunner {
            starts: AtomicUsize::new(0),
        });
        let res = inst.clone().run(runner.clone(), CancellationToken::new()).await;
        assert_matches!(res, Err(Error::SystemDb(_)));
        assert_eq!(runner.starts.load(Ordering::SeqCst), 0);
    }
}
