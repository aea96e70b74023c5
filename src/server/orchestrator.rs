//! Server Orchestrator
//!
//! Brings a storage node up: prepares host resources, generates engine bdev
//! configs, wires lifecycle callbacks into the engine instances, routes
//! events by leadership role, and supervises the engines until shutdown.

use super::bdev_prep::prep_bdev_storage;
use super::config::ServerConfig;
use super::subscriptions::{SubscriptionProfile, SubscriptionTargets};
use super::telemetry::{start_exporter, EngineMetrics};
use crate::domain::ports::{
    EventForwarderRef, FabricResolver, FabricResolverRef, GroupUpdaterRef, JoinRequest, Leadership,
    MembershipRef, Rank, SystemDatabaseRef, SystemJoinerRef,
};
use crate::engine::{
    EngineConfig, EngineHarness, EngineInstance, EngineRunner, JoinFn, PhaseContext, StartupBarrier,
};
use crate::error::{Error, Result};
use crate::events::{Event, PubSub};
use crate::storage::bdev::{BdevPreparer, ClassProvider};
use crate::storage::host::{HostProbe, TargetUser};
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Callback run once every engine has started
pub type EnginesStartedFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<()>> + Send>;

// =============================================================================
// Dependencies
// =============================================================================

/// External collaborators of the orchestrator
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub sysdb: SystemDatabaseRef,
    pub membership: MembershipRef,
    pub joiner: SystemJoinerRef,
    pub group_updater: GroupUpdaterRef,
    pub forwarder: EventForwarderRef,
    pub fabric: FabricResolverRef,
    pub preparer: Arc<dyn BdevPreparer>,
    pub runner: Arc<dyn EngineRunner>,
    pub host: HostProbe,
    pub user: TargetUser,
}

// =============================================================================
// Free helpers
// =============================================================================

/// Point libfabric at the right device for verbs providers
///
/// Mercury addresses verbs by interface (`ib0`) while libfabric wants the
/// device (`mlx5_0`); `OFI_DOMAIN` carries the latter.
pub async fn update_fabric_env(cfg: &mut EngineConfig, fabric: &dyn FabricResolver) -> Result<()> {
    if !cfg.fabric.provider.starts_with("ofi+verbs") || cfg.has_env_var("OFI_DOMAIN") {
        return Ok(());
    }

    let interface = cfg.fabric.interface.clone();
    let alias = fabric
        .device_alias(&interface)
        .await
        .map_err(|e| match e {
            e @ Error::FabricAlias { .. } => e,
            other => Error::FabricAlias {
                interface: interface.clone(),
                reason: other.to_string(),
            },
        })?;
    debug!("instance {}: OFI_DOMAIN={} for {}", cfg.index, alias, interface);
    cfg.env_vars.push(format!("OFI_DOMAIN={}", alias));
    Ok(())
}

/// Join function delegating straight to the system joiner
pub fn joiner_fn(joiner: SystemJoinerRef) -> JoinFn {
    Arc::new(move |req: JoinRequest| {
        let joiner = joiner.clone();
        async move { joiner.join(req).await }.boxed()
    })
}

/// Starts the system database at most once
///
/// Concurrent callers wait for the first attempt and share its outcome; a
/// failed start is not retried.
pub struct SystemDbStarter {
    db: SystemDatabaseRef,
    outcome: OnceCell<std::result::Result<(), String>>,
}

impl SystemDbStarter {
    pub fn new(db: SystemDatabaseRef) -> Arc<Self> {
        Arc::new(Self {
            db,
            outcome: OnceCell::new(),
        })
    }

    pub fn db(&self) -> &SystemDatabaseRef {
        &self.db
    }

    pub async fn start(&self) -> Result<()> {
        let outcome = self
            .outcome
            .get_or_init(|| async {
                if self.db.is_started() {
                    return Ok(());
                }
                self.db.start().await.map_err(|e| match e {
                    Error::SystemDb(msg) => msg,
                    other => other.to_string(),
                })
            })
            .await;
        outcome.clone().map_err(Error::SystemDb)
    }
}

/// Wire the system database into instance 0
///
/// A replica starts the database once instance 0's storage is ready. The
/// bootstrap replica also reserves rank 0 for instance 0 while it has no
/// confirmed rank.
pub fn configure_first_engine(instance: &Arc<EngineInstance>, starter: Arc<SystemDbStarter>, join: JoinFn) {
    let sysdb = starter.db().clone();
    if !sysdb.is_replica() {
        return;
    }

    instance.on_storage_ready(move |_| {
        let starter = starter.clone();
        async move { starter.start().await }
    });

    if !sysdb.is_bootstrap() {
        return;
    }

    let weak = Arc::downgrade(instance);
    instance.set_join_fn(Arc::new(move |mut req: JoinRequest| {
        if let Some(inst) = weak.upgrade() {
            if !inst.has_valid_rank() {
                debug!("marking bootstrap instance as rank 0");
                req.rank = Some(Rank::ZERO);
                inst.set_provisional_rank(Rank::ZERO);
            }
        }
        join(req)
    }));
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Node-local control plane
pub struct Orchestrator {
    cfg: ServerConfig,
    hostname: String,
    deps: OrchestratorDeps,
    sysdb_starter: Arc<SystemDbStarter>,
    harness: Arc<EngineHarness>,
    bus: Arc<PubSub>,
    targets: SubscriptionTargets,
    profile: Mutex<SubscriptionProfile>,
    all_started: Arc<StartupBarrier>,
    started_callbacks: Mutex<Vec<EnginesStartedFn>>,
}

impl Orchestrator {
    /// Create the orchestrator and one engine instance per configured engine
    pub fn new(cfg: ServerConfig, deps: OrchestratorDeps) -> Result<Arc<Self>> {
        cfg.validate()?;

        let hostname = deps.host.hostname();
        let harness = Arc::new(EngineHarness::new());
        for engine in &cfg.engines {
            harness.add_instance(EngineInstance::new(engine.clone(), hostname.clone(), cfg.name.clone()))?;
        }

        let bus = PubSub::new();
        let targets = SubscriptionTargets::new(
            deps.forwarder.clone(),
            deps.membership.clone(),
            deps.sysdb.clone(),
            deps.group_updater.clone(),
        );
        bus.replace(targets.table(SubscriptionProfile::Initial));

        Ok(Arc::new(Self {
            all_started: Arc::new(StartupBarrier::new(cfg.engines.len())),
            cfg,
            hostname,
            sysdb_starter: SystemDbStarter::new(deps.sysdb.clone()),
            deps,
            harness,
            bus,
            targets,
            profile: Mutex::new(SubscriptionProfile::Initial),
            started_callbacks: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn harness(&self) -> &Arc<EngineHarness> {
        &self.harness
    }

    pub fn bus(&self) -> &Arc<PubSub> {
        &self.bus
    }

    pub fn profile(&self) -> SubscriptionProfile {
        *self.profile.lock()
    }

    /// Register a callback for when every engine has started
    pub fn on_engines_started(&self, f: EnginesStartedFn) {
        self.started_callbacks.lock().push(f);
    }

    /// Format storage of every instance that has none
    pub fn format_all(&self) -> Result<()> {
        for inst in self.harness.instances() {
            inst.format()?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Startup steps
    // -------------------------------------------------------------------------

    /// Publish lifecycle events and count first starts
    pub fn register_engine_callbacks(&self, instance: &Arc<EngineInstance>) {
        let bus = self.bus.clone();
        let hostname = self.hostname.clone();
        instance.on_instance_exit(move |ctx: PhaseContext| {
            let reason = ctx.exit.map(|e| e.to_string()).unwrap_or_default();
            bus.publish(Event::engine_died(&hostname, ctx.instance_idx, ctx.rank, &reason));
            future::ready(Ok(()))
        });

        let bus = self.bus.clone();
        let hostname = self.hostname.clone();
        instance.on_await_format(move |ctx: PhaseContext| {
            bus.publish(Event::format_required(&hostname, ctx.instance_idx));
            future::ready(Ok(()))
        });

        // Shared memory outlives engine restarts, so only the first start counts.
        let barrier = self.all_started.clone();
        let counted = AtomicBool::new(false);
        instance.on_ready(move |_| {
            if !counted.swap(true, Ordering::AcqRel) {
                barrier.arrive();
            }
            future::ready(Ok(()))
        });
    }

    /// Start the Prometheus exporter once every engine is up
    pub fn register_telemetry_callbacks(&self) {
        let port = self.cfg.telemetry_port;
        if port == 0 {
            return;
        }

        let instances = self.harness.instances();
        let bus = self.bus.clone();
        self.on_engines_started(Box::new(move |shutdown: CancellationToken| {
            async move {
                debug!("starting Prometheus exporter");
                let metrics = Arc::new(EngineMetrics::new(instances, bus)?);
                start_exporter(SocketAddr::from(([0, 0, 0, 0], port)), metrics, shutdown)?;
                Ok::<_, Error>(())
            }
            .boxed()
        }));
    }

    /// Add fabric environment to every engine
    pub async fn update_fabric_envs(&self) -> Result<()> {
        for inst in self.harness.instances() {
            let mut cfg = inst.config();
            update_fabric_env(&mut cfg, self.deps.fabric.as_ref()).await?;
            inst.update_config(|c| *c = cfg);
        }
        Ok(())
    }

    /// Validate bdev tiers and write each engine's bdev config
    pub fn gen_bdev_configs(&self) -> Result<()> {
        for inst in self.harness.instances() {
            let cfg = inst.config();
            let (provider, derived) =
                ClassProvider::new(&cfg.storage.scm.mount_point, &cfg.storage.bdev, self.hostname.as_str())?;
            inst.update_config(|c| derived.apply(&mut c.storage.bdev));
            provider.gen_config_file()?;
        }
        Ok(())
    }

    /// Swap the event subscriptions to `profile`
    pub fn switch_profile(&self, profile: SubscriptionProfile) {
        let mut current = self.profile.lock();
        info!("event subscriptions: {} -> {}", *current, profile);
        self.bus.replace(self.targets.table(profile));
        *current = profile;
    }

    /// React to a leadership change of the system database
    pub async fn handle_leadership(&self, leadership: Leadership) -> Result<()> {
        match leadership {
            Leadership::Leader => {
                self.sysdb_starter.start().await?;
                self.switch_profile(SubscriptionProfile::Leader);
            }
            Leadership::Follower => self.switch_profile(SubscriptionProfile::Follower),
            Leadership::Unknown => {}
        }
        Ok(())
    }

    fn spawn_leadership_watch(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut rx = self.deps.sysdb.leadership();
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            debug!("leadership channel closed");
                            break;
                        }
                        let leadership = *rx.borrow_and_update();
                        if let Err(e) = this.handle_leadership(leadership).await {
                            error!("leadership change to {:?} failed: {}", leadership, e);
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    fn spawn_engines_started(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = this.all_started.wait() => {}
                _ = shutdown.cancelled() => return,
            }
            info!("all {} engines started", this.harness.len());

            let callbacks = std::mem::take(&mut *this.started_callbacks.lock());
            for cb in callbacks {
                if let Err(e) = cb(shutdown.clone()).await {
                    error!("engines started callback failed: {}", e);
                }
            }
        })
    }

    /// Run the node until `shutdown` is cancelled or an engine fails fatally
    pub async fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!("starting control plane on {}", self.hostname);

        let replicas = self.cfg.replica_addrs()?;
        debug!("system database replicas: {:?}", replicas);
        if let Some(dir) = self.cfg.raft_dir() {
            debug!("raft directory: {}", dir.display());
        }

        let iommu = self.deps.host.iommu_detected();
        let host = self.deps.host.clone();
        prep_bdev_storage(
            &self.cfg,
            self.deps.preparer.as_ref(),
            &self.deps.user,
            iommu,
            || host.hugepage_info(),
        )?;

        self.update_fabric_envs().await?;
        self.gen_bdev_configs()?;

        let default_join = joiner_fn(self.deps.joiner.clone());
        for inst in self.harness.instances() {
            inst.set_join_fn(default_join.clone());
            self.register_engine_callbacks(&inst);
        }
        if let Some(first) = self.harness.instance(0) {
            configure_first_engine(&first, self.sysdb_starter.clone(), default_join);
        }
        self.register_telemetry_callbacks();

        let watch = self.spawn_leadership_watch(shutdown.clone());
        let started = self.spawn_engines_started(shutdown.clone());

        let res = self
            .harness
            .start(self.deps.runner.clone(), shutdown.clone())
            .await;

        shutdown.cancel();
        let _ = watch.await;
        let _ = started.await;
        if self.deps.sysdb.is_started() {
            if let Err(e) = self.deps.sysdb.stop().await {
                warn!("failed to stop system database: {}", e);
            }
        }

        info!("control plane stopped");
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{JoinResponse, SystemDatabase, SystemJoiner};
    use crate::engine::{EngineStatus, ExitStatus, RunningEngine};
    use crate::events::{handler_fn, EventFilter, EventId};
    use crate::storage::bdev::{PrepareRequest, PrepareResponse};
    use crate::storage::config::{BdevClass, BdevConfig, BdevTier, VosEnv};
    use crate::storage::host::HostProbeConfig;
    use crate::system::local::{LocalGroupUpdater, LocalMembership, LocalSystemDatabase, LoggingForwarder};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct NoopPreparer;

    impl BdevPreparer for NoopPreparer {
        fn prepare(&self, _req: &PrepareRequest) -> Result<PrepareResponse> {
            Ok(PrepareResponse::default())
        }
    }

    struct StaticFabric(Result<String>);

    #[async_trait]
    impl FabricResolver for StaticFabric {
        async fn device_alias(&self, interface: &str) -> Result<String> {
            match &self.0 {
                Ok(alias) => Ok(alias.clone()),
                Err(_) => Err(Error::FabricAlias {
                    interface: interface.to_string(),
                    reason: "no such device".into(),
                }),
            }
        }
    }

    /// Runner whose engines become ready and stay up until shutdown
    struct IdleRunner;

    #[async_trait]
    impl EngineRunner for IdleRunner {
        async fn start(&self, _cfg: &EngineConfig, shutdown: CancellationToken) -> Result<RunningEngine> {
            let (tx, rx) = mpsc::channel(2);
            tokio::spawn(async move {
                let _ = tx.send(EngineStatus::Ready).await;
                shutdown.cancelled().await;
                let _ = tx.send(EngineStatus::Exited(ExitStatus::new(None, "stopped"))).await;
            });
            Ok(RunningEngine { pid: None, statuses: rx })
        }
    }

    /// Joiner recording requests and granting a fixed rank
    struct RecordingJoiner {
        requests: Mutex<Vec<JoinRequest>>,
        grant: Rank,
    }

    #[async_trait]
    impl SystemJoiner for RecordingJoiner {
        async fn join(&self, req: JoinRequest) -> Result<JoinResponse> {
            let rank = req.rank.unwrap_or(self.grant);
            self.requests.lock().push(req);
            Ok(JoinResponse { rank })
        }
    }

    fn host_probe(tmp: &Path) -> HostProbe {
        let procfs = tmp.join("proc");
        std::fs::create_dir_all(&procfs).unwrap();
        std::fs::write(
            procfs.join("meminfo"),
            "HugePages_Total: 1024\nHugePages_Free: 1024\nHugepagesize: 2048 kB\n",
        )
        .unwrap();
        std::fs::write(tmp.join("hostname"), "node-1\n").unwrap();
        HostProbe::new(HostProbeConfig {
            sysfs_path: tmp.join("sys"),
            procfs_path: procfs,
            hostname_path: tmp.join("hostname"),
        })
    }

    fn server_config(tmp: &Path, engines: u32) -> ServerConfig {
        let mut cfg = ServerConfig {
            access_points: vec!["127.0.0.1".into()],
            ..Default::default()
        };
        for idx in 0..engines {
            let mut engine = EngineConfig::new(idx);
            engine.storage.scm.mount_point = tmp.join(format!("daos{}", idx));
            std::fs::create_dir_all(&engine.storage.scm.mount_point).unwrap();
            cfg.engines.push(engine);
        }
        cfg
    }

    fn deps(tmp: &Path, sysdb: Arc<LocalSystemDatabase>) -> OrchestratorDeps {
        let membership = Arc::new(LocalMembership::new());
        OrchestratorDeps {
            sysdb,
            membership: membership.clone(),
            joiner: membership,
            group_updater: Arc::new(LocalGroupUpdater::new()),
            forwarder: Arc::new(LoggingForwarder::new()),
            fabric: Arc::new(StaticFabric(Ok("mlx5_0".into()))),
            preparer: Arc::new(NoopPreparer),
            runner: Arc::new(IdleRunner),
            host: host_probe(tmp),
            user: TargetUser::new("root", 0),
        }
    }

    fn instance(tmp: &TempDir) -> Arc<EngineInstance> {
        let mut cfg = EngineConfig::new(0);
        cfg.storage.scm.mount_point = tmp.path().to_path_buf();
        let inst = EngineInstance::new(cfg, "node-1", "daos_server");
        inst.format().unwrap();
        inst
    }

    fn recording_joiner() -> Arc<RecordingJoiner> {
        Arc::new(RecordingJoiner {
            requests: Mutex::new(Vec::new()),
            grant: Rank(4),
        })
    }

    // -------------------------------------------------------------------------
    // Rank-0 bootstrap
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_bootstrap_forces_rank_zero() {
        let tmp = TempDir::new().unwrap();
        let inst = instance(&tmp);
        let joiner = recording_joiner();
        let sysdb = Arc::new(LocalSystemDatabase::new(true, true, None));

        configure_first_engine(&inst, SystemDbStarter::new(sysdb), joiner_fn(joiner.clone()));
        let resp = inst.join_system().await.unwrap();

        assert_eq!(joiner.requests.lock()[0].rank, Some(Rank::ZERO));
        assert_eq!(resp.rank, Rank::ZERO);
        assert_eq!(inst.rank(), Some(Rank::ZERO));
        assert!(inst.has_valid_rank());
    }

    #[tokio::test]
    async fn test_bootstrap_keeps_valid_rank() {
        let tmp = TempDir::new().unwrap();
        let inst = instance(&tmp);
        let joiner = recording_joiner();

        // First join without override establishes rank 4.
        inst.set_join_fn(joiner_fn(joiner.clone()));
        inst.join_system().await.unwrap();
        assert_eq!(inst.rank(), Some(Rank(4)));

        let sysdb = Arc::new(LocalSystemDatabase::new(true, true, None));
        configure_first_engine(&inst, SystemDbStarter::new(sysdb), joiner_fn(joiner.clone()));
        inst.join_system().await.unwrap();

        let requests = joiner.requests.lock();
        assert_eq!(requests[1].rank, Some(Rank(4)));
        assert_eq!(inst.rank(), Some(Rank(4)));
    }

    #[tokio::test]
    async fn test_non_bootstrap_replica_only_starts_db() {
        let tmp = TempDir::new().unwrap();
        let inst = instance(&tmp);
        let joiner = recording_joiner();
        inst.set_join_fn(joiner_fn(joiner.clone()));
        let sysdb = Arc::new(LocalSystemDatabase::new(true, false, None));

        configure_first_engine(&inst, SystemDbStarter::new(sysdb.clone()), joiner_fn(joiner.clone()));
        inst.join_system().await.unwrap();
        assert_eq!(joiner.requests.lock()[0].rank, None);

        inst.start_incarnation();
        inst.report(EngineStatus::StorageReady).await.unwrap();
        assert!(sysdb.is_started());
    }

    #[tokio::test]
    async fn test_non_replica_is_untouched() {
        let tmp = TempDir::new().unwrap();
        let inst = instance(&tmp);
        let sysdb = Arc::new(LocalSystemDatabase::new(false, false, None));

        configure_first_engine(&inst, SystemDbStarter::new(sysdb.clone()), joiner_fn(recording_joiner()));
        inst.start_incarnation();
        inst.report(EngineStatus::StorageReady).await.unwrap();
        assert!(!sysdb.is_started());
    }

    #[tokio::test]
    async fn test_sysdb_start_failure_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let inst = instance(&tmp);
        // A regular file where the raft directory should go.
        let blocker = tmp.path().join("raft");
        std::fs::write(&blocker, "").unwrap();
        let sysdb = Arc::new(LocalSystemDatabase::new(true, false, Some(blocker.join("db"))));

        configure_first_engine(&inst, SystemDbStarter::new(sysdb), joiner_fn(recording_joiner()));
        inst.start_incarnation();
        assert_matches!(inst.report(EngineStatus::StorageReady).await, Err(Error::SystemDb(_)));
    }

    /// Replica database that counts start attempts and never guards itself
    struct SlowDb {
        starts: AtomicUsize,
        started: AtomicBool,
        leadership: tokio::sync::watch::Sender<Leadership>,
    }

    impl SlowDb {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                starts: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                leadership: tokio::sync::watch::channel(Leadership::Unknown).0,
            })
        }
    }

    #[async_trait]
    impl SystemDatabase for SlowDb {
        fn is_replica(&self) -> bool {
            true
        }

        fn is_bootstrap(&self) -> bool {
            false
        }

        fn is_started(&self) -> bool {
            self.started.load(Ordering::SeqCst)
        }

        async fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.started.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn leadership(&self) -> tokio::sync::watch::Receiver<Leadership> {
            self.leadership.subscribe()
        }

        fn handle_event(&self, _event: &Event) {}
    }

    #[tokio::test]
    async fn test_sysdb_started_once_under_overlapping_entries() {
        let db = SlowDb::new();
        let starter = SystemDbStarter::new(db.clone());

        let (a, b, c) = tokio::join!(starter.start(), starter.start(), starter.start());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(db.starts.load(Ordering::SeqCst), 1);

        starter.start().await.unwrap();
        assert_eq!(db.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_storage_ready_and_leadership_start_db_once() {
        let tmp = TempDir::new().unwrap();
        let db = SlowDb::new();
        let mut d = deps(tmp.path(), Arc::new(LocalSystemDatabase::new(false, false, None)));
        d.sysdb = db.clone();
        let orch = Orchestrator::new(server_config(tmp.path(), 1), d).unwrap();

        let inst = orch.harness().instance(0).unwrap();
        configure_first_engine(&inst, orch.sysdb_starter.clone(), joiner_fn(recording_joiner()));
        inst.start_incarnation();

        let (ready, leader) = tokio::join!(
            inst.report(EngineStatus::StorageReady),
            orch.handle_leadership(Leadership::Leader)
        );
        ready.unwrap();
        leader.unwrap();
        assert_eq!(db.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_db_start_is_not_retried() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("raft");
        std::fs::write(&blocker, "").unwrap();
        let db = Arc::new(LocalSystemDatabase::new(true, false, Some(blocker.join("db"))));
        let starter = SystemDbStarter::new(db.clone());

        assert_matches!(starter.start().await, Err(Error::SystemDb(_)));
        std::fs::remove_file(&blocker).unwrap();
        assert_matches!(starter.start().await, Err(Error::SystemDb(_)));
        assert!(!db.is_started());
    }

    // -------------------------------------------------------------------------
    // Engine callbacks
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_engine_callbacks_publish_events() {
        let tmp = TempDir::new().unwrap();
        let orch = Orchestrator::new(
            server_config(tmp.path(), 1),
            deps(tmp.path(), Arc::new(LocalSystemDatabase::new(false, false, None))),
        )
        .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        orch.bus()
            .subscribe(EventFilter::Any, handler_fn(move |e| s.lock().push((e.id, e.msg.clone()))));

        let inst = orch.harness().instance(0).unwrap();
        orch.register_engine_callbacks(&inst);

        inst.start_incarnation();
        inst.report(EngineStatus::AwaitingFormat).await.unwrap();
        inst.report(EngineStatus::Exited(ExitStatus::new(Some(1), "segfault")))
            .await
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen[0].0, EventId::EngineFormatRequired);
        assert_eq!(seen[1].0, EventId::EngineDied);
        assert!(seen[1].1.contains("segfault"));
    }

    #[tokio::test]
    async fn test_ready_counts_once_per_instance() {
        let tmp = TempDir::new().unwrap();
        let orch = Orchestrator::new(
            server_config(tmp.path(), 2),
            deps(tmp.path(), Arc::new(LocalSystemDatabase::new(false, false, None))),
        )
        .unwrap();
        let inst = orch.harness().instance(0).unwrap();
        orch.register_engine_callbacks(&inst);

        for _ in 0..2 {
            inst.start_incarnation();
            inst.report(EngineStatus::StorageReady).await.unwrap();
            inst.report(EngineStatus::Ready).await.unwrap();
        }
        assert_eq!(orch.all_started.remaining(), 1);
    }

    // -------------------------------------------------------------------------
    // Fabric and bdev config
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_update_fabric_env() {
        let fabric = StaticFabric(Ok("mlx5_0".into()));

        let mut cfg = EngineConfig::new(0);
        cfg.fabric.provider = "ofi+verbs;ofi_rxm".into();
        cfg.fabric.interface = "ib0".into();
        update_fabric_env(&mut cfg, &fabric).await.unwrap();
        assert_eq!(cfg.env_vars, vec!["OFI_DOMAIN=mlx5_0"]);

        // Already set: untouched.
        update_fabric_env(&mut cfg, &fabric).await.unwrap();
        assert_eq!(cfg.env_vars.len(), 1);

        let mut cfg = EngineConfig::new(0);
        cfg.fabric.provider = "ofi+tcp".into();
        update_fabric_env(&mut cfg, &fabric).await.unwrap();
        assert!(cfg.env_vars.is_empty());

        let mut cfg = EngineConfig::new(0);
        cfg.fabric.provider = "ofi+verbs".into();
        cfg.fabric.interface = "ib9".into();
        let res = update_fabric_env(&mut cfg, &StaticFabric(Err(Error::Internal("x".into())))).await;
        assert_matches!(res, Err(Error::FabricAlias { interface, .. }) if interface == "ib9");
    }

    #[test]
    fn test_gen_bdev_configs() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = server_config(tmp.path(), 2);
        cfg.engines[0].storage.bdev =
            BdevTier::new(vec![BdevConfig::new(BdevClass::Nvme).with_devices(["0000:81:00.0"])]);
        let orch = Orchestrator::new(
            cfg,
            deps(tmp.path(), Arc::new(LocalSystemDatabase::new(false, false, None))),
        )
        .unwrap();

        orch.gen_bdev_configs().unwrap();

        let first = orch.harness().instance(0).unwrap().config();
        let path = first.storage.bdev.config_path.clone().unwrap();
        assert_eq!(path, tmp.path().join("daos0/daos_nvme.conf"));
        assert!(std::fs::read_to_string(&path).unwrap().contains("[Nvme]"));
        assert_eq!(first.storage.bdev.vos_env(), Some(VosEnv::Nvme));

        let second = orch.harness().instance(1).unwrap().config();
        assert_eq!(second.storage.bdev.config_path, None);
        assert!(!tmp.path().join("daos1/daos_nvme.conf").exists());
    }

    // -------------------------------------------------------------------------
    // Leadership
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_handle_leadership() {
        let tmp = TempDir::new().unwrap();
        let sysdb = Arc::new(LocalSystemDatabase::new(true, true, None));
        let orch = Orchestrator::new(server_config(tmp.path(), 1), deps(tmp.path(), sysdb.clone())).unwrap();
        assert_eq!(orch.profile(), SubscriptionProfile::Initial);

        orch.handle_leadership(Leadership::Leader).await.unwrap();
        assert!(sysdb.is_started());
        assert_eq!(orch.profile(), SubscriptionProfile::Leader);
        assert_eq!(orch.bus().subscription_count(), 4);

        orch.handle_leadership(Leadership::Follower).await.unwrap();
        assert_eq!(orch.profile(), SubscriptionProfile::Follower);
        assert_eq!(orch.bus().subscription_count(), 2);
    }

    // -------------------------------------------------------------------------
    // Full start
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_start_runs_engines_until_shutdown() {
        let tmp = TempDir::new().unwrap();
        let sysdb = Arc::new(LocalSystemDatabase::new(true, true, Some(tmp.path().join("raft"))));
        let orch = Orchestrator::new(server_config(tmp.path(), 2), deps(tmp.path(), sysdb.clone())).unwrap();
        orch.format_all().unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        orch.on_engines_started(Box::new(move |_: CancellationToken| {
            async move {
                let _ = tx.send(()).await;
                Ok::<_, Error>(())
            }
            .boxed()
        }));

        let shutdown = CancellationToken::new();
        let o = orch.clone();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { o.start(token).await });

        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();

        // Standalone database becomes leader once started by instance 0.
        let first = orch.harness().instance(0).unwrap();
        assert_eq!(first.rank(), Some(Rank::ZERO));
        assert!(orch.harness().instance(1).unwrap().has_valid_rank());
        while orch.profile() != SubscriptionProfile::Leader {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert!(!sysdb.is_started());
    }
}
