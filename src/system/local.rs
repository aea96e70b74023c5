//! Standalone Collaborators
//!
//! In-process implementations of the system ports, enough to run a single
//! node without an external management service.

use crate::domain::ports::{
    EventForwarder, FabricResolver, GroupUpdater, JoinRequest, JoinResponse, Leadership, Membership, Rank,
    SystemDatabase, SystemJoiner,
};
use crate::error::{Error, Result};
use crate::events::{Event, EventId};
use crate::server::config::ServerConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

// =============================================================================
// System Database
// =============================================================================

/// Single-node stand-in for the replicated system database
///
/// Starting it makes this node the leader.
pub struct LocalSystemDatabase {
    replica: bool,
    bootstrap: bool,
    raft_dir: Option<PathBuf>,
    started: AtomicBool,
    leadership: watch::Sender<Leadership>,
    applied: AtomicU64,
}

impl LocalSystemDatabase {
    pub fn new(replica: bool, bootstrap: bool, raft_dir: Option<PathBuf>) -> Self {
        let (leadership, _) = watch::channel(Leadership::Unknown);
        Self {
            replica,
            bootstrap,
            raft_dir,
            started: AtomicBool::new(false),
            leadership,
            applied: AtomicU64::new(0),
        }
    }

    /// Derive the replica role of `hostname` from the access points
    ///
    /// The node is a replica if an access point resolves to a loopback
    /// address or to one of its own addresses; it bootstraps if that is the
    /// first access point.
    pub fn from_config(cfg: &ServerConfig, hostname: &str) -> Result<Self> {
        let replicas = cfg.replica_addrs()?;
        let local: HashSet<IpAddr> = (hostname, 0)
            .to_socket_addrs()
            .map(|addrs| addrs.map(|a| a.ip()).collect())
            .unwrap_or_default();
        let is_local = |ip: IpAddr| ip.is_loopback() || local.contains(&ip);

        let replica = replicas.iter().any(|a| is_local(a.ip()));
        let bootstrap = replicas.first().map_or(false, |a| is_local(a.ip()));
        debug!("system database: replica={} bootstrap={}", replica, bootstrap);

        Ok(Self::new(replica, bootstrap, cfg.raft_dir()))
    }

    /// Number of state-change events applied
    pub fn applied_events(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SystemDatabase for LocalSystemDatabase {
    fn is_replica(&self) -> bool {
        self.replica
    }

    fn is_bootstrap(&self) -> bool {
        self.bootstrap
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    async fn start(&self) -> Result<()> {
        if let Some(dir) = &self.raft_dir {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::SystemDb(format!("create {}: {}", dir.display(), e)))?;
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("system database started");
        self.leadership.send_replace(Leadership::Leader);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.started.swap(false, Ordering::AcqRel) {
            info!("system database stopped");
            self.leadership.send_replace(Leadership::Unknown);
        }
        Ok(())
    }

    fn leadership(&self) -> watch::Receiver<Leadership> {
        self.leadership.subscribe()
    }

    fn handle_event(&self, event: &Event) {
        debug!("system database applying {}", event.id);
        self.applied.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Membership
// =============================================================================

/// State of a system member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    Joined,
    Dead,
}

/// One engine instance known to the system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub rank: Rank,
    pub uuid: Uuid,
    pub hostname: String,
    pub instance_idx: u32,
    pub state: MemberState,
    pub updated_at: DateTime<Utc>,
}

/// In-memory membership table that also serves joins
///
/// Rank 0 is only granted when asked for, so it stays free for the
/// bootstrap instance.
#[derive(Debug, Default)]
pub struct LocalMembership {
    members: DashMap<Rank, Member>,
    by_uuid: DashMap<Uuid, Rank>,
    assign: Mutex<()>,
}

impl LocalMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn member(&self, rank: Rank) -> Option<Member> {
        self.members.get(&rank).map(|m| m.clone())
    }

    /// All members ordered by rank
    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.members.iter().map(|m| m.value().clone()).collect();
        members.sort_by_key(|m| m.rank);
        members
    }

    fn set_state(&self, rank: Rank, state: MemberState) -> Result<()> {
        let mut member = self.members.get_mut(&rank).ok_or(Error::RankNotFound { rank })?;
        member.state = state;
        member.updated_at = Utc::now();
        Ok(())
    }

    fn next_free_rank(&self) -> Rank {
        let mut rank = 1;
        while self.members.contains_key(&Rank(rank)) {
            rank += 1;
        }
        Rank(rank)
    }
}

#[async_trait]
impl SystemJoiner for LocalMembership {
    async fn join(&self, req: JoinRequest) -> Result<JoinResponse> {
        let _assign = self.assign.lock();

        if let Some(rank) = self.by_uuid.get(&req.uuid).map(|r| *r) {
            if req.rank.map_or(false, |r| r != rank) {
                return Err(Error::Join(format!(
                    "engine {} holds rank {}, requested {:?}",
                    req.uuid, rank, req.rank
                )));
            }
            self.set_state(rank, MemberState::Joined)?;
            debug!("rank {} rejoined from {}", rank, req.hostname);
            return Ok(JoinResponse { rank });
        }

        let rank = match req.rank {
            Some(rank) if self.members.contains_key(&rank) => {
                return Err(Error::Join(format!("rank {} already in use", rank)));
            }
            Some(rank) => rank,
            None => self.next_free_rank(),
        };

        self.members.insert(
            rank,
            Member {
                rank,
                uuid: req.uuid,
                hostname: req.hostname.clone(),
                instance_idx: req.instance_idx,
                state: MemberState::Joined,
                updated_at: Utc::now(),
            },
        );
        self.by_uuid.insert(req.uuid, rank);
        info!("rank {} joined ({} instance {})", rank, req.hostname, req.instance_idx);

        Ok(JoinResponse { rank })
    }
}

impl Membership for LocalMembership {
    fn mark_rank_dead(&self, rank: Rank) -> Result<()> {
        self.set_state(rank, MemberState::Dead)
    }

    fn handle_event(&self, event: &Event) {
        let Some(rank) = event.rank else {
            return;
        };
        let res = match event.id {
            EventId::EngineDied => self.set_state(rank, MemberState::Dead),
            EventId::SwimRankAlive => self.set_state(rank, MemberState::Joined),
            _ => Ok(()),
        };
        if let Err(e) = res {
            debug!("membership ignoring {}: {}", event.id, e);
        }
    }
}

// =============================================================================
// Group Updates and Forwarding
// =============================================================================

/// Counts group update requests; there is no group to broadcast to
#[derive(Debug, Default)]
pub struct LocalGroupUpdater {
    requests: AtomicU64,
}

impl LocalGroupUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

impl GroupUpdater for LocalGroupUpdater {
    fn request_group_update(&self) {
        let n = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("group update requested ({} so far)", n);
    }
}

/// Forwarder logging events that would go to a remote leader
#[derive(Debug, Default)]
pub struct LoggingForwarder {
    forwarded: AtomicU64,
}

impl LoggingForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }
}

impl EventForwarder for LoggingForwarder {
    fn forward(&self, event: &Event) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        match event.to_json() {
            Ok(payload) => debug!(event_id = %event.id, "no leader to forward to: {}", payload),
            Err(e) => warn!("{}", e),
        }
    }
}

// =============================================================================
// Fabric
// =============================================================================

/// Resolves interface aliases from the InfiniBand links in sysfs
#[derive(Debug, Clone)]
pub struct SysfsFabricResolver {
    sysfs_path: PathBuf,
}

impl Default for SysfsFabricResolver {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl SysfsFabricResolver {
    pub fn new(sysfs_path: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_path: sysfs_path.into(),
        }
    }
}

#[async_trait]
impl FabricResolver for SysfsFabricResolver {
    async fn device_alias(&self, interface: &str) -> Result<String> {
        let fault = |reason: String| Error::FabricAlias {
            interface: interface.to_string(),
            reason,
        };

        let dir = self
            .sysfs_path
            .join("class/net")
            .join(interface)
            .join("device/infiniband");
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| fault(format!("{}: {}", dir.display(), e)))?;

        match entries.next_entry().await {
            Ok(Some(entry)) => Ok(entry.file_name().to_string_lossy().into_owned()),
            Ok(None) => Err(fault(format!("{} is empty", dir.display()))),
            Err(e) => {
                warn!("reading {}: {}", dir.display(), e);
                Err(fault(e.to_string()))
            }
        }
    }
}
