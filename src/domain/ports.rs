//! Domain Ports - Boundaries to the collaborators around the control plane
//!
//! The system database, membership tracker, join service and fabric detection
//! live outside this crate. These traits define what the control plane needs
//! from them; adapters implement the traits.

use crate::error::Result;
use crate::events::Event;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

// =============================================================================
// Rank
// =============================================================================

/// Cluster-wide unique identity of a joined engine instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rank(pub u32);

impl Rank {
    pub const ZERO: Rank = Rank(0);
}

impl std::fmt::Display for Rank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Rank {
    fn from(r: u32) -> Self {
        Self(r)
    }
}

// =============================================================================
// System Join
// =============================================================================

/// Request sent when an engine instance joins the system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Engine UUID from the superblock
    pub uuid: Uuid,
    /// Requested rank, `None` lets the membership service assign one
    pub rank: Option<Rank>,
    /// Host the instance runs on
    pub hostname: String,
    /// Instance index on the host
    pub instance_idx: u32,
}

/// Result of a successful join
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    /// Rank assigned to the instance
    pub rank: Rank,
}

/// Port for joining engine instances to the system
#[async_trait]
pub trait SystemJoiner: Send + Sync {
    /// Join an instance and obtain its rank
    async fn join(&self, req: JoinRequest) -> Result<JoinResponse>;
}

// =============================================================================
// System Database Port
// =============================================================================

/// Leadership role of this node in the system database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Leadership {
    /// No leadership information yet
    Unknown,
    /// This node is the metadata leader
    Leader,
    /// Another node is the metadata leader
    Follower,
}

/// Port for the RAFT-backed system database
#[async_trait]
pub trait SystemDatabase: Send + Sync {
    /// Whether this node hosts a database replica
    fn is_replica(&self) -> bool;

    /// Whether this node hosts the bootstrap replica
    fn is_bootstrap(&self) -> bool;

    /// Whether the database has been started on this node
    fn is_started(&self) -> bool;

    /// Start the local replica
    async fn start(&self) -> Result<()>;

    /// Stop the local replica
    async fn stop(&self) -> Result<()>;

    /// Observe leadership transitions
    fn leadership(&self) -> watch::Receiver<Leadership>;

    /// Apply a state-change event to the database
    fn handle_event(&self, event: &Event);
}

// =============================================================================
// Membership Port
// =============================================================================

/// Port for the system membership tracker
pub trait Membership: Send + Sync {
    /// Mark a rank unavailable for new resource assignments
    fn mark_rank_dead(&self, rank: Rank) -> Result<()>;

    /// Apply a state-change event to membership
    fn handle_event(&self, event: &Event);
}

/// Port for requesting a system group-map update broadcast
pub trait GroupUpdater: Send + Sync {
    /// Request a group update; must not block
    fn request_group_update(&self);
}

// =============================================================================
// Event Forwarding Port
// =============================================================================

/// Port for forwarding local events to the management service leader
pub trait EventForwarder: Send + Sync {
    /// Queue `event` for delivery; must not block
    fn forward(&self, event: &Event);
}

// =============================================================================
// Fabric Port
// =============================================================================

/// Port for network fabric detection
#[async_trait]
pub trait FabricResolver: Send + Sync {
    /// Resolve the device alias (e.g. `hfi1_0`) of a fabric interface
    async fn device_alias(&self, interface: &str) -> Result<String>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type SystemJoinerRef = Arc<dyn SystemJoiner>;
pub type SystemDatabaseRef = Arc<dyn SystemDatabase>;
pub type MembershipRef = Arc<dyn Membership>;
pub type GroupUpdaterRef = Arc<dyn GroupUpdater>;
pub type FabricResolverRef = Arc<dyn FabricResolver>;
pub type EventForwarderRef = Arc<dyn EventForwarder>;
