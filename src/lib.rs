//! Engine Control Plane
//!
//! Node-local control plane of a multi-process storage server. It prepares
//! the host's block storage, generates engine storage configs, and starts
//! and supervises the storage engines, routing their lifecycle and
//! membership events according to the node's leadership role.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                         Server Orchestrator                           │
//! │   bdev prep ─► bdev config gen ─► engine callbacks ─► harness start   │
//! ├──────────────────────────────┬────────────────────────────────────────┤
//! │        Engine Harness        │               Event Bus                │
//! │  ┌────────────────────────┐  │  Initial │ Leader │ Follower profiles  │
//! │  │ EngineInstance 0..n    │──┼─► engine_died, format_required, ...    │
//! │  │ phases, latches, rank  │  │                                        │
//! │  └────────────────────────┘  │                                        │
//! ├──────────────────────────────┴────────────────────────────────────────┤
//! │   Storage: host probe │ bdev preparer │ bdev class provider           │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │   Ports: system db │ membership │ joiner │ forwarder │ fabric         │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`server`]: Orchestrator, node configuration, subscriptions, telemetry
//! - [`engine`]: Engine instance lifecycle, superblock, process runner
//! - [`storage`]: Bdev tiers, preparation and config generation, host probe
//! - [`events`]: Event types and the node event bus
//! - [`system`]: Standalone system collaborators
//! - [`domain`]: Ports to external collaborators
//! - [`error`]: Error types and fault classes

pub mod domain;
pub mod engine;
pub mod error;
pub mod events;
pub mod server;
pub mod storage;
pub mod system;

// Re-export commonly used types
pub use domain::ports::{
    EventForwarder, FabricResolver, GroupUpdater, JoinRequest, JoinResponse, Leadership, Membership,
    Rank, SystemDatabase, SystemJoiner,
};

pub use engine::{
    EngineConfig, EngineHarness, EngineInstance, EnginePhase, EngineRunner, EngineStatus, ProcessRunner,
    Superblock,
};

pub use error::{Error, FaultClass, Result};

pub use events::{Event, EventFilter, EventId, EventType, PubSub};

pub use server::{Orchestrator, OrchestratorDeps, ServerConfig, SubscriptionProfile};

pub use storage::{
    BdevClass, BdevConfig, BdevPreparer, BdevTier, ClassProvider, HostProbe, PrepareRequest,
    SpdkSetupScript, TargetUser,
};

pub use system::{
    LocalGroupUpdater, LocalMembership, LocalSystemDatabase, LoggingForwarder, SysfsFabricResolver,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
