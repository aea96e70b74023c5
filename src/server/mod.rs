//! Server Module
//!
//! Node-level configuration and the orchestrator bringing the node's
//! engines up.

pub mod bdev_prep;
pub mod config;
pub mod orchestrator;
pub mod subscriptions;
pub mod telemetry;

pub use bdev_prep::*;
pub use config::*;
pub use orchestrator::*;
pub use subscriptions::*;
pub use telemetry::*;
