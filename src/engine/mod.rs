//! Engine Module
//!
//! Engine instance lifecycle, persisted identity, process supervision, and
//! the harness holding all instances of a node.

pub mod config;
pub mod harness;
pub mod instance;
pub mod runner;
pub mod superblock;

pub use config::*;
pub use harness::*;
pub use instance::*;
pub use runner::*;
pub use superblock::*;
