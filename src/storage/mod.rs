//! Storage Module
//!
//! Storage configuration, host probing, and bdev preparation and config
//! generation for engine instances.

pub mod bdev;
pub mod config;
pub mod host;

pub use bdev::*;
pub use config::*;
pub use host::*;
