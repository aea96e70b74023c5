//! Bdev Module
//!
//! Block device preparation and SPDK config generation.

pub mod class;
pub mod prepare;

pub use class::*;
pub use prepare::*;
