//! System Module
//!
//! Standalone implementations of the system collaborators.

pub mod local;

pub use local::*;
