//! Domain Module
//!
//! Core identity types and the ports to external collaborators.

pub mod ports;

pub use ports::*;
