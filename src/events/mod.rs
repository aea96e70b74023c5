//! Events Module
//!
//! Event types and the node-local publish/subscribe bus.

pub mod event;
pub mod pubsub;

pub use event::*;
pub use pubsub::*;
