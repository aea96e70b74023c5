//! Control Plane Events
//!
//! Events raised on this node (or forwarded to it) that describe engine and
//! membership state changes.

use crate::domain::ports::Rank;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type tag of an event, used to route it to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Actionable change of engine or rank state
    StateChange,
    /// Informational notice
    Info,
}

/// Subscription filter over event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFilter {
    /// Match every event
    Any,
    /// Match one event type
    Only(EventType),
}

impl EventFilter {
    pub fn matches(&self, event_type: EventType) -> bool {
        match self {
            EventFilter::Any => true,
            EventFilter::Only(t) => *t == event_type,
        }
    }
}

/// Identifier of what happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventId {
    /// Engine process exited
    EngineDied,
    /// Engine storage needs formatting before it can start
    EngineFormatRequired,
    /// SWIM detected a dead rank
    SwimRankDead,
    /// SWIM detected a rank coming back
    SwimRankAlive,
}

impl EventId {
    /// Event type carried by this id
    pub fn event_type(&self) -> EventType {
        match self {
            EventId::EngineDied | EventId::SwimRankDead | EventId::SwimRankAlive => {
                EventType::StateChange
            }
            EventId::EngineFormatRequired => EventType::Info,
        }
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventId::EngineDied => write!(f, "engine_died"),
            EventId::EngineFormatRequired => write!(f, "engine_format_required"),
            EventId::SwimRankDead => write!(f, "swim_rank_dead"),
            EventId::SwimRankAlive => write!(f, "swim_rank_alive"),
        }
    }
}

/// An event published on the node's event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type: EventType,
    /// Rank the event originated from, if known
    pub rank: Option<Rank>,
    /// Engine instance index on the originating host, if any
    pub instance_idx: Option<u32>,
    pub hostname: String,
    /// Human readable reason
    pub msg: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an event with the type implied by its id
    pub fn new(id: EventId, hostname: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            id,
            event_type: id.event_type(),
            rank: None,
            instance_idx: None,
            hostname: hostname.into(),
            msg: msg.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_rank(mut self, rank: Option<Rank>) -> Self {
        self.rank = rank;
        self
    }

    pub fn with_instance(mut self, idx: u32) -> Self {
        self.instance_idx = Some(idx);
        self
    }

    /// Engine process exit notification
    pub fn engine_died(hostname: &str, instance_idx: u32, rank: Option<Rank>, reason: &str) -> Self {
        Self::new(
            EventId::EngineDied,
            hostname,
            format!("engine instance {} exited: {}", instance_idx, reason),
        )
        .with_rank(rank)
        .with_instance(instance_idx)
    }

    /// Engine storage format required notification
    pub fn format_required(hostname: &str, instance_idx: u32) -> Self {
        Self::new(
            EventId::EngineFormatRequired,
            hostname,
            format!("engine instance {} requires storage format", instance_idx),
        )
        .with_instance(instance_idx)
    }

    /// SWIM dead rank notification
    pub fn rank_dead(hostname: &str, rank: Rank) -> Self {
        Self::new(EventId::SwimRankDead, hostname, format!("rank {} is dead", rank))
            .with_rank(Some(rank))
    }

    /// Check if this event is actionable
    pub fn is_state_change(&self) -> bool {
        self.event_type == EventType::StateChange
    }

    /// Wire payload used when the event leaves this node
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Internal(format!("encode event {}: {}", self.id, e)))
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.rank {
            Some(rank) => write!(f, "{} [{} rank {}]: {}", self.id, self.hostname, rank, self.msg),
            None => write!(f, "{} [{}]: {}", self.id, self.hostname, self.msg),
        }
    }
}
