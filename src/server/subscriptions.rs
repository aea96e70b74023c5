//! Event Subscription Profiles
//!
//! Which handlers receive published events depends on this node's role in
//! the management service. Each role maps to a fixed subscription table;
//! a role change swaps the whole table at once.

use crate::domain::ports::{EventForwarderRef, GroupUpdaterRef, MembershipRef, SystemDatabaseRef};
use crate::events::{
    handler_fn, Event, EventFilter, EventHandler, EventId, EventLogger, EventType, SubscriptionTable,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Routing profile for published events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionProfile {
    /// Before any leadership information: log and forward
    Initial,
    /// Management service leader: handle events locally
    Leader,
    /// Leadership lost: log and forward to the new leader
    Follower,
}

impl std::fmt::Display for SubscriptionProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionProfile::Initial => write!(f, "initial"),
            SubscriptionProfile::Leader => write!(f, "leader"),
            SubscriptionProfile::Follower => write!(f, "follower"),
        }
    }
}

/// Collaborators the subscription tables route events to
#[derive(Clone)]
pub struct SubscriptionTargets {
    pub logger: Arc<dyn EventHandler>,
    pub forwarder: EventForwarderRef,
    pub membership: MembershipRef,
    pub sysdb: SystemDatabaseRef,
    pub group_updater: GroupUpdaterRef,
}

/// Marks dead ranks and requests a group update when that worked
struct RankDeadHandler {
    membership: MembershipRef,
    group_updater: GroupUpdaterRef,
}

impl EventHandler for RankDeadHandler {
    fn on_event(&self, event: &Event) {
        if event.id != EventId::SwimRankDead {
            return;
        }
        let Some(rank) = event.rank else {
            warn!("{} event without rank: {}", event.id, event);
            return;
        };
        match self.membership.mark_rank_dead(rank) {
            Ok(()) => self.group_updater.request_group_update(),
            Err(e) => debug!("rank {} not marked dead: {}", rank, e),
        }
    }
}

impl SubscriptionTargets {
    /// Targets with the default event logger
    pub fn new(
        forwarder: EventForwarderRef,
        membership: MembershipRef,
        sysdb: SystemDatabaseRef,
        group_updater: GroupUpdaterRef,
    ) -> Self {
        Self {
            logger: Arc::new(EventLogger),
            forwarder,
            membership,
            sysdb,
            group_updater,
        }
    }

    fn forwarding(&self) -> Arc<dyn EventHandler> {
        let forwarder = self.forwarder.clone();
        handler_fn(move |event| forwarder.forward(event))
    }

    /// Subscription table for `profile`
    pub fn table(&self, profile: SubscriptionProfile) -> SubscriptionTable {
        let state_change = EventFilter::Only(EventType::StateChange);

        match profile {
            SubscriptionProfile::Initial => SubscriptionTable::new()
                .with(state_change, self.forwarding())
                .with(EventFilter::Any, self.logger.clone()),
            SubscriptionProfile::Leader => {
                let membership = self.membership.clone();
                let sysdb = self.sysdb.clone();
                SubscriptionTable::new()
                    .with(EventFilter::Any, self.logger.clone())
                    .with(state_change, handler_fn(move |e| membership.handle_event(e)))
                    .with(state_change, handler_fn(move |e| sysdb.handle_event(e)))
                    .with(
                        state_change,
                        Arc::new(RankDeadHandler {
                            membership: self.membership.clone(),
                            group_updater: self.group_updater.clone(),
                        }),
                    )
            }
            SubscriptionProfile::Follower => SubscriptionTable::new()
                .with(EventFilter::Any, self.logger.clone())
                .with(state_change, self.forwarding()),
        }
    }
}
