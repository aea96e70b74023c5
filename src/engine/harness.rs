//! Engine Harness
//!
//! Owns the engine instances of this node and runs their supervision tasks.

use super::instance::EngineInstance;
use super::runner::EngineRunner;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// =============================================================================
// Startup Barrier
// =============================================================================

/// Counts instances down to "all engines started"
#[derive(Debug)]
pub struct StartupBarrier {
    remaining: watch::Sender<usize>,
}

impl StartupBarrier {
    pub fn new(count: usize) -> Self {
        let (remaining, _) = watch::channel(count);
        Self { remaining }
    }

    /// Record one arrival; returns true for the arrival that opens the barrier
    pub fn arrive(&self) -> bool {
        let mut opened = false;
        self.remaining.send_if_modified(|n| {
            if *n == 0 {
                return false;
            }
            *n -= 1;
            opened = *n == 0;
            true
        });
        opened
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.borrow()
    }

    /// Wait until every instance has arrived
    pub async fn wait(&self) {
        let mut rx = self.remaining.subscribe();
        // The sender lives in self, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Set of engine instances managed by this node
#[derive(Debug, Default)]
pub struct EngineHarness {
    instances: RwLock<Vec<Arc<EngineInstance>>>,
    started: AtomicBool,
}

impl EngineHarness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance; only allowed before [`EngineHarness::start`]
    pub fn add_instance(&self, instance: Arc<EngineInstance>) -> Result<()> {
        if self.is_started() {
            return Err(Error::Internal(format!(
                "instance {} added after harness start",
                instance.index()
            )));
        }
        self.instances.write().push(instance);
        Ok(())
    }

    pub fn instances(&self) -> Vec<Arc<EngineInstance>> {
        self.instances.read().clone()
    }

    pub fn instance(&self, index: u32) -> Option<Arc<EngineInstance>> {
        self.instances
            .read()
            .iter()
            .find(|i| i.index() == index)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Supervise all instances until shutdown
    ///
    /// A fatal error from one instance cancels `shutdown` for all of them;
    /// the first such error is returned.
    pub async fn start(&self, runner: Arc<dyn EngineRunner>, shutdown: CancellationToken) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::Internal("harness already started".into()));
        }

        let mut tasks = JoinSet::new();
        for instance in self.instances() {
            info!("starting supervision of instance {}", instance.index());
            tasks.spawn(instance.run(runner.clone(), shutdown.clone()));
        }

        let mut first_err = None;
        while let Some(res) = tasks.join_next().await {
            let err = match res {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(join_err) => Error::Internal(format!("instance task failed: {}", join_err)),
            };
            error!("instance supervision failed: {}", err);
            shutdown.cancel();
            first_err.get_or_insert(err);
        }

        self.started.store(false, Ordering::Release);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
