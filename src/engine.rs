use crate::{
    config::{
        Config,
        Timings,
    },
    error::Result,
    panel::PanelApi,
    reconcile::{
        self,
        PassReport,
    },
    resources::RoutingStore,
    state::SyncState,
};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Everything a reconciliation pass works with: both backends, the caches and the single-flight
/// guard.
pub struct Engine {
    config: Config,
    timings: Timings,
    panel: Arc<dyn PanelApi>,
    cluster: Arc<dyn RoutingStore>,
    state: SyncState,
    /// Held for the whole pass. Counts the passes that actually ran.
    passes: Mutex<u64>,
}

#[derive(Debug)]
pub enum PassOutcome {
    /// Another pass was running; nothing was done.
    Skipped,
    Completed(PassReport),
}

impl Engine {
    pub fn new(config: Config, panel: Arc<dyn PanelApi>, cluster: Arc<dyn RoutingStore>) -> Self {
        Self {
            config,
            timings: Timings::default(),
            panel,
            cluster,
            state: SyncState::new(),
            passes: Mutex::new(0),
        }
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    pub fn panel(&self) -> &dyn PanelApi {
        self.panel.as_ref()
    }

    pub fn cluster(&self) -> &dyn RoutingStore {
        self.cluster.as_ref()
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    /// Runs one reconciliation pass unless one is already in progress, in which case this returns
    /// [`PassOutcome::Skipped`] immediately.
    pub async fn reconcile_pass(&self) -> Result<PassOutcome> {
        let Ok(mut passes) = self.passes.try_lock() else {
            debug!("reconciliation already running, dropping request");
            return Ok(PassOutcome::Skipped);
        };

        *passes += 1;
        let pass = *passes;

        reconcile::run_pass(self, pass).await.map(PassOutcome::Completed)
    }
}
