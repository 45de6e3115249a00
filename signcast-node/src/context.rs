use anyhow::Result;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::controller::SchedulerController;
use crate::diagnostics::Diagnostics;
use crate::kv_store::{JsonFileStore, KeyValueStore};
use crate::program_store::LocalProgramStore;
use crate::repetition::RepetitionLedger;
use crate::scheduler::PlaybackScheduler;
use crate::telemetry::ReproductionTelemetry;

/// Every service of a running node, constructed once and shared by handle.
#[derive(Clone)]
pub struct NodeState {
    pub config: Arc<Config>,
    pub ledger: Arc<RepetitionLedger>,
    pub telemetry: Arc<ReproductionTelemetry>,
    pub controller: Arc<SchedulerController>,
    pub program_store: Arc<LocalProgramStore>,
    pub diagnostics: Option<Arc<Diagnostics>>,
}

impl NodeState {
    pub fn build(config: Config, store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        let ledger = Arc::new(RepetitionLedger::new(store.clone(), clock.clone()));
        let telemetry = Arc::new(ReproductionTelemetry::new(store.clone(), clock.clone()));
        let scheduler = PlaybackScheduler::new(ledger.clone(), telemetry.clone());
        let controller = Arc::new(SchedulerController::new(
            scheduler,
            config.playback_interval(),
        ));
        let program_store = Arc::new(LocalProgramStore::new(store, clock));

        let diagnostics = config.diagnostics.then(|| {
            Arc::new(Diagnostics::new(
                controller.clone(),
                ledger.clone(),
                telemetry.clone(),
            ))
        });

        Self {
            config: Arc::new(config),
            ledger,
            telemetry,
            controller,
            program_store,
            diagnostics,
        }
    }

    /// File-backed store under `config.data_dir`, system clock.
    pub fn from_config(config: Config) -> Result<Self> {
        let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::open(&config.data_dir)?);
        Ok(Self::build(config, store, Arc::new(SystemClock)))
    }
}
